use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: Option<i64>,
    pub label: Option<String>,
}

impl Category {
    pub fn new(id: Option<i64>, label: Option<String>) -> Self {
        Self { id, label }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: i64,
    pub edsm_id: Option<i64>,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub population: Option<i64>,
    pub is_populated: Option<bool>,
    pub government: Category,
    pub allegiance: Category,
    pub security: Category,
    pub primary_economy: Category,
    pub reserve_type: Category,
    pub controlling_minor_faction: Category,
    pub power: Option<String>,
    pub power_state: Option<String>,
    pub needs_permit: Option<bool>,
    pub updated_at: Option<i64>,
}

impl CatalogEntry {
    pub fn distance_to(&self, other: &CatalogEntry) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Only `id`, `name` and the coordinates are mandatory. Everything else may be
/// missing or `null`, but a present value of the wrong type still fails the
/// decode.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemRecord {
    pub id: i64,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub edsm_id: Option<i64>,
    #[serde(default)]
    pub population: Option<i64>,
    #[serde(default)]
    pub is_populated: Option<bool>,
    #[serde(default)]
    pub government_id: Option<i64>,
    #[serde(default)]
    pub government: Option<String>,
    #[serde(default)]
    pub allegiance_id: Option<i64>,
    #[serde(default)]
    pub allegiance: Option<String>,
    #[serde(default)]
    pub security_id: Option<i64>,
    #[serde(default)]
    pub security: Option<String>,
    #[serde(default)]
    pub primary_economy_id: Option<i64>,
    #[serde(default)]
    pub primary_economy: Option<String>,
    #[serde(default)]
    pub power: Option<String>,
    #[serde(default)]
    pub power_state: Option<String>,
    #[serde(default)]
    pub needs_permit: Option<bool>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub controlling_minor_faction_id: Option<i64>,
    #[serde(default)]
    pub controlling_minor_faction: Option<String>,
    #[serde(default)]
    pub reserve_type_id: Option<i64>,
    #[serde(default)]
    pub reserve_type: Option<String>,
}

impl From<SystemRecord> for CatalogEntry {
    fn from(record: SystemRecord) -> Self {
        Self {
            id: record.id,
            edsm_id: record.edsm_id,
            name: record.name,
            x: record.x,
            y: record.y,
            z: record.z,
            population: record.population,
            is_populated: record.is_populated,
            government: Category::new(record.government_id, record.government),
            allegiance: Category::new(record.allegiance_id, record.allegiance),
            security: Category::new(record.security_id, record.security),
            primary_economy: Category::new(record.primary_economy_id, record.primary_economy),
            reserve_type: Category::new(record.reserve_type_id, record.reserve_type),
            controlling_minor_faction: Category::new(
                record.controlling_minor_faction_id,
                record.controlling_minor_faction,
            ),
            power: record.power,
            power_state: record.power_state,
            needs_permit: record.needs_permit,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessPhase {
    Fresh,
    Stale,
    RefreshInProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub state: FreshnessPhase,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub refresh_interval_hours: u32,
    pub system_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Skipped,
    Refreshed { rows: u64, resets: u32 },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearestControlledQuery {
    #[serde(default)]
    pub power: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearestSystemResponse {
    pub reference: CatalogEntry,
    pub nearest: CatalogEntry,
    pub distance: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlliedSystemReport {
    pub current_system: Option<CatalogEntry>,
    pub power: Option<String>,
    pub nearest: Option<CatalogEntry>,
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommanderSummary {
    pub cmdr_name: String,
    pub credit_balance: Option<i64>,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub allied: AlliedSystemReport,
}
