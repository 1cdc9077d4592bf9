use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

const NEVER: &str = "never";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedFreshness {
    last_refresh_at: String,
    refresh_interval_hours: u32,
}

#[derive(Debug)]
pub struct FreshnessTracker {
    state_path: PathBuf,
    source_path: PathBuf,
    refresh_interval_hours: u32,
    last_refresh_at: Option<DateTime<Utc>>,
}

impl FreshnessTracker {
    pub fn load(state_path: &Path, source_path: &Path, refresh_interval_hours: u32) -> Self {
        let last_refresh_at = match fs::read_to_string(state_path) {
            Ok(raw) => parse_persisted(&raw).unwrap_or_else(|| {
                warn!(
                    path = %state_path.display(),
                    "Unreadable freshness state, treating cache as never refreshed"
                );
                None
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    path = %state_path.display(),
                    "Failed reading freshness state: {err}"
                );
                None
            }
        };

        Self {
            state_path: state_path.to_path_buf(),
            source_path: source_path.to_path_buf(),
            refresh_interval_hours: refresh_interval_hours.max(1),
            last_refresh_at,
        }
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.last_refresh_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_due(
            self.last_refresh_at,
            &self.source_path,
            self.refresh_interval_hours,
            now,
        )
    }

    /// Updates the in-memory timestamp only. Call [`persist`](Self::persist)
    /// to write it out.
    pub fn set_last_refresh_at(&mut self, at: DateTime<Utc>) {
        self.last_refresh_at = Some(at);
    }

    pub fn persist(&self) -> Result<()> {
        let state = PersistedFreshness {
            last_refresh_at: self
                .last_refresh_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| NEVER.to_string()),
            refresh_interval_hours: self.refresh_interval_hours,
        };
        let body = serde_json::to_vec_pretty(&state).map_err(|err| self.state_error(err))?;

        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.state_error(err))?;
        }
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, body).map_err(|err| self.state_error(err))?;
        fs::rename(&tmp_path, &self.state_path).map_err(|err| self.state_error(err))?;

        debug!(
            path = %self.state_path.display(),
            last_refresh_at = %state.last_refresh_at,
            "Persisted freshness state"
        );
        Ok(())
    }

    pub fn mark_refreshed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.set_last_refresh_at(now);
        self.persist()
    }

    fn state_error(&self, err: impl std::fmt::Display) -> CacheError {
        CacheError::FreshnessState {
            path: self.state_path.clone(),
            message: err.to_string(),
        }
    }
}

fn parse_persisted(raw: &str) -> Option<Option<DateTime<Utc>>> {
    let state: PersistedFreshness = serde_json::from_str(raw).ok()?;
    if state.last_refresh_at == NEVER {
        return Some(None);
    }
    DateTime::parse_from_rfc3339(&state.last_refresh_at)
        .ok()
        .map(|at| Some(at.with_timezone(&Utc)))
}

/// Staleness in whole hours; sub-hour remainders are dropped. A missing bulk
/// file is always due.
pub fn is_due(
    last_refresh_at: Option<DateTime<Utc>>,
    source_path: &Path,
    refresh_interval_hours: u32,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = last_refresh_at else {
        return true;
    };
    if !source_path.is_file() {
        return true;
    }
    (now - last).num_hours() >= i64::from(refresh_interval_hours.max(1))
}
