use std::{
    collections::HashSet,
    fs, io, iter, mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, RwLock,
    },
};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::{
    error::{CacheError, Result},
    models::{CatalogEntry, Category},
};

pub const STORE_SCHEMA_VERSION: &str = "ed-systems.v1";

pub const EXPECTED_TABLES: [&str; 2] = ["systems", "systems_meta"];

const CONTROL_STATE: &str = "Control";

const RESET_SQL: &str = "
    DROP TABLE IF EXISTS systems;
    DROP TABLE IF EXISTS systems_meta;
    CREATE TABLE systems (
        id INTEGER PRIMARY KEY,
        edsm_id INTEGER,
        name TEXT NOT NULL,
        x REAL NOT NULL,
        y REAL NOT NULL,
        z REAL NOT NULL,
        population INTEGER,
        is_populated INTEGER,
        government_id INTEGER,
        government TEXT,
        allegiance_id INTEGER,
        allegiance TEXT,
        security_id INTEGER,
        security TEXT,
        primary_economy_id INTEGER,
        primary_economy TEXT,
        power TEXT,
        power_state TEXT,
        needs_permit INTEGER,
        updated_at INTEGER,
        controlling_minor_faction_id INTEGER,
        controlling_minor_faction TEXT,
        reserve_type_id INTEGER,
        reserve_type TEXT
    );
    CREATE INDEX idx_systems_name ON systems (name);
    CREATE INDEX idx_systems_power ON systems (power, power_state);
    CREATE TABLE systems_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const SYSTEM_COLUMNS: &str = "id,edsm_id,name,x,y,z,population,is_populated,government_id,government,allegiance_id,allegiance,security_id,security,primary_economy_id,primary_economy,power,power_state,needs_permit,updated_at,controlling_minor_faction_id,controlling_minor_faction,reserve_type_id,reserve_type";

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO systems (id,edsm_id,name,x,y,z,population,is_populated,government_id,government,allegiance_id,allegiance,security_id,security,primary_economy_id,primary_economy,power,power_state,needs_permit,updated_at,controlling_minor_faction_id,controlling_minor_faction,reserve_type_id,reserve_type) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24)";

pub trait CatalogWriter: Send + Sync + 'static {
    fn reset(&self) -> Result<()>;

    fn upsert_many(&self, rows: &[CatalogEntry]) -> Result<usize>;
}

/// Writes go through a single connection and hold the gate exclusively, so a
/// reader never observes a half-reset table.
pub struct SystemStore {
    path: PathBuf,
    gate: RwLock<()>,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    // Set while the connections point at in-memory placeholders.
    detached: AtomicBool,
}

impl SystemStore {
    pub fn open(path: &Path, read_pool_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| CacheError::StorageUnavailable {
                path: path.to_path_buf(),
                message: format!("failed creating {}: {err}", parent.display()),
            })?;
        }

        let writer = open_connection(path)?;
        let existing = list_tables(&writer).map_err(|err| unavailable(path, err))?;
        let missing: Vec<&str> = EXPECTED_TABLES
            .iter()
            .copied()
            .filter(|table| !existing.contains(*table))
            .collect();
        if !missing.is_empty() {
            info!(
                path = %path.display(),
                missing = ?missing,
                "Store schema incomplete, resetting"
            );
            apply_reset(&writer).map_err(|err| unavailable(path, err))?;
        }

        let mut readers = Vec::with_capacity(read_pool_size.max(1));
        for _ in 0..read_pool_size.max(1) {
            readers.push(Mutex::new(open_connection(path)?));
        }

        debug!(path = %path.display(), readers = readers.len(), "Opened systems store");
        Ok(Self {
            path: path.to_path_buf(),
            gate: RwLock::new(()),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<CatalogEntry>> {
        let _shared = self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = self.reader();
        conn.prepare_cached(&format!("SELECT {SYSTEM_COLUMNS} FROM systems WHERE id = ?1"))
            .and_then(|mut stmt| stmt.query_row([id], row_to_entry).optional())
            .map_err(CacheError::from_read)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<CatalogEntry>> {
        let _shared = self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = self.reader();
        conn.prepare_cached(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM systems WHERE name = ?1 ORDER BY id LIMIT 1"
        ))
        .and_then(|mut stmt| stmt.query_row([name], row_to_entry).optional())
        .map_err(CacheError::from_read)
    }

    /// Full scan over the candidate rows. When several candidates sit at the
    /// same distance the first one SQLite yields wins, and that order is not
    /// specified.
    pub fn nearest_controlled(&self, reference_id: i64, power: &str) -> Result<Option<CatalogEntry>> {
        let power = power.trim();
        if power.is_empty() {
            return Ok(None);
        }

        let Some(reference) = self.get_by_id(reference_id)? else {
            debug!(reference_id, "Reference system not in store");
            return Ok(None);
        };

        let _shared = self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = self.reader();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SYSTEM_COLUMNS} FROM systems WHERE id != ?1 AND power = ?2 AND power_state = ?3"
            ))
            .map_err(CacheError::from_read)?;
        let rows = stmt
            .query_map(params![reference_id, power, CONTROL_STATE], row_to_entry)
            .map_err(CacheError::from_read)?;

        let mut best: Option<(f64, CatalogEntry)> = None;
        for row in rows {
            let candidate = row.map_err(CacheError::from_read)?;
            let distance = reference.distance_to(&candidate);
            let closer = best
                .as_ref()
                .map_or(true, |(best_distance, _)| distance < *best_distance);
            if closer {
                best = Some((distance, candidate));
            }
        }

        Ok(best.map(|(_, entry)| entry))
    }

    pub fn count(&self) -> Result<u64> {
        let _shared = self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = self.reader();
        conn.query_row("SELECT COUNT(*) FROM systems", [], |row| row.get::<_, i64>(0))
            .map(|count| count.max(0) as u64)
            .map_err(CacheError::from_read)
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[slot]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writer(&self) -> MutexGuard<'_, Connection> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Caller holds the gate exclusively and passes the locked writer.
    fn rebuild_file(&self, writer: &mut Connection) -> Result<()> {
        let mut readers: Vec<MutexGuard<'_, Connection>> = self
            .readers
            .iter()
            .map(|reader| reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .collect();

        self.detached.store(true, Ordering::Relaxed);
        for conn in readers
            .iter_mut()
            .map(|guard| &mut **guard)
            .chain(iter::once(&mut *writer))
        {
            let placeholder = Connection::open_in_memory().map_err(CacheError::from_write)?;
            drop(mem::replace(conn, placeholder));
        }

        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.path.as_os_str().to_owned();
            name.push(suffix);
            match fs::remove_file(PathBuf::from(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(CacheError::StorageWrite {
                        message: format!("failed removing damaged store file: {err}"),
                        structural: false,
                    })
                }
            }
        }

        let fresh = open_connection(&self.path)?;
        apply_reset(&fresh).map_err(CacheError::from_write)?;
        *writer = fresh;
        for guard in readers.iter_mut() {
            **guard = open_connection(&self.path)?;
        }
        self.detached.store(false, Ordering::Relaxed);

        info!(path = %self.path.display(), "Rebuilt systems store from an empty file");
        Ok(())
    }
}

impl CatalogWriter for SystemStore {
    /// Drops and recreates the cache tables. When the file itself is too
    /// damaged for that, deletes it and starts from an empty database.
    fn reset(&self) -> Result<()> {
        let _exclusive = self.gate.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut conn = self.lock_writer();
        warn!(path = %self.path.display(), "Resetting systems store, all rows dropped");
        if self.detached.load(Ordering::Relaxed) {
            return self.rebuild_file(&mut conn);
        }

        match apply_reset(&conn).map_err(CacheError::from_write) {
            Ok(()) => Ok(()),
            Err(err) if err.is_structural() => {
                warn!(path = %self.path.display(), "Reset failed on a damaged file, rebuilding: {err}");
                self.rebuild_file(&mut conn)
            }
            Err(err) => Err(err),
        }
    }

    fn upsert_many(&self, rows: &[CatalogEntry]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let _exclusive = self.gate.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut conn = self.lock_writer();
        let tx = conn.transaction().map_err(CacheError::from_write)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL).map_err(CacheError::from_write)?;
            for row in rows {
                stmt.execute(params![
                    row.id,
                    row.edsm_id,
                    row.name,
                    row.x,
                    row.y,
                    row.z,
                    row.population,
                    row.is_populated,
                    row.government.id,
                    row.government.label,
                    row.allegiance.id,
                    row.allegiance.label,
                    row.security.id,
                    row.security.label,
                    row.primary_economy.id,
                    row.primary_economy.label,
                    row.power,
                    row.power_state,
                    row.needs_permit,
                    row.updated_at,
                    row.controlling_minor_faction.id,
                    row.controlling_minor_faction.label,
                    row.reserve_type.id,
                    row.reserve_type.label,
                ])
                .map_err(CacheError::from_write)?;
            }
        }
        tx.commit().map_err(CacheError::from_write)?;

        debug!(rows = rows.len(), "Upserted system rows");
        Ok(rows.len())
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|err| unavailable(path, err))?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        ",
    )
    .map_err(|err| unavailable(path, err))?;
    Ok(conn)
}

fn list_tables(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn apply_reset(conn: &Connection) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(RESET_SQL)?;
    tx.execute(
        "INSERT INTO systems_meta (key, value) VALUES ('schema_version', ?1)",
        [STORE_SCHEMA_VERSION],
    )?;
    tx.commit()
}

fn unavailable(path: &Path, err: rusqlite::Error) -> CacheError {
    CacheError::StorageUnavailable {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        id: row.get(0)?,
        edsm_id: row.get(1)?,
        name: row.get(2)?,
        x: row.get(3)?,
        y: row.get(4)?,
        z: row.get(5)?,
        population: row.get(6)?,
        is_populated: row.get(7)?,
        government: Category::new(row.get(8)?, row.get(9)?),
        allegiance: Category::new(row.get(10)?, row.get(11)?),
        security: Category::new(row.get(12)?, row.get(13)?),
        primary_economy: Category::new(row.get(14)?, row.get(15)?),
        power: row.get(16)?,
        power_state: row.get(17)?,
        needs_permit: row.get(18)?,
        updated_at: row.get(19)?,
        controlling_minor_faction: Category::new(row.get(20)?, row.get(21)?),
        reserve_type: Category::new(row.get(22)?, row.get(23)?),
    })
}
