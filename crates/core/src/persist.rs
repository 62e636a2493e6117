use crate::directory::MonitorInfo;
use crate::hardware::VcpFeature;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Monitors seen in earlier sessions and the last value the user asked for,
/// so a restart can show them before the first enumeration finishes.
pub struct KnownMonitorStore {
    db_path: PathBuf,

    // In-memory cache (fast reads)
    cache: Arc<RwLock<KnownCache>>,

    write_sender: Sender<WriteCommand>,
    write_thread: Option<thread::JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct KnownCache {
    monitors: Vec<MonitorInfo>,
    values: HashMap<(String, VcpFeature), f64>,
}

enum WriteCommand {
    ReplaceMonitors(Vec<MonitorInfo>),
    RecordValue(String, VcpFeature, f64),
    Flush(Sender<()>),
    Shutdown,
}

impl KnownMonitorStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database {}", db_path.display()))?;
        Self::init_database(&conn)?;

        let cache = Arc::new(RwLock::new(Self::load_cache(&conn)?));
        drop(conn);

        let (write_sender, write_receiver) = unbounded();
        let worker_path = db_path.to_path_buf();
        let write_thread = thread::Builder::new()
            .name("state-writer".into())
            .spawn(move || Self::write_worker(worker_path, write_receiver))
            .context("Failed to start state write thread")?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            cache,
            write_sender,
            write_thread: Some(write_thread),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_database(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        match current_version {
            None => {
                Self::create_tables(conn)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(version) if version > SCHEMA_VERSION => {
                anyhow::bail!("State database version {} is newer than supported {}", version, SCHEMA_VERSION);
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS monitors (
                stable_id TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS feature_values (
                stable_id TEXT NOT NULL,
                feature TEXT NOT NULL,
                value REAL NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (stable_id, feature)
            )",
            [],
        )?;

        Ok(())
    }

    fn load_cache(conn: &Connection) -> Result<KnownCache> {
        let mut cache = KnownCache::default();

        let mut stmt = conn.prepare("SELECT stable_id, info FROM monitors ORDER BY stable_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (stable_id, info) = row?;
            match serde_json::from_str::<MonitorInfo>(&info) {
                Ok(monitor) => cache.monitors.push(monitor),
                Err(e) => crate::log_warn!("Skipping unreadable stored monitor {}: {}", stable_id, e),
            }
        }

        let mut stmt = conn.prepare("SELECT stable_id, feature, value FROM feature_values")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (stable_id, feature, value) = row?;
            if let Some(feature) = feature_from_name(&feature) {
                cache.values.insert((stable_id, feature), value);
            }
        }

        Ok(cache)
    }

    fn write_worker(db_path: PathBuf, receiver: Receiver<WriteCommand>) {
        let mut conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                crate::log_error!("Failed to open state database in write worker: {}", e);
                return;
            }
        };

        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        while let Ok(cmd) = receiver.recv() {
            match cmd {
                WriteCommand::ReplaceMonitors(monitors) => {
                    if let Err(e) = Self::write_monitors(&mut conn, &monitors) {
                        crate::log_error!("Failed to persist known monitors: {}", e);
                    }
                }
                WriteCommand::RecordValue(stable_id, feature, value) => {
                    if let Err(e) = conn.execute(
                        "INSERT OR REPLACE INTO feature_values (stable_id, feature, value, updated_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![stable_id, feature.name(), value, unix_now()],
                    ) {
                        crate::log_error!("Failed to persist {} for {}: {}", feature.name(), stable_id, e);
                    }
                }
                WriteCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
                WriteCommand::Shutdown => break,
            }
        }

        let _ = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }

    fn write_monitors(conn: &mut Connection, monitors: &[MonitorInfo]) -> Result<()> {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM monitors", [])?;
        let now = unix_now();
        for monitor in monitors {
            let info = serde_json::to_string(monitor)?;
            tx.execute(
                "INSERT INTO monitors (stable_id, info, updated_at) VALUES (?1, ?2, ?3)",
                params![monitor.id, info, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn known_monitors(&self) -> Vec<MonitorInfo> {
        self.cache.read().monitors.clone()
    }

    pub fn last_value(&self, stable_id: &str, feature: VcpFeature) -> Option<f64> {
        self.cache.read().values.get(&(stable_id.to_string(), feature)).copied()
    }

    /// Replaces the stored monitor list. Skips the write when nothing changed.
    pub fn remember_monitors(&self, monitors: &[MonitorInfo]) {
        {
            let mut cache = self.cache.write();
            if cache.monitors == monitors {
                return;
            }
            cache.monitors = monitors.to_vec();
        }
        let _ = self.write_sender.send(WriteCommand::ReplaceMonitors(monitors.to_vec()));
    }

    pub fn record_value(&self, stable_id: &str, feature: VcpFeature, value: f64) {
        let previous = self
            .cache
            .write()
            .values
            .insert((stable_id.to_string(), feature), value);
        if previous != Some(value) {
            let _ = self
                .write_sender
                .send(WriteCommand::RecordValue(stable_id.to_string(), feature, value));
        }
    }

    /// Blocks until every queued write has reached the database.
    pub fn flush(&self) {
        let (ack, done) = bounded(1);
        if self.write_sender.send(WriteCommand::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

impl Drop for KnownMonitorStore {
    fn drop(&mut self) {
        let _ = self.write_sender.send(WriteCommand::Shutdown);

        if let Some(handle) = self.write_thread.take() {
            let _ = handle.join();
        }
    }
}

fn feature_from_name(name: &str) -> Option<VcpFeature> {
    [VcpFeature::Brightness, VcpFeature::Contrast]
        .into_iter()
        .find(|f| f.name() == name)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: &str, available: bool) -> MonitorInfo {
        MonitorInfo {
            id: id.into(),
            runtime_index: 0,
            name: "DELL U2720Q".into(),
            brightness: Some(40),
            max_brightness: Some(100),
            available,
            backend: "sim".into(),
            serial_number: Some("304NTPC4A088".into()),
            model_name: Some("DELL U2720Q".into()),
            manufacturer_id: Some("DEL".into()),
        }
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = KnownMonitorStore::open(&path).unwrap();
            store.remember_monitors(&[monitor("sn:DEL4109:304NTPC4A088", true)]);
            store.record_value("sn:DEL4109:304NTPC4A088", VcpFeature::Brightness, 65.0);
            store.record_value("sn:DEL4109:304NTPC4A088", VcpFeature::Contrast, 50.0);
            store.flush();
        }

        let store = KnownMonitorStore::open(&path).unwrap();
        let known = store.known_monitors();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].serial_number.as_deref(), Some("304NTPC4A088"));
        assert_eq!(store.last_value("sn:DEL4109:304NTPC4A088", VcpFeature::Brightness), Some(65.0));
        assert_eq!(store.last_value("sn:DEL4109:304NTPC4A088", VcpFeature::Contrast), Some(50.0));
        assert_eq!(store.last_value("other", VcpFeature::Brightness), None);
    }

    #[test]
    fn monitor_list_is_replaced_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = KnownMonitorStore::open(&path).unwrap();
            store.remember_monitors(&[monitor("a", true), monitor("b", true)]);
            store.remember_monitors(&[monitor("b", false)]);
        }

        let store = KnownMonitorStore::open(&path).unwrap();
        let known = store.known_monitors();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].id, "b");
        assert!(!known[0].available);
    }
}
