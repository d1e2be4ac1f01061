// src/state_store.rs
// Durable map of active plugin tunnels, shared between CLI invocations through one JSON file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::errors::{TunnelError, TunnelResult};
use crate::process;
use crate::tunnel_engine::TunnelStrategy;

pub type ConnectionMap = BTreeMap<String, TunnelConnection>;

/// One live tunnel, as persisted in the state file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TunnelConnection {
    pub connection_id: String,
    pub team: String,
    pub machine: String,
    pub repo: String,
    pub plugin: String,
    pub local_port: u16,
    pub ssh_pid: Option<u32>,
    pub control_path: PathBuf,
    pub ssh_key_file: Option<PathBuf>,
    pub known_hosts_file: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub strategy: TunnelStrategy,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub destination: Option<String>, // user@ip
    #[serde(default)]
    pub remote_user: Option<String>, // sudo target for remote helpers
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub socket_path: Option<String>,
}

impl TunnelConnection {
    pub fn matches_target(&self, team: &str, machine: &str, repo: &str, plugin: &str) -> bool {
        self.team == team && self.machine == machine && self.repo == repo && self.plugin == plugin
    }

    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    /// Without a recorded pid the ControlMaster socket stands in for the
    /// process: ssh removes it when the master exits.
    pub fn is_process_alive(&self) -> bool {
        match self.ssh_pid {
            Some(pid) => process::is_alive(pid),
            None => self.control_path.exists(),
        }
    }
}

/// Optional criteria for selecting connections; empty fields match anything.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    pub connection_id: Option<String>,
    pub team: Option<String>,
    pub machine: Option<String>,
    pub repo: Option<String>,
    pub plugin: Option<String>,
}

impl ConnectionFilter {
    pub fn matches(&self, conn: &TunnelConnection) -> bool {
        fn field_matches(wanted: &Option<String>, actual: &str) -> bool {
            wanted.as_deref().map_or(true, |w| w == actual)
        }
        field_matches(&self.connection_id, &conn.connection_id)
            && field_matches(&self.team, &conn.team)
            && field_matches(&self.machine, &conn.machine)
            && field_matches(&self.repo, &conn.repo)
            && field_matches(&self.plugin, &conn.plugin)
    }

    pub fn is_empty(&self) -> bool {
        self.connection_id.is_none()
            && self.team.is_none()
            && self.machine.is_none()
            && self.repo.is_none()
            && self.plugin.is_none()
    }
}

/// Inter-process locking around read-modify-write cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `<state>.lock` created with O_EXCL; locks older than `stale_after` are broken.
    Exclusive {
        timeout: Duration,
        stale_after: Duration,
    },
    Disabled,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::Exclusive {
            timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Held while the state file is being read and rewritten.
#[derive(Debug)]
pub struct StateLock {
    path: Option<PathBuf>,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove state lock {}: {}", path.display(), e);
                }
            }
        }
    }
}

pub struct ConnectionStateStore {
    path: PathBuf,
    lock_mode: LockMode,
}

impl ConnectionStateStore {
    pub fn new(path: impl Into<PathBuf>, lock_mode: LockMode) -> Self {
        ConnectionStateStore {
            path: path.into(),
            lock_mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn lock(&self) -> TunnelResult<StateLock> {
        let (timeout, stale_after) = match self.lock_mode {
            LockMode::Disabled => return Ok(StateLock { path: None }),
            LockMode::Exclusive {
                timeout,
                stale_after,
            } => (timeout, stale_after),
        };

        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(StateLock {
                        path: Some(lock_path),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_lock_holder(&lock_path);
                    if lock_is_stale(&lock_path, holder, stale_after) {
                        warn!("Breaking stale state lock {}", lock_path.display());
                        break_stale_lock(&lock_path, holder)?;
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(TunnelError::StateLocked {
                            path: lock_path.display().to_string(),
                        });
                    }
                    // blocks the runtime thread; callers run one command at a
                    // time and the wait is capped by `timeout`
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads the state file. Missing or corrupt state reads as empty.
    pub fn load(&self) -> ConnectionMap {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return ConnectionMap::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return ConnectionMap::new();
            }
        };
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(
                    "Connection state {} is corrupt, treating as empty: {}",
                    self.path.display(),
                    e
                );
                ConnectionMap::new()
            }
        }
    }

    /// Replaces the state file atomically (temp file + rename).
    pub fn save(&self, connections: &ConnectionMap) -> TunnelResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let json = serde_json::to_string_pretty(connections)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(
            "Saved {} connection(s) to {}",
            connections.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Drops connections whose tunnel process is gone and returns them.
    pub fn reconcile_liveness(&self) -> TunnelResult<Vec<TunnelConnection>> {
        let _lock = self.lock()?;
        let mut connections = self.load();
        let stale: Vec<String> = connections
            .values()
            .filter(|conn| !conn.is_process_alive())
            .map(|conn| conn.connection_id.clone())
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut pruned = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(conn) = connections.remove(&id) {
                info!(
                    "Pruning stale connection {} ({} on port {})",
                    conn.connection_id, conn.plugin, conn.local_port
                );
                pruned.push(conn);
            }
        }
        self.save(&connections)?;
        Ok(pruned)
    }

    pub fn find_existing(
        &self,
        team: &str,
        machine: &str,
        repo: &str,
        plugin: &str,
    ) -> Option<TunnelConnection> {
        self.load()
            .into_values()
            .find(|conn| conn.matches_target(team, machine, repo, plugin))
    }

    /// Adds a connection unless one already exists for the same target.
    pub fn insert_unique(&self, connection: TunnelConnection) -> TunnelResult<()> {
        let _lock = self.lock()?;
        let mut connections = self.load();
        if let Some(existing) = connections.values().find(|c| {
            c.matches_target(
                &connection.team,
                &connection.machine,
                &connection.repo,
                &connection.plugin,
            )
        }) {
            return Err(TunnelError::AlreadyConnected {
                connection_id: existing.connection_id.clone(),
                port: existing.local_port,
            });
        }
        connections.insert(connection.connection_id.clone(), connection);
        self.save(&connections)
    }

    pub fn remove(&self, connection_id: &str) -> TunnelResult<Option<TunnelConnection>> {
        let _lock = self.lock()?;
        let mut connections = self.load();
        let removed = connections.remove(connection_id);
        if removed.is_some() {
            self.save(&connections)?;
        }
        Ok(removed)
    }

    pub fn matching(&self, filter: &ConnectionFilter) -> Vec<TunnelConnection> {
        self.load()
            .into_values()
            .filter(|conn| filter.matches(conn))
            .collect()
    }

    /// Picks an id not present in the store yet.
    pub fn generate_connection_id(
        &self,
        team: &str,
        machine: &str,
        repo: &str,
        plugin: &str,
        now: DateTime<Utc>,
    ) -> String {
        let existing = self.load();
        let mut attempt = 0u32;
        loop {
            let id = connection_id_for(team, machine, repo, plugin, now, attempt);
            if !existing.contains_key(&id) {
                return id;
            }
            debug!("Connection id {} already in use, regenerating", id);
            attempt += 1;
        }
    }
}

/// Pid written into the lock file by its holder, if readable.
fn read_lock_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// A lock is stale once its holder is gone or it has outlived `stale_after`.
fn lock_is_stale(path: &Path, holder: Option<u32>, stale_after: Duration) -> bool {
    if holder.map_or(false, |pid| !process::is_alive(pid)) {
        return true;
    }
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age > stale_after)
}

/// Moves the lock aside before deleting it, so a lock taken by another waiter
/// between the staleness check and the removal is put back instead of lost.
fn break_stale_lock(lock_path: &Path, observed_holder: Option<u32>) -> TunnelResult<()> {
    let mut aside = lock_path.as_os_str().to_os_string();
    aside.push(format!(".{}.stale", std::process::id()));
    let aside = PathBuf::from(aside);

    match fs::rename(lock_path, &aside) {
        Ok(()) => {}
        // someone else broke it first
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if read_lock_holder(&aside) != observed_holder {
        debug!("State lock {} changed hands, restoring it", lock_path.display());
        // hard_link fails if a newer lock already took the path
        if let Err(e) = fs::hard_link(&aside, lock_path) {
            warn!("Could not restore state lock {}: {}", lock_path.display(), e);
        }
    }
    fs::remove_file(&aside)?;
    Ok(())
}

/// First 8 hex chars of sha256 over the target and timestamp.
pub fn connection_id_for(
    team: &str,
    machine: &str,
    repo: &str,
    plugin: &str,
    now: DateTime<Utc>,
    attempt: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}{}{}{}{}", team, machine, repo, plugin, now.to_rfc3339()));
    if attempt > 0 {
        hasher.update(attempt.to_le_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn sample(id: &str, plugin: &str, pid: Option<u32>) -> TunnelConnection {
        TunnelConnection {
            connection_id: id.to_string(),
            team: "QA".to_string(),
            machine: "m1".to_string(),
            repo: "r1".to_string(),
            plugin: plugin.to_string(),
            local_port: 7111,
            ssh_pid: pid,
            control_path: PathBuf::from("/tmp/cm"),
            ssh_key_file: None,
            known_hosts_file: None,
            created_at: Utc::now(),
            strategy: TunnelStrategy::Native,
            remote_port: None,
            destination: Some("ops@10.0.0.5".to_string()),
            remote_user: None,
            ssh_port: Some(22),
            socket_path: None,
        }
    }

    fn store_in(dir: &Path) -> ConnectionStateStore {
        ConnectionStateStore::new(dir.join("state.json"), LockMode::default())
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(dir.path()).load().is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut map = ConnectionMap::new();
        map.insert("aaaa1111".to_string(), sample("aaaa1111", "browser", Some(1)));
        store.save(&map).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["aaaa1111"].plugin, "browser");
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_legacy_entry_without_strategy_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(
            store.path(),
            r#"{"abcd1234": {"connection_id": "abcd1234", "team": "QA", "machine": "m1",
                "repo": "r1", "plugin": "browser", "local_port": 7111, "ssh_pid": null,
                "control_path": "/tmp/cm", "ssh_key_file": "/tmp/k", "known_hosts_file": null,
                "created_at": "2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        let loaded = store.load();
        assert_eq!(loaded["abcd1234"].strategy, TunnelStrategy::Native);
        assert_eq!(loaded["abcd1234"].remote_port, None);
    }

    #[test]
    fn test_reconcile_prunes_dead_processes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut map = ConnectionMap::new();
        map.insert(
            "alive000".to_string(),
            sample("alive000", "browser", Some(std::process::id())),
        );
        map.insert("dead0000".to_string(), sample("dead0000", "db", Some(dead_pid())));
        let mut no_master = sample("nopid000", "term", None);
        no_master.control_path = dir.path().join("nopid000.ctl");
        map.insert("nopid000".to_string(), no_master);
        let mut master = sample("master00", "db2", None);
        master.control_path = dir.path().join("master00.ctl");
        fs::write(&master.control_path, "").unwrap();
        map.insert("master00".to_string(), master);
        store.save(&map).unwrap();

        let pruned = store.reconcile_liveness().unwrap();
        let mut pruned_ids: Vec<_> = pruned.iter().map(|c| c.connection_id.as_str()).collect();
        pruned_ids.sort();
        assert_eq!(pruned_ids, vec!["dead0000", "nopid000"]);

        let on_disk = store.load();
        assert_eq!(on_disk.len(), 2);
        assert!(on_disk.contains_key("alive000"));
        // pid unknown but the control socket is still there
        assert!(on_disk.contains_key("master00"));
    }

    #[test]
    fn test_insert_unique_rejects_duplicate_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.insert_unique(sample("first000", "browser", Some(1))).unwrap();

        let err = store
            .insert_unique(sample("second00", "browser", Some(2)))
            .unwrap_err();
        match err {
            TunnelError::AlreadyConnected {
                connection_id,
                port,
            } => {
                assert_eq!(connection_id, "first000");
                assert_eq!(port, 7111);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn test_remove_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.insert_unique(sample("gone0000", "browser", Some(1))).unwrap();
        assert!(store.remove("gone0000").unwrap().is_some());
        assert!(store.remove("gone0000").unwrap().is_none());
    }

    #[test]
    fn test_filter_matching() {
        let conn = sample("abcd1234", "browser", None);
        let mut filter = ConnectionFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&conn));

        filter.plugin = Some("browser".to_string());
        filter.team = Some("QA".to_string());
        assert!(filter.matches(&conn));

        filter.machine = Some("other".to_string());
        assert!(!filter.matches(&conn));
    }

    #[test]
    fn test_lock_times_out_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(
            dir.path().join("state.json"),
            LockMode::Exclusive {
                timeout: Duration::from_millis(100),
                stale_after: Duration::from_secs(60),
            },
        );
        let _held = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(TunnelError::StateLocked { .. })));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        {
            let _held = store.lock().unwrap();
            assert!(dir.path().join("state.json.lock").exists());
        }
        assert!(!dir.path().join("state.json.lock").exists());
        let _again = store.lock().unwrap();
    }

    #[test]
    fn test_lock_of_dead_holder_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(
            dir.path().join("state.json"),
            LockMode::Exclusive {
                timeout: Duration::from_millis(100),
                stale_after: Duration::from_secs(60),
            },
        );
        fs::write(dir.path().join("state.json.lock"), format!("{}\n", dead_pid())).unwrap();

        let _held = store.lock().unwrap();
        assert_eq!(
            read_lock_holder(&dir.path().join("state.json.lock")),
            Some(std::process::id())
        );
    }

    #[test]
    fn test_break_restores_lock_that_changed_hands() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("state.json.lock");
        fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();

        // the holder observed as stale is not the one holding it now
        break_stale_lock(&lock_path, Some(dead_pid())).unwrap();

        assert_eq!(read_lock_holder(&lock_path), Some(std::process::id()));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".stale"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_disabled_lock_never_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path().join("state.json"), LockMode::Disabled);
        let _a = store.lock().unwrap();
        let _b = store.lock().unwrap();
    }

    #[test]
    fn test_connection_id_shape_and_collision() {
        let now = Utc::now();
        let id = connection_id_for("QA", "m1", "r1", "browser", now, 0);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut taken = sample(&id, "other", Some(1));
        taken.plugin = "other".to_string();
        let mut map = ConnectionMap::new();
        map.insert(id.clone(), taken);
        store.save(&map).unwrap();

        let fresh = store.generate_connection_id("QA", "m1", "r1", "browser", now);
        assert_ne!(fresh, id);
        assert_eq!(fresh, connection_id_for("QA", "m1", "r1", "browser", now, 1));
    }
}
