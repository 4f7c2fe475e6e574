use crate::atomic;
use crate::config;
use crate::sys::{self, PidProbe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run-time state of one tunnel group's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub launched_at: DateTime<Utc>,
    #[serde(default = "default_alive")]
    pub last_known_alive: bool,
}

fn default_alive() -> bool {
    true
}

/// What the registry knows about a name once the OS has been asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Absent,
    Running(ProcessRecord),
    /// A record whose process disappeared without an explicit stop.
    Stale(ProcessRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable process record for '{name}': {reason}")]
    Malformed { name: String, reason: String },
    #[error("'{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },
    #[error("could not determine whether pid {pid} is alive: {source}")]
    Probe {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// One small JSON file per group name.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn io(path: &Path, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Create the directory and make sure it can be listed.
    pub fn ensure_ready(&self) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io(&self.dir, e))?;
        std::fs::read_dir(&self.dir).map_err(|e| Self::io(&self.dir, e))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<ProcessRecord>, RegistryError> {
        let path = self.path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io(&path, e)),
        };
        parse_record(name, &content, &path).map(Some)
    }

    /// Probe the recorded pid without touching the record. A record already
    /// marked dead stays stale even if its pid has been reused.
    pub fn state(&self, name: &str) -> Result<RecordState, RegistryError> {
        let Some(record) = self.get(name)? else {
            return Ok(RecordState::Absent);
        };
        if !record.last_known_alive {
            return Ok(RecordState::Stale(record));
        }
        match sys::probe_pid(record.pid) {
            Ok(PidProbe::Alive) => Ok(RecordState::Running(record)),
            Ok(PidProbe::Gone) => Ok(RecordState::Stale(record)),
            Err(source) => Err(RegistryError::Probe {
                pid: record.pid,
                source,
            }),
        }
    }

    /// Persist the pid of a freshly spawned process. A stale record is
    /// overwritten; a live one is refused.
    pub fn record(&self, name: &str, pid: u32) -> Result<ProcessRecord, RegistryError> {
        match self.state(name)? {
            RecordState::Running(existing) => {
                return Err(RegistryError::AlreadyRunning {
                    name: name.to_string(),
                    pid: existing.pid,
                });
            }
            RecordState::Stale(stale) => {
                tracing::debug!(group = name, pid = stale.pid, "overwriting stale record");
            }
            RecordState::Absent => {}
        }

        let record = ProcessRecord {
            name: name.to_string(),
            pid,
            launched_at: Utc::now(),
            last_known_alive: true,
        };
        self.write(&record)?;
        Ok(record)
    }

    fn write(&self, record: &ProcessRecord) -> Result<(), RegistryError> {
        let path = self.path(&record.name);
        let json = serde_json::to_vec_pretty(record).map_err(|e| RegistryError::Malformed {
            name: record.name.clone(),
            reason: e.to_string(),
        })?;
        atomic::write_atomic(&path, &json).map_err(|e| Self::io(&path, e))
    }

    /// Remove the record. Returns false when there was none.
    pub fn forget(&self, name: &str) -> Result<bool, RegistryError> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io(&path, e)),
        }
    }

    /// Live probe; a record whose process is gone is cleared on the way.
    pub fn is_alive(&self, name: &str) -> Result<bool, RegistryError> {
        match self.state(name)? {
            RecordState::Running(_) => Ok(true),
            RecordState::Absent => Ok(false),
            RecordState::Stale(record) => {
                tracing::info!(group = name, pid = record.pid, "clearing stale process record");
                self.forget(name)?;
                Ok(false)
            }
        }
    }

    /// Update `last_known_alive`, but only while the record still describes
    /// `pid`.
    pub fn mark(&self, name: &str, pid: u32, alive: bool) -> Result<(), RegistryError> {
        if let Some(mut record) = self.get(name)?
            && record.pid == pid
            && record.last_known_alive != alive
        {
            record.last_known_alive = alive;
            self.write(&record)?;
        }
        Ok(())
    }

    /// Sorted names of every stored record.
    pub fn names(&self) -> Result<Vec<String>, RegistryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io(&self.dir, e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| config::group_name_from_path(&entry.path()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn list_live(&self) -> Result<Vec<(String, u32)>, RegistryError> {
        let mut live = Vec::new();
        for name in self.names()? {
            match self.state(&name)? {
                RecordState::Running(record) => live.push((name, record.pid)),
                RecordState::Stale(_) => {
                    self.forget(&name)?;
                }
                RecordState::Absent => {}
            }
        }
        Ok(live)
    }
}

/// Records are JSON; a file holding only a pid (older layout) is accepted too.
fn parse_record(name: &str, content: &str, path: &Path) -> Result<ProcessRecord, RegistryError> {
    if let Ok(pid) = content.trim().parse::<u32>() {
        let launched_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        return Ok(ProcessRecord {
            name: name.to_string(),
            pid,
            launched_at,
            last_known_alive: true,
        });
    }
    serde_json::from_str(content).map_err(|e| RegistryError::Malformed {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // above PID_MAX_LIMIT, so the kernel never hands it out
    const DEAD_PID: u32 = 4_194_305;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("run"));
        registry.ensure_ready().unwrap();
        (dir, registry)
    }

    #[test]
    fn test_record_and_get() {
        let (_dir, registry) = registry();
        let pid = std::process::id();
        let record = registry.record("siteA", pid).unwrap();
        assert_eq!(record.pid, pid);
        assert!(record.last_known_alive);
        assert_eq!(registry.get("siteA").unwrap(), Some(record));
    }

    #[test]
    fn test_record_refuses_live_record() {
        let (_dir, registry) = registry();
        registry.record("siteA", std::process::id()).unwrap();
        let err = registry.record("siteA", 42).unwrap_err();
        assert!(
            matches!(err, RegistryError::AlreadyRunning { pid, .. } if pid == std::process::id())
        );
    }

    #[test]
    fn test_record_overwrites_stale_record() {
        let (_dir, registry) = registry();
        registry.record("siteA", DEAD_PID).unwrap();
        let record = registry.record("siteA", std::process::id()).unwrap();
        assert_eq!(record.pid, std::process::id());
    }

    #[test]
    fn test_forget_is_idempotent() {
        let (_dir, registry) = registry();
        assert!(!registry.forget("siteA").unwrap());
        registry.record("siteA", std::process::id()).unwrap();
        assert!(registry.forget("siteA").unwrap());
        assert_eq!(registry.get("siteA").unwrap(), None);
    }

    #[test]
    fn test_state_distinguishes_stale() {
        let (_dir, registry) = registry();
        assert_eq!(registry.state("siteA").unwrap(), RecordState::Absent);

        registry.record("siteA", DEAD_PID).unwrap();
        assert!(matches!(
            registry.state("siteA").unwrap(),
            RecordState::Stale(r) if r.pid == DEAD_PID
        ));
        // state() never clears
        assert!(registry.get("siteA").unwrap().is_some());
    }

    #[test]
    fn test_is_alive_clears_stale_record() {
        let (_dir, registry) = registry();
        registry.record("siteB", DEAD_PID).unwrap();

        assert!(!registry.is_alive("siteB").unwrap());
        assert_eq!(registry.get("siteB").unwrap(), None);
    }

    #[test]
    fn test_legacy_bare_pid_file() {
        let (_dir, registry) = registry();
        std::fs::write(registry.dir().join("old.json"), format!("{}\n", std::process::id()))
            .unwrap();
        let record = registry.get("old").unwrap().unwrap();
        assert_eq!(record.pid, std::process::id());
        assert!(registry.is_alive("old").unwrap());
    }

    #[test]
    fn test_malformed_record() {
        let (_dir, registry) = registry();
        std::fs::write(registry.dir().join("bad.json"), "{ nope").unwrap();
        assert!(matches!(
            registry.get("bad"),
            Err(RegistryError::Malformed { .. })
        ));
    }

    #[test]
    fn test_mark_updates_flag() {
        let (_dir, registry) = registry();
        let pid = std::process::id();
        registry.record("siteA", pid).unwrap();
        registry.mark("siteA", pid + 1, false).unwrap();
        assert!(registry.get("siteA").unwrap().unwrap().last_known_alive);
        registry.mark("siteA", pid, false).unwrap();
        assert!(!registry.get("siteA").unwrap().unwrap().last_known_alive);
        // our pid is alive, but a record marked dead never reads as running
        assert!(matches!(
            registry.state("siteA").unwrap(),
            RecordState::Stale(_)
        ));
        assert!(!registry.is_alive("siteA").unwrap());
        assert_eq!(registry.get("siteA").unwrap(), None);
        // no record, no error
        registry.mark("missing", pid, false).unwrap();
    }

    #[test]
    fn test_list_live_skips_and_clears_dead() {
        let (_dir, registry) = registry();
        registry.record("alive", std::process::id()).unwrap();
        registry.record("dead", DEAD_PID).unwrap();

        let live = registry.list_live().unwrap();
        assert_eq!(live, vec![("alive".to_string(), std::process::id())]);
        assert_eq!(registry.names().unwrap(), vec!["alive"]);
    }

    #[test]
    fn test_names_missing_dir() {
        let registry = Registry::new("/nonexistent/sshtunnel/run");
        assert!(registry.names().unwrap().is_empty());
    }
}
