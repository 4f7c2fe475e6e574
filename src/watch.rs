use crate::config;
use crate::supervisor::{Action, Supervisor};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hasher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Change classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Modified,
    Removed,
}

impl Change {
    pub fn action(self) -> Action {
        match self {
            Change::Created => Action::Start,
            Change::Modified => Action::Restart,
            Change::Removed => Action::Stop,
        }
    }
}

/// Content hash of every group document, keyed by group name.
pub type Fingerprints = HashMap<String, u64>;

fn fingerprint(content: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(content);
    hasher.finish()
}

fn fingerprint_file(path: &Path) -> Option<u64> {
    std::fs::read(path).ok().map(|c| fingerprint(&c))
}

pub fn scan(dir: &Path) -> Fingerprints {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Fingerprints::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let name = config::group_name_from_path(&path)?;
            Some((name, fingerprint_file(&path)?))
        })
        .collect()
}

/// Compare the documents behind `names` with what was last seen, updating
/// `known` as it goes. Touches that leave the content unchanged yield nothing.
pub fn classify(
    dir: &Path,
    names: &BTreeSet<String>,
    known: &mut Fingerprints,
) -> Vec<(String, Change)> {
    let mut changes = Vec::new();
    for name in names {
        let current = fingerprint_file(&dir.join(format!("{name}.json")));
        let change = match (known.get(name).copied(), current) {
            (None, Some(_)) => Change::Created,
            (Some(old), Some(new)) if old != new => Change::Modified,
            (Some(_), None) => Change::Removed,
            _ => continue,
        };
        match current {
            Some(fp) => known.insert(name.clone(), fp),
            None => known.remove(name),
        };
        changes.push((name.clone(), change));
    }
    changes
}

fn collect_names(event: &notify::Event, names: &mut BTreeSet<String>) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    names.extend(event.paths.iter().filter_map(|p| config::group_name_from_path(p)));
}

// ---------------------------------------------------------------------------
// Per-name workers
// ---------------------------------------------------------------------------

/// One FIFO queue per group so changes to a name are applied in order while
/// different names proceed independently.
struct Workers {
    supervisor: Supervisor,
    queues: HashMap<String, mpsc::UnboundedSender<Change>>,
}

impl Workers {
    fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            queues: HashMap::new(),
        }
    }

    fn enqueue(&mut self, name: String, change: Change) {
        let supervisor = self.supervisor.clone();
        let queue = self
            .queues
            .entry(name.clone())
            .or_insert_with(|| spawn_worker(supervisor, name.clone()));
        if queue.send(change).is_err() {
            tracing::warn!(group = %name, ?change, "worker queue closed, dropping change");
        }
    }
}

fn spawn_worker(supervisor: Supervisor, name: String) -> mpsc::UnboundedSender<Change> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Change>();
    tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            apply_change(&supervisor, &name, change).await;
        }
    });
    tx
}

async fn apply_change(supervisor: &Supervisor, name: &str, change: Change) {
    let action = change.action();
    tracing::info!(group = name, ?change, %action, "configuration change detected");
    match supervisor.run(action, name).await {
        Ok(outcome) => tracing::info!(group = name, %outcome, "configuration change applied"),
        Err(e) => tracing::error!(group = name, error = %e, "{action} after configuration change failed"),
    }
}

// ---------------------------------------------------------------------------
// Watcher task
// ---------------------------------------------------------------------------

/// Watch the configuration directory until `shutdown_rx` flips. Fails only
/// when the watcher itself cannot be set up; callers treat that as the
/// feature being unavailable.
pub fn spawn_watcher(
    supervisor: Supervisor,
    mut shutdown_rx: watch::Receiver<bool>,
) -> notify::Result<JoinHandle<()>> {
    let dir = supervisor.store().dir().to_path_buf();
    let mut known = scan(&dir);

    let (tx, mut rx) = mpsc::channel(256);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.blocking_send(event);
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::info!(dir = %dir.display(), groups = known.len(), "watching configuration directory");

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        let mut workers = Workers::new(supervisor);

        loop {
            let first_event = tokio::select! {
                event = rx.recv() => match event {
                    Some(e) => e,
                    None => return,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                    continue;
                }
            };

            let mut touched = BTreeSet::new();
            collect_names(&first_event, &mut touched);

            tokio::select! {
                _ = tokio::time::sleep(DEBOUNCE_DURATION) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }

            while let Ok(event) = rx.try_recv() {
                collect_names(&event, &mut touched);
            }

            for (name, change) in classify(&dir, &touched, &mut known) {
                workers.enqueue(name, change);
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scan_only_group_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("siteA.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".tmp-x1y2"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let known = scan(dir.path());
        assert_eq!(known.len(), 1);
        assert!(known.contains_key("siteA"));
    }

    #[test]
    fn test_classify_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut known = scan(dir.path());
        let file = dir.path().join("siteA.json");

        std::fs::write(&file, r#"{"v":1}"#).unwrap();
        assert_eq!(
            classify(dir.path(), &names(&["siteA"]), &mut known),
            vec![("siteA".to_string(), Change::Created)]
        );

        // same bytes again: a touch, not a change
        std::fs::write(&file, r#"{"v":1}"#).unwrap();
        assert!(classify(dir.path(), &names(&["siteA"]), &mut known).is_empty());

        std::fs::write(&file, r#"{"v":2}"#).unwrap();
        assert_eq!(
            classify(dir.path(), &names(&["siteA"]), &mut known),
            vec![("siteA".to_string(), Change::Modified)]
        );

        std::fs::remove_file(&file).unwrap();
        assert_eq!(
            classify(dir.path(), &names(&["siteA"]), &mut known),
            vec![("siteA".to_string(), Change::Removed)]
        );
        assert!(known.is_empty());
    }

    #[test]
    fn test_classify_unknown_missing_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut known = Fingerprints::new();
        assert!(classify(dir.path(), &names(&["ghost"]), &mut known).is_empty());
    }

    #[test]
    fn test_change_actions() {
        assert_eq!(Change::Created.action(), Action::Start);
        assert_eq!(Change::Modified.action(), Action::Restart);
        assert_eq!(Change::Removed.action(), Action::Stop);
    }

    #[test]
    fn test_collect_names_skips_temp_and_access() {
        let mut touched = BTreeSet::new();
        let event = notify::Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/conf.d/.tmp-abc"))
            .add_path(PathBuf::from("/conf.d/siteB.json"));
        collect_names(&event, &mut touched);

        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/conf.d/siteC.json"));
        collect_names(&access, &mut touched);

        assert_eq!(touched, names(&["siteB"]));
    }
}
