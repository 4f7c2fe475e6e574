use crate::command::{self, CommandBuilder};
use crate::config::{self, ConfigError, ConfigStore};
use crate::paths::Paths;
use crate::probe::{self, Reachability};
use crate::protocol::{BatchReport, GroupStatus, Request, Response, TunnelState};
use crate::registry::{RecordState, Registry, RegistryError};
use crate::settings::Settings;
use crate::sys;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    AlreadyRunning(u32),
}

impl StartOutcome {
    pub fn pid(self) -> u32 {
        match self {
            StartOutcome::Started(pid) | StartOutcome::AlreadyRunning(pid) => pid,
        }
    }
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Started(pid) => write!(f, "started (pid {pid})"),
            StartOutcome::AlreadyRunning(pid) => write!(f, "already running (pid {pid})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(u32),
    NotRunning,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Stopped(pid) => write!(f, "stopped (pid {pid})"),
            StopOutcome::NotRunning => write!(f, "not running"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Start => write!(f, "start"),
            Action::Stop => write!(f, "stop"),
            Action::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to launch '{name}' via {program}: {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal '{name}' (pid {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Batch(BatchReport),
    #[error("status task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BatchReport {
    /// `Err(Batch)` when any item failed.
    pub fn into_result(self) -> Result<BatchReport, SupervisorError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SupervisorError::Batch(self))
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Supervisor {
    paths: Paths,
    store: ConfigStore,
    registry: Registry,
    builder: CommandBuilder,
    kill_timeout: Duration,
    probe_timeout: Duration,
    autostart: bool,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Names with a start or stop in flight.
    phases: Arc<RwLock<HashMap<String, TunnelState>>>,
}

impl Supervisor {
    pub fn new(paths: Paths, settings: &Settings) -> Self {
        Self {
            store: ConfigStore::new(paths.config_dir()),
            registry: Registry::new(paths.registry_dir()),
            builder: settings.command_builder(),
            kill_timeout: settings.supervisor.kill_timeout(),
            probe_timeout: settings.supervisor.probe_timeout(),
            autostart: settings.daemon.autostart,
            paths,
            locks: Arc::default(),
            phases: Arc::default(),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Per-name lock. tokio's mutex is FIFO, so queued operations on one name
    /// run in arrival order.
    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn in_phase<T>(
        &self,
        name: &str,
        phase: TunnelState,
        op: impl Future<Output = T>,
    ) -> T {
        self.phases.write().await.insert(name.to_string(), phase);
        let result = op.await;
        self.phases.write().await.remove(name);
        result
    }

    pub async fn start(&self, name: &str) -> Result<StartOutcome, SupervisorError> {
        config::validate_name(name)?;
        let _guard = self.lock(name).await;
        self.in_phase(name, TunnelState::Starting, self.start_locked(name))
            .await
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        config::validate_name(name)?;
        let _guard = self.lock(name).await;
        self.in_phase(name, TunnelState::Stopping, self.stop_locked(name))
            .await
    }

    /// Stop then start under one lock. The group is loaded first so a broken
    /// document leaves the running instance alone.
    pub async fn restart(&self, name: &str) -> Result<StartOutcome, SupervisorError> {
        config::validate_name(name)?;
        let _guard = self.lock(name).await;
        self.store.load(name)?;
        self.in_phase(name, TunnelState::Stopping, self.stop_locked(name))
            .await?;
        self.in_phase(name, TunnelState::Starting, self.start_locked(name))
            .await
    }

    async fn start_locked(&self, name: &str) -> Result<StartOutcome, SupervisorError> {
        match self.registry.state(name)? {
            RecordState::Running(record) => {
                tracing::info!(group = name, pid = record.pid, "already running");
                return Ok(StartOutcome::AlreadyRunning(record.pid));
            }
            RecordState::Stale(record) => {
                tracing::info!(group = name, pid = record.pid, "clearing stale record");
                self.registry.forget(name)?;
            }
            RecordState::Absent => {}
        }

        let group = self.store.load(name)?;
        let argv = self.builder.build_argv(&group);
        let mut child = self.spawn(name, &argv)?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                name: name.to_string(),
                program: argv[0].clone(),
                source: std::io::Error::other("process exited before its pid was read"),
            });
        };

        match self.registry.record(name, pid) {
            Ok(_) => {
                tracing::info!(
                    group = name,
                    pid,
                    command = %command::render(&argv),
                    "tunnel started"
                );
                self.reap(name, pid, child);
                Ok(StartOutcome::Started(pid))
            }
            Err(RegistryError::AlreadyRunning { pid: existing, .. }) => {
                tracing::warn!(
                    group = name,
                    pid = existing,
                    discarded = pid,
                    "another instance is already recorded"
                );
                discard(child).await;
                Ok(StartOutcome::AlreadyRunning(existing))
            }
            Err(e) => {
                discard(child).await;
                Err(e.into())
            }
        }
    }

    async fn stop_locked(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        let record = match self.registry.state(name)? {
            RecordState::Absent => return Ok(StopOutcome::NotRunning),
            RecordState::Stale(record) => {
                tracing::info!(group = name, pid = record.pid, "process already gone");
                self.registry.forget(name)?;
                return Ok(StopOutcome::NotRunning);
            }
            RecordState::Running(record) => record,
        };

        let pid = record.pid;
        sys::terminate(pid, self.kill_timeout)
            .await
            .map_err(|source| SupervisorError::Signal {
                name: name.to_string(),
                pid,
                source,
            })?;
        self.registry.forget(name)?;
        tracing::info!(group = name, pid, "tunnel stopped");
        Ok(StopOutcome::Stopped(pid))
    }

    fn spawn(&self, name: &str, argv: &[String]) -> Result<Child, SupervisorError> {
        let spawn_error = |source: std::io::Error| SupervisorError::Spawn {
            name: name.to_string(),
            program: argv.first().cloned().unwrap_or_default(),
            source,
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(spawn_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            )));
        };

        let stdout = open_log(&self.paths.tunnel_log(name), argv).map_err(spawn_error)?;
        let stderr = stdout.try_clone().map_err(spawn_error)?;

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(spawn_error)
    }

    /// Wait on the child so it never lingers as a zombie, then flag the record
    /// if it still describes this pid.
    fn reap(&self, name: &str, pid: u32, mut child: Child) {
        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _guard = supervisor.lock(&name).await;
            match status {
                Ok(status) => tracing::info!(group = %name, pid, %status, "tunnel process exited"),
                Err(e) => tracing::warn!(group = %name, pid, error = %e, "failed to wait on tunnel"),
            }
            if let Err(e) = supervisor.registry.mark(&name, pid, false) {
                tracing::warn!(group = %name, error = %e, "failed to update process record");
            }
        });
    }

    pub async fn run(&self, action: Action, name: &str) -> Result<String, SupervisorError> {
        Ok(match action {
            Action::Start => self.start(name).await?.to_string(),
            Action::Stop => self.stop(name).await?.to_string(),
            Action::Restart => self.restart(name).await?.to_string(),
        })
    }

    /// Apply `action` to each name in turn, collecting every result.
    pub async fn apply(&self, action: Action, names: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for name in names {
            match self.run(action, name).await {
                Ok(message) => report.ok(name, message),
                Err(e) => {
                    tracing::error!(group = %name, error = %e, "{action} failed");
                    report.fail(name, e);
                }
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    fn configured(&self, report: &mut BatchReport) -> Option<Vec<String>> {
        match self.store.list() {
            Ok(names) => Some(names),
            Err(e) => {
                report.fail("<config>", e);
                None
            }
        }
    }

    pub async fn start_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        if let Some(names) = self.configured(&mut report) {
            report.merge(self.apply(Action::Start, &names).await);
        }
        report
    }

    pub async fn restart_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        if let Some(names) = self.configured(&mut report) {
            report.merge(self.apply(Action::Restart, &names).await);
        }
        report
    }

    /// Every configured group plus anything the registry still tracks.
    pub async fn stop_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        let mut names = BTreeSet::new();
        if let Some(configured) = self.configured(&mut report) {
            names.extend(configured);
        }
        match self.registry.names() {
            Ok(recorded) => names.extend(recorded),
            Err(e) => report.fail("<registry>", e),
        }
        let names: Vec<String> = names.into_iter().collect();
        report.merge(self.apply(Action::Stop, &names).await);
        report
    }

    /// Stop orphans, then restart every configured group one by one.
    pub async fn reload_all(&self) -> BatchReport {
        let mut report = self.stop_orphans().await;
        report.merge(self.restart_all().await);
        report
    }

    /// Converge the registry with the store: orphaned records are stopped,
    /// stale ones cleared, and configured groups started when `autostart` is
    /// set.
    pub async fn reconcile(&self) -> BatchReport {
        let mut report = self.stop_orphans().await;
        let Some(configured) = self.configured(&mut report) else {
            return report;
        };
        for name in &configured {
            if let Err(e) = self.registry.is_alive(name) {
                report.fail(name, e);
            }
        }
        if self.autostart {
            report.merge(self.apply(Action::Start, &configured).await);
        }
        report
    }

    async fn stop_orphans(&self) -> BatchReport {
        let mut report = BatchReport::default();
        // an unreadable store must not turn every record into an orphan
        let Some(configured) = self.configured(&mut report) else {
            return report;
        };
        let recorded = match self.registry.names() {
            Ok(names) => names,
            Err(e) => {
                report.fail("<registry>", e);
                return report;
            }
        };
        let orphans: Vec<String> = recorded
            .into_iter()
            .filter(|name| !configured.contains(name))
            .collect();
        for name in &orphans {
            tracing::info!(group = %name, "stopping orphaned tunnel");
        }
        report.merge(self.apply(Action::Stop, &orphans).await);
        report
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Per-group state. Unscoped, this covers configured groups and orphaned
    /// records; reachability probes run concurrently.
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<GroupStatus>, SupervisorError> {
        let names: Vec<String> = match name {
            Some(name) => {
                config::validate_name(name)?;
                if !self.store.exists(name) && self.registry.get(name)?.is_none() {
                    return Err(ConfigError::NotFound(name.to_string()).into());
                }
                vec![name.to_string()]
            }
            None => {
                let mut names: BTreeSet<String> = self.store.list()?.into_iter().collect();
                names.extend(self.registry.names()?);
                names.into_iter().collect()
            }
        };

        let phases = self.phases.read().await.clone();
        // documents and records are read with std::fs
        let supervisor = self.clone();
        let described = tokio::task::spawn_blocking(move || {
            names
                .iter()
                .map(|name| supervisor.describe(name, phases.get(name).copied()))
                .collect::<Vec<_>>()
        })
        .await?;

        let mut entries = Vec::with_capacity(described.len());
        let mut probes = JoinSet::new();
        for (idx, (entry, target)) in described.into_iter().enumerate() {
            if let Some((host, port)) = target {
                let timeout = self.probe_timeout;
                probes.spawn(async move { (idx, probe::check_tcp(&host, port, timeout).await) });
            }
            entries.push(entry);
        }
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((idx, reachability)) => entries[idx].reachability = reachability,
                Err(e) => tracing::warn!(error = %e, "reachability probe panicked"),
            }
        }
        Ok(entries)
    }

    fn describe(
        &self,
        name: &str,
        phase: Option<TunnelState>,
    ) -> (GroupStatus, Option<(String, u16)>) {
        let mut status = GroupStatus {
            name: name.to_string(),
            state: TunnelState::Absent,
            pid: None,
            alive: false,
            configured: false,
            launched_at: None,
            endpoint: None,
            reachability: Reachability::Unknown,
            tunnels: Vec::new(),
            error: None,
        };
        let mut errors = Vec::new();
        let mut target = None;

        if self.store.exists(name) {
            status.configured = true;
            match self.store.load(name) {
                Ok(group) => {
                    status.endpoint = Some(format!(
                        "{}@{}:{}",
                        group.user, group.remote_ip, group.ssh_port
                    ));
                    status.tunnels = group.tunnels.iter().map(ToString::to_string).collect();
                    target = Some((group.remote_ip, group.ssh_port));
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        match self.registry.state(name) {
            Ok(RecordState::Absent) => {}
            Ok(RecordState::Running(record)) => {
                status.state = TunnelState::Running;
                status.pid = Some(record.pid);
                status.alive = true;
                status.launched_at = Some(record.launched_at);
            }
            Ok(RecordState::Stale(record)) => {
                status.state = TunnelState::Stale;
                status.pid = Some(record.pid);
                status.launched_at = Some(record.launched_at);
            }
            Err(e) => errors.push(e.to_string()),
        }

        if let Some(phase) = phase {
            status.state = phase;
        }
        if !errors.is_empty() {
            status.error = Some(errors.join("; "));
        }
        (status, target)
    }

    // -----------------------------------------------------------------------
    // Command surface
    // -----------------------------------------------------------------------

    /// Serve one request. `Kill` is handled by the daemon before it gets here.
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Start { names } => self.dispatch_batch(Action::Start, names).await,
            Request::Stop { names } => self.dispatch_batch(Action::Stop, names).await,
            Request::Restart { names } => self.dispatch_batch(Action::Restart, names).await,
            Request::Status { name } => match self.status(name.as_deref()).await {
                Ok(groups) => Response::Status { groups },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::AddTunnel { group, spec } => {
                let message = format!("added '{}' ({spec}) to '{group}'", spec.name());
                let _guard = self.lock(&group).await;
                match self.store.add_tunnel(&group, spec) {
                    Ok(_) => Response::Success {
                        message: Some(message),
                    },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }
            Request::RemoveTunnel { group, tunnel } => {
                let _guard = self.lock(&group).await;
                match self.store.remove_tunnel(&group, &tunnel) {
                    Ok(0) => Response::Success {
                        message: Some(format!("no tunnel named '{tunnel}' in '{group}'")),
                    },
                    Ok(n) => Response::Success {
                        message: Some(format!("removed {n} tunnel(s) named '{tunnel}' from '{group}'")),
                    },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }
            Request::Reload => Response::Report {
                report: self.reload_all().await,
            },
            Request::Kill => Response::Error {
                message: "daemon is not running".to_string(),
            },
        }
    }

    async fn dispatch_batch(&self, action: Action, names: Vec<String>) -> Response {
        let report = if names.is_empty() {
            match action {
                Action::Start => self.start_all().await,
                Action::Stop => self.stop_all().await,
                Action::Restart => self.restart_all().await,
            }
        } else {
            self.apply(action, &names).await
        };
        Response::Report { report }
    }
}

fn open_log(path: &Path, argv: &[String]) -> std::io::Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(
        file,
        "[{}] launching: {}",
        chrono::Utc::now().to_rfc3339(),
        command::render(argv)
    )?;
    Ok(file)
}

/// Kill a child that lost the race to be recorded.
async fn discard(mut child: Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        (dir, Supervisor::new(paths, &Settings::default()))
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(StartOutcome::Started(7).to_string(), "started (pid 7)");
        assert_eq!(
            StartOutcome::AlreadyRunning(7).to_string(),
            "already running (pid 7)"
        );
        assert_eq!(StopOutcome::NotRunning.to_string(), "not running");
        assert_eq!(StartOutcome::AlreadyRunning(9).pid(), 9);
    }

    #[test]
    fn test_failed_report_is_batch_error() {
        let mut report = BatchReport::default();
        report.ok("a", "stopped (pid 1)");
        assert!(report.clone().into_result().is_ok());

        report.fail("b", "boom");
        match report.into_result() {
            Err(SupervisorError::Batch(report)) => assert_eq!(report.failed.len(), 1),
            other => panic!("expected batch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_absent_is_noop() {
        let (_dir, supervisor) = supervisor();
        assert_eq!(
            supervisor.stop("siteA").await.unwrap(),
            StopOutcome::NotRunning
        );
        assert!(supervisor.registry().names().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_rejects_path_names() {
        let (_dir, supervisor) = supervisor();
        assert!(matches!(
            supervisor.stop("../etc").await,
            Err(SupervisorError::Config(ConfigError::InvalidName(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_unknown_group() {
        let (_dir, supervisor) = supervisor();
        assert!(matches!(
            supervisor.start("ghost").await,
            Err(SupervisorError::Config(ConfigError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_status_empty_store() {
        let (_dir, supervisor) = supervisor();
        assert!(supervisor.status(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_is_not_served_in_process() {
        let (_dir, supervisor) = supervisor();
        assert!(matches!(
            supervisor.dispatch(Request::Kill).await,
            Response::Error { .. }
        ));
    }
}
