use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use crate::settings::Settings;
use crate::supervisor::Supervisor;
use crate::sys;
use crate::watch as config_watch;
use color_eyre::eyre::{Context, bail};
use std::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;

/// Run the daemon in the foreground until `kill`, SIGTERM or SIGINT. Every
/// supervised tunnel is stopped on the way out.
pub async fn run(paths: Paths, settings: Settings) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.data_dir())?;

    if let Some(existing) = pid::running_daemon(&paths)? {
        bail!("daemon is already running (pid {existing})");
    }

    let supervisor = Supervisor::new(paths.clone(), &settings);
    supervisor
        .registry()
        .ensure_ready()
        .context("process registry is not usable")?;
    fs::create_dir_all(paths.config_dir())
        .with_context(|| format!("failed to create {}", paths.config_dir().display()))?;

    pid::write_pid_file(&paths)?;

    let socket_path = paths.socket_file();
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(pid = std::process::id(), socket = %socket_path.display(), "daemon listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let report = supervisor.reconcile().await;
    for (name, error) in &report.failed {
        tracing::warn!(group = %name, %error, "reconcile failed");
    }

    let watcher = if settings.daemon.watch {
        match config_watch::spawn_watcher(supervisor.clone(), shutdown_rx.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "configuration watch unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let result = run_accept_loop(&supervisor, &listener, &shutdown_tx, &mut shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = watcher {
        let _ = handle.await;
    }

    match supervisor.stop_all().await.into_result() {
        Ok(report) => tracing::info!(stopped = report.succeeded.len(), "tunnels stopped"),
        Err(e) => tracing::error!(error = %e, "failed to stop every tunnel during shutdown"),
    }

    let _ = fs::remove_file(paths.socket_file());
    pid::remove_pid_file(&paths);
    tracing::info!("daemon stopped");

    result
}

async fn run_accept_loop(
    supervisor: &Supervisor,
    listener: &UnixListener,
    shutdown_tx: &watch::Sender<bool>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _addr) = accept_result?;
                let tx = shutdown_tx.clone();
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &tx, &supervisor).await {
                        tracing::warn!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            signal = sys::signal_shutdown() => {
                signal?;
                tracing::info!("termination signal received");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    shutdown_tx: &watch::Sender<bool>,
    supervisor: &Supervisor,
) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(Request::Kill) => {
            let _ = shutdown_tx.send(true);
            Response::Success {
                message: Some("daemon shutting down".to_string()),
            }
        }
        Ok(request) => {
            tracing::debug!(?request, "request");
            supervisor.dispatch(request).await
        }
        Err(e) => Response::Error {
            message: format!("bad request: {e}"),
        },
    };
    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}
