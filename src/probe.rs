use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Outcome of one TCP connect against a group's ssh endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reachability {
    Reachable { latency_ms: u64 },
    Unreachable,
    TimedOut,
    /// Not probed, e.g. the group's document could not be loaded.
    Unknown,
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Reachable { latency_ms } => write!(f, "reachable ({latency_ms}ms)"),
            Reachability::Unreachable => write!(f, "unreachable"),
            Reachability::TimedOut => write!(f, "timed out"),
            Reachability::Unknown => write!(f, "unknown"),
        }
    }
}

fn socket_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Connect to `host:port`, giving up after `timeout`. Name resolution counts
/// against the same budget.
pub async fn check_tcp(host: &str, port: u16, timeout: Duration) -> Reachability {
    let addr = socket_addr(host, port);
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Reachability::Reachable {
            latency_ms: started.elapsed().as_millis() as u64,
        },
        Ok(Err(e)) => {
            tracing::debug!(addr = %addr, error = %e, "reachability probe failed");
            Reachability::Unreachable
        }
        Err(_) => Reachability::TimedOut,
    }
}
