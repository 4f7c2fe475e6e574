use crate::config::TunnelSpec;
use crate::probe::Reachability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An empty `names` list addresses every configured group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Start {
        #[serde(default)]
        names: Vec<String>,
    },
    Stop {
        #[serde(default)]
        names: Vec<String>,
    },
    Restart {
        #[serde(default)]
        names: Vec<String>,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    AddTunnel {
        group: String,
        spec: TunnelSpec,
    },
    RemoveTunnel {
        group: String,
        tunnel: String,
    },
    Reload,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    Report {
        report: BatchReport,
    },
    Status {
        groups: Vec<GroupStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Absent,
    Starting,
    Running,
    Stopping,
    Stale,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Absent => write!(f, "stopped"),
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Running => write!(f, "running"),
            TunnelState::Stopping => write!(f, "stopping"),
            TunnelState::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub name: String,
    pub state: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub alive: bool,
    /// False for a registry record whose group document no longer exists.
    pub configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub reachability: Reachability,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<String>,
    /// Set when the group document could not be loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-name results of a bulk action. Failures never abort the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    #[serde(default)]
    pub succeeded: Vec<(String, String)>,
    #[serde(default)]
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn ok(&mut self, name: &str, message: impl Into<String>) {
        self.succeeded.push((name.to_string(), message.into()));
    }

    pub fn fail(&mut self, name: &str, error: impl std::fmt::Display) {
        self.failed.push((name.to_string(), error.to_string()));
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let failed: Vec<String> = self
            .failed
            .iter()
            .map(|(name, error)| format!("{name}: {error}"))
            .collect();
        write!(
            f,
            "{} of {} failed: {}",
            self.failed.len(),
            self.failed.len() + self.succeeded.len(),
            failed.join("; ")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty response from daemon")]
    EmptyResponse,
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: &Request) -> Request {
        let bytes = encode_request(req).unwrap();
        decode_request(std::str::from_utf8(&bytes).unwrap()).unwrap()
    }

    fn roundtrip_response(resp: &Response) -> Response {
        let bytes = encode_response(resp).unwrap();
        decode_response(std::str::from_utf8(&bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let bytes = encode_request(&Request::Stop {
            names: vec!["siteA".to_string()],
        })
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "{\"type\":\"stop\",\"names\":[\"siteA\"]}\n"
        );
    }

    #[test]
    fn test_names_default_to_empty() {
        assert_eq!(
            decode_request(r#"{"type":"restart"}"#).unwrap(),
            Request::Restart { names: vec![] }
        );
        assert_eq!(
            decode_request(r#"{"type":"status"}"#).unwrap(),
            Request::Status { name: None }
        );
    }

    #[test]
    fn test_add_tunnel_carries_tagged_spec() {
        let req = Request::AddTunnel {
            group: "siteA".to_string(),
            spec: TunnelSpec::Dynamic {
                name: "socks".to_string(),
                listen_port: 1080,
            },
        };
        let bytes = encode_request(&req).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "add_tunnel");
        assert_eq!(json["spec"]["kind"], "dynamic");
        assert_eq!(roundtrip_request(&req), req);
    }

    #[test]
    fn test_status_response_roundtrip() {
        let resp = Response::Status {
            groups: vec![GroupStatus {
                name: "siteA".to_string(),
                state: TunnelState::Running,
                pid: Some(4242),
                alive: true,
                configured: true,
                launched_at: Some(Utc::now()),
                endpoint: Some("tunnel@203.0.113.7:22".to_string()),
                reachability: Reachability::Reachable { latency_ms: 12 },
                tunnels: vec!["-L 8080:localhost:80".to_string()],
                error: None,
            }],
        };
        assert_eq!(roundtrip_response(&resp), resp);
    }

    #[test]
    fn test_report_response_roundtrip() {
        let mut report = BatchReport::default();
        report.ok("siteA", "started (pid 10)");
        report.fail("siteB", "tunnel group not found: siteB");
        let resp = Response::Report { report };
        assert_eq!(roundtrip_response(&resp), resp);
    }

    #[test]
    fn test_batch_report_display() {
        let mut report = BatchReport::default();
        report.ok("a", "stopped");
        report.fail("b", "boom");
        assert!(!report.is_success());
        assert_eq!(report.to_string(), "1 of 2 failed: b: boom");
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            decode_request("not json at all"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        assert!(decode_request(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_decode_missing_required_field() {
        assert!(decode_request(r#"{"type":"remove_tunnel","group":"siteA"}"#).is_err());
    }

    #[test]
    fn test_decode_trims_newline() {
        let bytes = encode_request(&Request::Kill).unwrap();
        let line = std::str::from_utf8(&bytes).unwrap();
        let padded = format!("{line}  \r\n");
        assert_eq!(decode_request(&padded).unwrap(), Request::Kill);
    }

    #[test]
    fn test_tunnel_state_display() {
        assert_eq!(TunnelState::Absent.to_string(), "stopped");
        assert_eq!(TunnelState::Stale.to_string(), "stale");
    }
}
