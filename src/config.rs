use crate::atomic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Local,
    Remote,
    Dynamic,
}

impl TunnelKind {
    /// The ssh flag that introduces a forwarding of this kind.
    pub fn flag(self) -> &'static str {
        match self {
            TunnelKind::Local => "-L",
            TunnelKind::Remote => "-R",
            TunnelKind::Dynamic => "-D",
        }
    }

    fn required_fields(self) -> &'static [&'static str] {
        match self {
            TunnelKind::Local => &["listen_port", "endpoint_host", "endpoint_port"],
            TunnelKind::Remote => &["listen_host", "listen_port", "endpoint_host", "endpoint_port"],
            TunnelKind::Dynamic => &["listen_port"],
        }
    }

    fn usage(self) -> &'static str {
        match self {
            TunnelKind::Local => "local LISTEN_PORT ENDPOINT_HOST ENDPOINT_PORT",
            TunnelKind::Remote => "remote LISTEN_HOST LISTEN_PORT ENDPOINT_HOST ENDPOINT_PORT",
            TunnelKind::Dynamic => "dynamic LISTEN_PORT",
        }
    }
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Local => write!(f, "local"),
            TunnelKind::Remote => write!(f, "remote"),
            TunnelKind::Dynamic => write!(f, "dynamic"),
        }
    }
}

impl std::str::FromStr for TunnelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_start_matches('-') {
            "local" | "l" => Ok(TunnelKind::Local),
            "remote" | "r" => Ok(TunnelKind::Remote),
            "dynamic" | "d" | "socks" => Ok(TunnelKind::Dynamic),
            _ => Err(ConfigError::InvalidSpec(format!(
                "unknown tunnel kind '{s}' (expected local, remote or dynamic)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TunnelSpec {
    Local {
        name: String,
        listen_port: u16,
        endpoint_host: String,
        endpoint_port: u16,
    },
    Remote {
        name: String,
        listen_host: String,
        listen_port: u16,
        endpoint_host: String,
        endpoint_port: u16,
    },
    Dynamic {
        name: String,
        listen_port: u16,
    },
}

impl TunnelSpec {
    pub fn name(&self) -> &str {
        match self {
            TunnelSpec::Local { name, .. }
            | TunnelSpec::Remote { name, .. }
            | TunnelSpec::Dynamic { name, .. } => name,
        }
    }

    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelSpec::Local { .. } => TunnelKind::Local,
            TunnelSpec::Remote { .. } => TunnelKind::Remote,
            TunnelSpec::Dynamic { .. } => TunnelKind::Dynamic,
        }
    }

    pub fn listen_port(&self) -> u16 {
        match self {
            TunnelSpec::Local { listen_port, .. }
            | TunnelSpec::Remote { listen_port, .. }
            | TunnelSpec::Dynamic { listen_port, .. } => *listen_port,
        }
    }

    /// The argument that follows [`TunnelKind::flag`] on the ssh command line.
    pub fn forward_arg(&self) -> String {
        match self {
            TunnelSpec::Local {
                listen_port,
                endpoint_host,
                endpoint_port,
                ..
            } => format!("{listen_port}:{endpoint_host}:{endpoint_port}"),
            TunnelSpec::Remote {
                listen_host,
                listen_port,
                endpoint_host,
                endpoint_port,
                ..
            } => format!("{listen_host}:{listen_port}:{endpoint_host}:{endpoint_port}"),
            TunnelSpec::Dynamic { listen_port, .. } => listen_port.to_string(),
        }
    }

    /// Build a spec from the positional form used on the command line.
    pub fn from_params(
        kind: TunnelKind,
        name: &str,
        params: &[String],
    ) -> Result<TunnelSpec, ConfigError> {
        let expected = kind.required_fields().len();
        if params.len() != expected {
            return Err(ConfigError::InvalidSpec(format!(
                "expected {expected} parameter(s), usage: {}",
                kind.usage()
            )));
        }
        let name = name.to_string();
        let spec = match kind {
            TunnelKind::Local => TunnelSpec::Local {
                name,
                listen_port: parse_port(&params[0])?,
                endpoint_host: params[1].clone(),
                endpoint_port: parse_port(&params[2])?,
            },
            TunnelKind::Remote => TunnelSpec::Remote {
                name,
                listen_host: params[0].clone(),
                listen_port: parse_port(&params[1])?,
                endpoint_host: params[2].clone(),
                endpoint_port: parse_port(&params[3])?,
            },
            TunnelKind::Dynamic => TunnelSpec::Dynamic {
                name,
                listen_port: parse_port(&params[0])?,
            },
        };
        validate_spec(&spec)?;
        Ok(spec)
    }
}

impl std::fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind().flag(), self.forward_arg())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub up: u32,
    pub down: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval: Option<u32>,
    /// Additional `-o key=value` ssh options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Options {
    pub fn is_empty(&self) -> bool {
        self.keepalive_interval.is_none() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelGroup {
    pub user: String,
    pub remote_ip: String,
    pub ssh_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<Bandwidth>,
    pub tunnels: Vec<TunnelSpec>,
}

impl TunnelGroup {
    pub fn new(user: &str, remote_ip: &str, ssh_port: u16) -> Self {
        Self {
            user: user.to_string(),
            remote_ip: remote_ip.to_string(),
            ssh_port,
            private_key_path: None,
            options: Options::default(),
            bandwidth: None,
            tunnels: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("tunnel group not found: {0}")]
    NotFound(String),
    #[error("malformed configuration for '{name}': {reason}")]
    Malformed { name: String, reason: String },
    #[error("invalid tunnel spec: {0}")]
    InvalidSpec(String),
    #[error("invalid group name: {0:?}")]
    InvalidName(String),
    #[error("tunnel group already exists: {0}")]
    AlreadyExists(String),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Group names double as file names in both the store and the registry.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
    {
        return Err(ConfigError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_spec(spec: &TunnelSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| {
        Err(ConfigError::InvalidSpec(format!(
            "tunnel '{}' ({}): {reason}",
            spec.name(),
            spec.kind()
        )))
    };
    if spec.name().trim().is_empty() {
        return Err(ConfigError::InvalidSpec(
            "every tunnel needs a non-empty name".to_string(),
        ));
    }
    match spec {
        TunnelSpec::Local {
            listen_port,
            endpoint_host,
            endpoint_port,
            ..
        } => {
            if *listen_port == 0 || *endpoint_port == 0 {
                return invalid("ports must be between 1 and 65535");
            }
            if endpoint_host.is_empty() {
                return invalid("endpoint_host is empty");
            }
        }
        TunnelSpec::Remote {
            listen_host,
            listen_port,
            endpoint_host,
            endpoint_port,
            ..
        } => {
            if *listen_port == 0 || *endpoint_port == 0 {
                return invalid("ports must be between 1 and 65535");
            }
            if listen_host.is_empty() || endpoint_host.is_empty() {
                return invalid("listen_host and endpoint_host must be set");
            }
        }
        TunnelSpec::Dynamic { listen_port, .. } => {
            if *listen_port == 0 {
                return invalid("listen_port must be between 1 and 65535");
            }
        }
    }
    Ok(())
}

pub fn validate(group: &TunnelGroup) -> Result<(), ConfigError> {
    if group.user.trim().is_empty() {
        return Err(ConfigError::InvalidSpec("`user` is empty".to_string()));
    }
    if group.remote_ip.trim().is_empty() {
        return Err(ConfigError::InvalidSpec("`remote_ip` is empty".to_string()));
    }
    if group.ssh_port == 0 {
        return Err(ConfigError::InvalidSpec(
            "`ssh_port` must be between 1 and 65535".to_string(),
        ));
    }
    if let Some(bw) = group.bandwidth
        && (bw.up == 0 || bw.down == 0)
    {
        return Err(ConfigError::InvalidSpec(
            "bandwidth limits must be positive".to_string(),
        ));
    }

    let mut ports = HashSet::new();
    let mut names = HashSet::new();
    for spec in &group.tunnels {
        validate_spec(spec)?;
        if !ports.insert((spec.kind(), spec.listen_port())) {
            return Err(ConfigError::InvalidSpec(format!(
                "listen port {} is claimed twice by {} tunnels",
                spec.listen_port(),
                spec.kind()
            )));
        }
        if !names.insert((spec.kind(), spec.name())) {
            return Err(ConfigError::InvalidSpec(format!(
                "duplicate {} tunnel name '{}'",
                spec.kind(),
                spec.name()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing and migration
// ---------------------------------------------------------------------------

const REQUIRED_FIELDS: [&str; 4] = ["user", "remote_ip", "ssh_port", "tunnels"];
const PORT_FIELDS: [&str; 2] = ["listen_port", "endpoint_port"];

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ConfigError::InvalidSpec(format!(
            "invalid port '{raw}' (expected 1-65535)"
        ))),
    }
}

/// Parse a group document, migrating older layouts to the canonical schema.
pub fn parse_group(name: &str, content: &str) -> Result<TunnelGroup, ConfigError> {
    let doc: Value = serde_json::from_str(content).map_err(|e| ConfigError::Malformed {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let canonical = normalize(doc)?;
    let group: TunnelGroup =
        serde_json::from_value(canonical).map_err(|e| ConfigError::InvalidSpec(e.to_string()))?;
    validate(&group)?;
    Ok(group)
}

fn rename_key(obj: &mut Map<String, Value>, from: &str, to: &str) {
    if !obj.contains_key(to)
        && let Some(v) = obj.remove(from)
    {
        obj.insert(to.to_string(), v);
    }
}

/// Numeric strings become numbers; anything else is left for serde to reject.
fn coerce_number(obj: &mut Map<String, Value>, key: &str) {
    if let Some(Value::String(s)) = obj.get(key)
        && let Ok(n) = s.trim().parse::<u64>()
    {
        obj.insert(key.to_string(), Value::from(n));
    }
}

fn normalize(doc: Value) -> Result<Value, ConfigError> {
    let Value::Object(mut obj) = doc else {
        return Err(ConfigError::InvalidSpec(
            "document must be a JSON object".to_string(),
        ));
    };

    rename_key(&mut obj, "ip", "remote_ip");
    rename_key(&mut obj, "ssh_key", "private_key_path");
    rename_key(&mut obj, "channels", "tunnels");

    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            return Err(ConfigError::InvalidSpec(format!(
                "missing required field `{field}`"
            )));
        }
    }
    coerce_number(&mut obj, "ssh_port");

    let tunnels = match obj.remove("tunnels") {
        Some(Value::Array(list)) => list
            .into_iter()
            .map(|t| normalize_tunnel(t, None))
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Object(keyed)) => flatten_keyed_tunnels(keyed)?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(ConfigError::InvalidSpec(
                "`tunnels` must be a list".to_string(),
            ));
        }
    };
    obj.insert("tunnels".to_string(), Value::Array(tunnels));

    if let Some(Value::Object(options)) = obj.remove("options") {
        obj.insert("options".to_string(), normalize_options(options));
    }

    if let Some(Value::Object(bw)) = obj.get_mut("bandwidth") {
        coerce_number(bw, "up");
        coerce_number(bw, "down");
    }

    Ok(Value::Object(obj))
}

fn normalize_options(mut options: Map<String, Value>) -> Value {
    let mut out = Map::new();
    coerce_number(&mut options, "keepalive_interval");
    if let Some(v) = options.remove("keepalive_interval") {
        out.insert("keepalive_interval".to_string(), v);
    }
    let mut extra = match options.remove("extra") {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    for (key, value) in options {
        let rendered = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        extra.insert(key, Value::String(rendered));
    }
    if !extra.is_empty() {
        out.insert("extra".to_string(), Value::Object(extra));
    }
    Value::Object(out)
}

/// Older documents keyed tunnels by flag and listen port:
/// `{"-L": {"8080": {...}}}`. Flattened in kind order, then port order, so the
/// resulting argv is stable.
fn flatten_keyed_tunnels(keyed: Map<String, Value>) -> Result<Vec<Value>, ConfigError> {
    let mut entries: Vec<(TunnelKind, u64, Value)> = Vec::new();
    for (kind_key, ports) in keyed {
        let kind: TunnelKind = kind_key.parse()?;
        let Value::Object(ports) = ports else {
            return Err(ConfigError::InvalidSpec(format!(
                "tunnels under '{kind_key}' must be keyed by listen port"
            )));
        };
        for (port_key, tunnel) in ports {
            let port = port_key.parse::<u64>().unwrap_or(0);
            entries.push((kind, port, tunnel));
        }
    }
    entries.sort_by_key(|(kind, port, _)| (*kind, *port));
    entries
        .into_iter()
        .map(|(kind, port, tunnel)| normalize_tunnel(tunnel, Some((kind, port))))
        .collect()
}

fn normalize_tunnel(
    tunnel: Value,
    keyed: Option<(TunnelKind, u64)>,
) -> Result<Value, ConfigError> {
    let Value::Object(mut obj) = tunnel else {
        return Err(ConfigError::InvalidSpec(
            "every tunnel must be an object".to_string(),
        ));
    };

    rename_key(&mut obj, "type", "kind");
    let kind = match (obj.get("kind"), keyed) {
        (Some(Value::String(k)), _) => k.parse::<TunnelKind>()?,
        (None, Some((kind, _))) => kind,
        _ => {
            return Err(ConfigError::InvalidSpec(
                "every tunnel needs a `kind`".to_string(),
            ));
        }
    };
    obj.insert("kind".to_string(), Value::String(kind.to_string()));

    if let Some((_, port)) = keyed
        && port > 0
        && !obj.contains_key("listen_port")
    {
        obj.insert("listen_port".to_string(), Value::from(port));
    }

    let name = match obj.get("name") {
        Some(Value::String(n)) => n.clone(),
        _ => {
            return Err(ConfigError::InvalidSpec(
                "every tunnel needs a `name`".to_string(),
            ));
        }
    };

    for field in kind.required_fields() {
        if !obj.contains_key(*field) {
            return Err(ConfigError::InvalidSpec(format!(
                "tunnel '{name}' ({kind}) is missing `{field}`"
            )));
        }
    }
    for field in PORT_FIELDS {
        coerce_number(&mut obj, field);
    }

    // Fields that do not belong to the kind are dropped so the tagged enum
    // deserializes cleanly.
    obj.retain(|k, _| k == "kind" || k == "name" || kind.required_fields().contains(&k.as_str()));
    Ok(Value::Object(obj))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One JSON document per tunnel group inside a directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.path(name).is_file()
    }

    pub fn load(&self, name: &str) -> Result<TunnelGroup, ConfigError> {
        validate_name(name)?;
        let path = self.path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(name.to_string()));
            }
            Err(e) => return Err(ConfigError::io(&path, e)),
        };
        parse_group(name, &content)
    }

    /// Validate and atomically replace the group's document.
    pub fn save(&self, name: &str, group: &TunnelGroup) -> Result<(), ConfigError> {
        validate_name(name)?;
        validate(group)?;
        let path = self.path(name);
        let mut json = serde_json::to_vec_pretty(group).map_err(|e| ConfigError::Malformed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        json.push(b'\n');
        atomic::write_atomic(&path, &json).map_err(|e| ConfigError::io(&path, e))
    }

    pub fn create(&self, name: &str, group: &TunnelGroup) -> Result<(), ConfigError> {
        if self.exists(name) {
            return Err(ConfigError::AlreadyExists(name.to_string()));
        }
        self.save(name, group)
    }

    /// Returns false when there was nothing to delete.
    pub fn delete(&self, name: &str) -> Result<bool, ConfigError> {
        validate_name(name)?;
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ConfigError::io(&path, e)),
        }
    }

    /// Sorted names of every `*.json` document. A missing directory is an
    /// empty store.
    pub fn list(&self) -> Result<Vec<String>, ConfigError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ConfigError::io(&self.dir, e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| group_name_from_path(&entry.path()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn add_tunnel(&self, name: &str, spec: TunnelSpec) -> Result<TunnelGroup, ConfigError> {
        let mut group = self.load(name)?;
        group.tunnels.push(spec);
        self.save(name, &group)?;
        Ok(group)
    }

    /// Remove every spec called `tunnel_name`, whatever its kind. Returns the
    /// number of specs removed.
    pub fn remove_tunnel(&self, name: &str, tunnel_name: &str) -> Result<usize, ConfigError> {
        let mut group = self.load(name)?;
        let before = group.tunnels.len();
        group.tunnels.retain(|t| t.name() != tunnel_name);
        let removed = before - group.tunnels.len();
        if removed > 0 {
            self.save(name, &group)?;
        }
        Ok(removed)
    }
}

/// Map a path inside the store to its group name, skipping temp files and
/// anything that is not a `.json` document.
pub fn group_name_from_path(path: &Path) -> Option<String> {
    if path.extension()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    validate_name(stem).ok()?;
    Some(stem.to_string())
}
