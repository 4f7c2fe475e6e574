use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
    config_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var("SSHTUNNEL_DATA_DIR") {
            return Ok(Self::with_base(PathBuf::from(path)));
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self::with_base(base.join("sshtunnel")))
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self {
            config_dir: base.join("conf.d"),
            data_dir: base,
        }
    }

    /// Points the configuration store somewhere other than `<data>/conf.d`.
    pub fn with_config_dir(mut self, dir: PathBuf) -> Self {
        self.config_dir = dir;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.toml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("sshtunnel.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("sshtunnel.sock")
    }

    pub fn tunnel_log(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{name}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_data_dir() {
        let paths = Paths::with_base(PathBuf::from("/tmp/sshtunnel-test"));
        assert!(paths.pid_file().ends_with("sshtunnel.pid"));
        assert!(paths.socket_file().ends_with("sshtunnel.sock"));
        assert!(paths.config_dir().ends_with("conf.d"));
        assert!(paths.registry_dir().ends_with("run"));
        assert!(paths.log_dir().ends_with("logs"));
        for p in [
            paths.pid_file(),
            paths.socket_file(),
            paths.registry_dir(),
            paths.log_dir(),
            paths.settings_file(),
        ] {
            assert!(p.starts_with(paths.data_dir()), "{} escapes data dir", p.display());
        }
    }

    #[test]
    fn test_tunnel_log_includes_name() {
        let paths = Paths::with_base(PathBuf::from("/tmp/sshtunnel-test"));
        assert!(paths.tunnel_log("siteA").ends_with("logs/siteA.log"));
    }

    #[test]
    fn test_config_dir_override() {
        let paths = Paths::with_base(PathBuf::from("/tmp/sshtunnel-test"))
            .with_config_dir(PathBuf::from("/etc/sshtunnel/conf.d"));
        assert_eq!(paths.config_dir(), Path::new("/etc/sshtunnel/conf.d"));
        // runtime state stays under the data dir
        assert!(paths.registry_dir().starts_with("/tmp/sshtunnel-test"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_data_dir_linux() {
        if std::env::var("SSHTUNNEL_DATA_DIR").is_ok() {
            return;
        }
        let paths = Paths::new().unwrap();
        let data_dir = paths.data_dir().to_str().unwrap();
        assert!(
            data_dir.contains("sshtunnel"),
            "expected Linux data dir, got: {data_dir}"
        );
    }
}
