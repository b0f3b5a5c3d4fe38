use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sunrpcd/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the local socket and its lock file
    pub rundir: PathBuf,
    pub socket_name: String,
    /// Shared TCP port, multiplexed with other protocols
    pub listen_addr: SocketAddr,
    /// Capacity of the disconnect notification channel
    pub notify_buffer: usize,
    pub max_record_size: usize,
    /// How long the multiplexer waits for a new connection's first bytes
    pub match_timeout_ms: u64,
    pub verbose: bool,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rundir: PathBuf::from("/var/run/sunrpcd"),
            socket_name: "sunrpcd.socket".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 24007)),
            notify_buffer: 1024,
            max_record_size: 4 * 1024 * 1024,
            match_timeout_ms: 5000,
            verbose: false,
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `SUNRPCD_*` environment variables and
    /// command-line overrides, later sources winning.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("SUNRPCD_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.rundir.join(&self.socket_name)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.rundir.join(format!("{}.lock", self.socket_name))
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_millis(self.match_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Overrides {
        rundir: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    }

    #[test]
    fn test_derived_paths() {
        let config = AppConfig {
            rundir: PathBuf::from("/run/gd"),
            ..AppConfig::default()
        };
        assert_eq!(config.socket_path(), PathBuf::from("/run/gd/sunrpcd.socket"));
        assert_eq!(config.lock_path(), PathBuf::from("/run/gd/sunrpcd.socket.lock"));
    }

    #[test]
    fn test_file_and_overrides_layer() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "socket_name = \"gd2.socket\"\nnotify_buffer = 16\n").unwrap();

        let overrides = Overrides {
            rundir: dir.path().to_path_buf(),
            verbose: None,
        };
        let config = AppConfig::new(Some(file.as_path()), Some(&overrides)).unwrap();

        assert_eq!(config.socket_name, "gd2.socket");
        assert_eq!(config.notify_buffer, 16);
        assert_eq!(config.rundir, dir.path());
        assert!(!config.verbose);
        assert_eq!(config.listen_addr, AppConfig::default().listen_addr);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.toml");
        let config = AppConfig::new::<Overrides>(Some(absent.as_path()), None).unwrap();
        assert_eq!(config.socket_name, AppConfig::default().socket_name);
    }
}
