//! Configuration management for fsmonitord.
//!
//! Uses figment to merge configuration from multiple sources:
//! 1. Default values
//! 2. Config file (TOML)
//! 3. Environment variables
//! 4. Command-line arguments

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use fsmonitor_ipc::{Endpoint, TransportOptions};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Worktree watching
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Daemon-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Endpoint path; derived from the worktree root when unset
    #[serde(default)]
    pub endpoint: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How long the accept loop waits before re-arming
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,

    /// How long a connected client may take to send its request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long clients wait for a reply
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// How long clients retry a busy endpoint
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Watch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Worktree root
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Polling interval in seconds; native events when unset
    #[serde(default)]
    pub poll_interval: Option<u64>,

    /// Top-level directories whose changes are not recorded
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_timeout_ms() -> u64 {
    50_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_ignore() -> Vec<String> {
    vec![".git".to_string()]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            log_level: default_log_level(),
            listen_timeout_ms: default_listen_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            poll_interval: None,
            ignore: default_ignore(),
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_file: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(config_file).extract()
    }

    fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Add config file if provided
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        } else {
            // Try default config locations
            let default_paths = [
                PathBuf::from("/etc/fsmonitor/config.toml"),
                dirs::config_dir()
                    .unwrap_or_default()
                    .join("fsmonitor/config.toml"),
            ];

            for path in &default_paths {
                if path.exists() {
                    figment = figment.merge(Toml::file(path));
                    break;
                }
            }
        }

        // Environment variables (FSMONITORD_ prefix, FSMONITORD_DAEMON__LOG_LEVEL)
        figment.merge(Env::prefixed("FSMONITORD_").split("__"))
    }

    /// Override endpoint from CLI
    pub fn with_endpoint(mut self, endpoint: Option<PathBuf>) -> Self {
        if let Some(e) = endpoint {
            self.daemon.endpoint = Some(e);
        }
        self
    }

    /// Override log level from CLI
    pub fn with_log_level(mut self, log_level: Option<String>) -> Self {
        if let Some(level) = log_level {
            self.daemon.log_level = level;
        }
        self
    }

    /// Override worktree root from CLI
    pub fn with_root(mut self, root: Option<PathBuf>) -> Self {
        if let Some(r) = root {
            self.watch.root = r;
        }
        self
    }

    /// Override polling interval from CLI
    pub fn with_poll_interval(mut self, poll_interval: Option<u64>) -> Self {
        if poll_interval.is_some() {
            self.watch.poll_interval = poll_interval;
        }
        self
    }

    /// The configured endpoint, or the worktree default.
    pub fn endpoint(&self) -> Endpoint {
        match &self.daemon.endpoint {
            Some(path) => Endpoint::new(path.clone()),
            None => Endpoint::for_worktree(&self.watch.root),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_timeout: Duration::from_millis(self.daemon.listen_timeout_ms),
            request_timeout: Duration::from_millis(self.daemon.request_timeout_ms),
            response_timeout: Duration::from_millis(self.daemon.response_timeout_ms),
            connect_timeout: Duration::from_millis(self.daemon.connect_timeout_ms),
        }
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.watch.poll_interval.map(Duration::from_secs)
    }

    /// Ignored top-level components, plus the endpoint's own entry when it
    /// lives inside the worktree.
    pub fn watch_ignores(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut ignore = self.watch.ignore.clone();
        let top = endpoint
            .path()
            .strip_prefix(&self.watch.root)
            .ok()
            .and_then(|relative| relative.components().next());
        if let Some(Component::Normal(top)) = top {
            let top = top.to_string_lossy().into_owned();
            if !ignore.contains(&top) {
                ignore.push(top);
            }
        }
        ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.endpoint, None);
        assert_eq!(config.watch.root, PathBuf::from("."));
        assert_eq!(config.watch.ignore, vec![".git".to_string()]);
        assert_eq!(config.poll_interval(), None);
    }

    #[test]
    fn test_default_transport_options_match_ipc_defaults() {
        assert_eq!(Config::default().transport_options(), TransportOptions::default());
    }

    #[test]
    fn test_config_override_endpoint() {
        let config = Config::default().with_endpoint(Some(PathBuf::from("/tmp/test.ipc")));
        assert_eq!(config.endpoint().path(), Path::new("/tmp/test.ipc"));
    }

    #[test]
    fn test_config_override_log_level() {
        let config = Config::default().with_log_level(Some("debug".to_string()));
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_config_override_poll_interval() {
        let config = Config::default().with_poll_interval(Some(3));
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(3)));
        let config = config.with_poll_interval(None);
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_watch_ignores_endpoint_inside_worktree() {
        let config = Config::default().with_root(Some(PathBuf::from("/srv/repo")));

        let outside = Endpoint::new("/run/fsmonitor.ipc");
        assert_eq!(config.watch_ignores(&outside), vec![".git".to_string()]);

        let in_git = Endpoint::new("/srv/repo/.git/fsmonitor--daemon.ipc");
        assert_eq!(config.watch_ignores(&in_git), vec![".git".to_string()]);

        let at_root = Endpoint::new("/srv/repo/.fsmonitor--daemon.ipc");
        assert_eq!(
            config.watch_ignores(&at_root),
            vec![".git".to_string(), ".fsmonitor--daemon.ipc".to_string()]
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
log_level = "trace"
response_timeout_ms = 250

[watch]
root = "/srv/repo"
poll_interval = 7
"#,
        )
        .unwrap();

        let config: Config = Config::figment(Some(path.as_path())).extract().unwrap();
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.transport_options().response_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.daemon.request_timeout_ms, 5_000);
        assert_eq!(config.watch.root, PathBuf::from("/srv/repo"));
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(7)));
        assert_eq!(config.watch.ignore, vec![".git".to_string()]);
    }
}
