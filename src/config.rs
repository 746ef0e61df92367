//! Configuration loader and validator for the dispatch hub.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub provider: Provider,
    /// REST channel services keyed by channel name. The bulk-messaging
    /// channel is built in and must not appear here.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelEndpoint>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Worker idle sleep between queue scans.
    pub poll_interval_ms: u64,
    /// Steady-state re-poll cadence for messages that are not yet settled.
    pub resync_interval_seconds: u64,
    /// Cap on the exponential backoff applied when the provider is down.
    pub max_backoff_seconds: u64,
    /// How many group status queries may be in flight for one sync run.
    pub poll_concurrency: usize,
    /// Per-call timeout for a single group status query.
    pub status_timeout_ms: u64,
}

/// Bulk-messaging provider gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provider {
    pub base_url: String,
    pub api_key: String,
    /// The provider's published maximum recipients per submitted group.
    pub group_size_limit: usize,
}

/// One REST channel service (blog, micro-blog, chat-channel, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelEndpoint {
    pub base_url: String,
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.resync_interval_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.resync_interval_seconds must be > 0",
        ));
    }
    if cfg.app.poll_concurrency == 0 {
        return Err(ConfigError::Invalid("app.poll_concurrency must be > 0"));
    }
    if cfg.app.status_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.status_timeout_ms must be > 0"));
    }

    if cfg.provider.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.base_url must be non-empty"));
    }
    if cfg.provider.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.api_key must be non-empty"));
    }
    if cfg.provider.group_size_limit == 0 {
        return Err(ConfigError::Invalid("provider.group_size_limit must be > 0"));
    }

    for (name, endpoint) in &cfg.channels {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("channels: channel name must be non-empty"));
        }
        if name == crate::channels::BULK_MESSAGING {
            return Err(ConfigError::Invalid(
                "channels: bulk-messaging is built in and must not be configured as a REST channel",
            ));
        }
        if endpoint.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("channels: base_url must be non-empty"));
        }
        if endpoint.token.trim().is_empty() {
            return Err(ConfigError::Invalid("channels: token must be non-empty"));
        }
    }

    Ok(())
}

/// Example configuration, kept in sync with the schema above.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  resync_interval_seconds: 30
  max_backoff_seconds: 600
  poll_concurrency: 4
  status_timeout_ms: 5000

provider:
  base_url: "https://bulk-gateway.example.com/"
  api_key: "YOUR_PROVIDER_API_KEY"
  group_size_limit: 500

channels:
  blog:
    base_url: "https://blog.example.com/api/"
    token: "YOUR_BLOG_TOKEN"
  micro-blog:
    base_url: "https://micro.example.com/api/"
    token: "YOUR_MICRO_BLOG_TOKEN"
  chat-channel:
    base_url: "https://chat.example.com/api/"
    token: "YOUR_CHAT_TOKEN"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.provider.group_size_limit, 500);
        assert!(cfg.channels.contains_key("blog"));
    }

    #[test]
    fn invalid_api_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.provider.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("provider.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_group_size_limit() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.provider.group_size_limit = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("group_size_limit")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn bulk_messaging_must_not_be_a_rest_channel() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.channels.insert(
            crate::channels::BULK_MESSAGING.to_string(),
            ChannelEndpoint {
                base_url: "https://x.example.com/".into(),
                token: "t".into(),
            },
        );
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_channel_endpoint() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.channels.get_mut("blog").unwrap().token = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.resync_interval_seconds, 30);
    }
}
