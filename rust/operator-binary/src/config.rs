use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";
pub const DEFAULT_REQUEUE_INTERVAL_SECONDS: u64 = 5;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read config file {}", path.display()))]
    ReadConfigFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse config file {}", path.display()))]
    ParseConfigFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },
}

/// Settings read from `--config-file`. Every field has a default, so an absent file is the
/// same as an empty one.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub open_kruise: OpenKruiseConfig,

    /// Delay before a reconcile blocked on rollouts runs again, in seconds.
    #[serde(default = "default_requeue_interval")]
    pub requeue_interval: u64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Directory holding `tls.crt` and `tls.key`.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            webhook: WebhookConfig::default(),
            open_kruise: OpenKruiseConfig::default(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL_SECONDS,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enable: true,
            cert_dir: default_cert_dir(),
        }
    }
}

impl WebhookConfig {
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join("tls.crt")
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join("tls.key")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenKruiseConfig {
    #[serde(default)]
    pub enable: bool,
}

fn default_true() -> bool {
    true
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CERT_DIR)
}

fn default_requeue_interval() -> u64 {
    DEFAULT_REQUEUE_INTERVAL_SECONDS
}

impl OperatorConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).context(ReadConfigFileSnafu { path })?;
        Self::from_yaml(&content).context(ParseConfigFileSnafu { path })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::from_yaml("").unwrap();
        assert!(config.webhook.enable);
        assert!(!config.open_kruise.enable);
        assert_eq!(config.requeue_interval(), Duration::from_secs(5));
        assert_eq!(
            config.webhook.cert_path(),
            PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.crt")
        );

        assert_eq!(OperatorConfig::from_yaml("{}").unwrap(), config);
    }

    #[test]
    fn test_parse() {
        let config = OperatorConfig::from_yaml(indoc! {"
            webhook:
              enable: false
              certDir: /etc/webhook/certs
            openKruise:
              enable: true
            requeueInterval: 10
        "})
        .unwrap();

        assert!(!config.webhook.enable);
        assert_eq!(
            config.webhook.key_path(),
            PathBuf::from("/etc/webhook/certs/tls.key")
        );
        assert!(config.open_kruise.enable);
        assert_eq!(config.requeue_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_field_types_are_rejected() {
        assert!(OperatorConfig::from_yaml("requeueInterval: soon").is_err());
    }
}
