use crate::error::{CloudError, CloudResult};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use std::{env, fs};
use tracing::info;

/// Optional metrics a user can suppress per device. Toggles affect how
/// readings are presented in events, never what is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    EnergyT1,
    EnergyT2,
    EnergyT3,
    PowerFactor,
    WifiSignal,
}

/// Per-device metric suppression, keyed by meter serial number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricToggle {
    pub serial_number: String,
    #[serde(default)]
    pub disabled: Vec<Metric>,
}

/// One configured cloud account (the credential store for that account).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub username: String,
    pub password: String,
    /// Presentation-only metric suppression for this account's meters.
    #[serde(default)]
    pub metric_toggles: Vec<MetricToggle>,
}

impl AccountConfig {
    /// Disabled metrics for one of this account's meters.
    pub fn disabled_metrics(&self, serial: &str) -> Vec<Metric> {
        self.metric_toggles
            .iter()
            .find(|t| t.serial_number == serial)
            .map(|t| t.disabled.clone())
            .unwrap_or_default()
    }
}

/// Bridge configuration: accounts plus the polling constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Base URL of the cloud metering service.
    pub base_url: String,
    /// Seconds between scheduled fetch cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Run device discovery every Nth scheduled cycle.
    #[serde(default = "default_discovery_every")]
    pub discovery_every: u32,
    /// Consecutive account-level failures before the account is degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// Consecutive per-device failures before a cached reading is
    /// reported unavailable.
    #[serde(default = "default_unavailable_after")]
    pub unavailable_after: u32,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default, rename = "account")]
    pub accounts: Vec<AccountConfig>,
}

fn default_poll_interval_secs() -> u64 {
    300
}
fn default_discovery_every() -> u32 {
    10
}
fn default_degraded_after() -> u32 {
    3
}
fn default_unavailable_after() -> u32 {
    6
}
fn default_api_timeout_secs() -> u64 {
    20
}

impl BridgeConfig {
    /// Loads configuration from the TOML file named by `METER_BRIDGE_CONFIG`
    /// (default `bridge.toml`), falling back to a single account described
    /// entirely by `METER_CLOUD_URL` / `METER_CLOUD_USERNAME` /
    /// `METER_CLOUD_PASSWORD` when no file exists.
    pub fn load() -> CloudResult<Self> {
        let path = env::var("METER_BRIDGE_CONFIG").unwrap_or_else(|_| "bridge.toml".to_string());

        if let Ok(raw) = fs::read_to_string(&path) {
            info!(path, "Loading bridge configuration file");
            return Self::from_toml_str(&raw);
        }

        info!("No configuration file found, using environment variables");
        Self::from_env()
    }

    /// Parses and validates a TOML configuration document.
    pub fn from_toml_str(raw: &str) -> CloudResult<Self> {
        let config: BridgeConfig = toml::from_str(raw)
            .map_err(|e| CloudError::Config(format!("invalid configuration file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Single-account fallback from environment variables.
    pub fn from_env() -> CloudResult<Self> {
        let base_url = env::var("METER_CLOUD_URL")
            .map_err(|_| CloudError::Config("METER_CLOUD_URL is not set".to_string()))?;
        let username = env::var("METER_CLOUD_USERNAME")
            .map_err(|_| CloudError::Config("METER_CLOUD_USERNAME is not set".to_string()))?;
        let password = env::var("METER_CLOUD_PASSWORD")
            .map_err(|_| CloudError::Config("METER_CLOUD_PASSWORD is not set".to_string()))?;

        let config = Self {
            base_url,
            poll_interval_secs: default_poll_interval_secs(),
            discovery_every: default_discovery_every(),
            degraded_after: default_degraded_after(),
            unavailable_after: default_unavailable_after(),
            api_timeout_secs: default_api_timeout_secs(),
            accounts: vec![AccountConfig {
                id: "default".to_string(),
                username,
                password,
                metric_toggles: Vec::new(),
            }],
        };
        config.validate()?;
        Ok(config)
    }

    /// Setup-time validation; failures here never surface during polling.
    pub fn validate(&self) -> CloudResult<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(CloudError::Config(format!(
                "base_url must be an http(s) URL, got `{}`",
                self.base_url
            )));
        }
        if self.accounts.is_empty() {
            return Err(CloudError::Config("no accounts configured".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(CloudError::Config("poll_interval_secs must be > 0".to_string()));
        }
        if self.discovery_every == 0 {
            return Err(CloudError::Config("discovery_every must be > 0".to_string()));
        }
        for account in &self.accounts {
            if account.id.is_empty() {
                return Err(CloudError::Config("account id must not be empty".to_string()));
            }
            if account.username.is_empty() || account.password.is_empty() {
                return Err(CloudError::Config(format!(
                    "account `{}` has empty credentials",
                    account.id
                )));
            }
        }
        let mut ids: Vec<&str> = self.accounts.iter().map(|a| a.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.accounts.len() {
            return Err(CloudError::Config("duplicate account ids".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        base_url = "https://cloud.example.com"
        poll_interval_secs = 120

        [[account]]
        id = "home"
        username = "alice@example.com"
        password = "hunter2"

        [[account.metric_toggles]]
        serial_number = "M100"
        disabled = ["energy_t3", "wifi_signal"]

        [[account]]
        id = "cottage"
        username = "bob@example.com"
        password = "secret"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = BridgeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.base_url, "https://cloud.example.com");
        assert_eq!(config.poll_interval_secs, 120);
        // Unset constants fall back to defaults.
        assert_eq!(config.discovery_every, 10);
        assert_eq!(config.degraded_after, 3);
        assert_eq!(config.unavailable_after, 6);
        assert_eq!(config.api_timeout_secs, 20);
        assert_eq!(config.accounts.len(), 2);

        let home = &config.accounts[0];
        assert_eq!(
            home.disabled_metrics("M100"),
            vec![Metric::EnergyT3, Metric::WifiSignal]
        );
        assert!(home.disabled_metrics("M999").is_empty());
    }

    #[test]
    fn test_empty_credentials_rejected() {
        let raw = r#"
            base_url = "https://cloud.example.com"

            [[account]]
            id = "home"
            username = ""
            password = "hunter2"
        "#;
        let err = BridgeConfig::from_toml_str(raw).unwrap_err();
        assert!(err.is_config(), "expected ConfigError, got {err:?}");
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let raw = r#"
            base_url = "ftp://cloud.example.com"

            [[account]]
            id = "home"
            username = "alice"
            password = "hunter2"
        "#;
        assert!(BridgeConfig::from_toml_str(raw).unwrap_err().is_config());
    }

    #[test]
    fn test_duplicate_account_ids_rejected() {
        let raw = r#"
            base_url = "https://cloud.example.com"

            [[account]]
            id = "home"
            username = "alice"
            password = "a"

            [[account]]
            id = "home"
            username = "bob"
            password = "b"
        "#;
        assert!(BridgeConfig::from_toml_str(raw).unwrap_err().is_config());
    }

    #[test]
    fn test_no_accounts_rejected() {
        let raw = r#"base_url = "https://cloud.example.com""#;
        assert!(BridgeConfig::from_toml_str(raw).unwrap_err().is_config());
    }
}
