//! Process-wide client configuration loaded from YAML.
//!
//! ```yaml
//! default_license_url: https://license.example/verify
//! request_timeout_secs: 20
//! user_agent: my-player/1.0
//! identity:
//!   merchantId: merchant
//!   appId: app
//!   userId: user
//!   sessionId: session
//! ```
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::custom_data::Identity;
use crate::error::{Error, Result};

/// License server used when neither the asset nor the configuration names one.
pub const DEFAULT_LICENSE_SERVER_URL: &str =
    "https://license.sigmadrm.com/license/verify/widevine";

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// License URL for assets that do not configure `licenseServerUrl`.
    #[serde(default = "default_license_url")]
    pub default_license_url: String,
    /// Timeout of a single HTTP exchange; `0` disables it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// User agent for assets that do not set one.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Identity fields sent in the `custom-data` header.
    #[serde(default)]
    pub identity: Identity,
}

fn default_license_url() -> String {
    DEFAULT_LICENSE_SERVER_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_license_url: default_license_url(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: None,
            identity: Identity::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfiguration(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    fn validate(&self) -> Result<()> {
        if self.default_license_url.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "default_license_url must not be empty".to_string(),
            ));
        }
        url::Url::parse(&self.default_license_url).map_err(|e| {
            Error::InvalidConfiguration(format!(
                "Invalid default_license_url {:?}: {}",
                self.default_license_url, e
            ))
        })?;
        Ok(())
    }
}
