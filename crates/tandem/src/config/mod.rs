//! Configuration types for the harness.
//!
//! `HarnessConfig` is the per-test-class description (topology, TLS, auth,
//! apps). It is loaded from YAML or built in code and turned into one
//! immutable [`ProxyConfig`] per proxy instance by the topology resolver.

mod proxy;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::topology::TopologyKind;

pub use proxy::{HeaderForm, ProxyConfig, ProxyConfigBuilder, TlsOptions};

/// Virtual host the embedded onboarding application answers on.
pub const APP_HOST: &str = "tandem.harness";
/// Virtual port the embedded onboarding application answers on.
pub const APP_PORT: u16 = 80;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Deployment topology the proxy is stood up in.
    #[serde(default)]
    pub topology: TopologyKind,

    /// Serve TLS on the backends and intercept TLS on the proxy.
    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub tls_options: TlsOptions,

    /// Directory of `<host>.pem` client certificates (mutual-TLS mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certs: Option<PathBuf>,

    /// Require proxy authentication with these credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BasicAuthConfig>,

    /// Register the onboarding app at `APP_HOST:APP_PORT`.
    #[serde(default = "default_apps")]
    pub apps: bool,

    /// Total number of hops when `topology` is `chain`.
    #[serde(default = "default_chain_length")]
    pub chain_length: usize,

    /// Upper bound on waiting for in-flight connections at shutdown.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Prefix of the scratch confidential directory.
    #[serde(default = "default_confdir_prefix")]
    pub confdir_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

fn default_apps() -> bool {
    true
}

fn default_chain_length() -> usize {
    3
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

fn default_confdir_prefix() -> String {
    "tandem-".to_string()
}

fn default_realm() -> String {
    "tandem".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new(TopologyKind::default())
    }
}

impl HarnessConfig {
    pub fn new(topology: TopologyKind) -> Self {
        Self {
            topology,
            tls: false,
            tls_options: TlsOptions::default(),
            client_certs: None,
            auth: None,
            apps: default_apps(),
            chain_length: default_chain_length(),
            drain_timeout_ms: default_drain_timeout_ms(),
            confdir_prefix: default_confdir_prefix(),
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_tls_options(mut self, options: TlsOptions) -> Self {
        self.tls_options = options;
        self
    }

    pub fn with_client_certs(mut self, dir: impl Into<PathBuf>) -> Self {
        self.client_certs = Some(dir.into());
        self
    }

    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some(BasicAuthConfig {
            username: username.to_string(),
            password: password.to_string(),
            realm: default_realm(),
        });
        self
    }

    pub fn with_apps(mut self, apps: bool) -> Self {
        self.apps = apps;
        self
    }

    pub fn with_chain_length(mut self, hops: usize) -> Self {
        self.chain_length = hops;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| HarnessError::ConfigFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_yaml_str(&contents).map_err(|e| match e {
            HarnessError::InvalidConfig(reason) => HarnessError::ConfigFile {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: HarnessConfig = serde_yaml::from_str(contents)
            .map_err(|e| HarnessError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.topology == TopologyKind::Chain && self.chain_length == 0 {
            return Err(HarnessError::InvalidConfig(
                "chain_length must be at least 1 for the chain topology".to_string(),
            ));
        }

        if let Some(ref dir) = self.client_certs {
            if !dir.is_dir() {
                return Err(HarnessError::InvalidConfig(format!(
                    "client certificate directory '{}' does not exist",
                    dir.display()
                )));
            }
        }

        if let Some(ref auth) = self.auth {
            if auth.username.is_empty() || auth.username.contains(':') {
                return Err(HarnessError::InvalidConfig(
                    "proxy auth username must be non-empty and must not contain ':'".to_string(),
                ));
            }
        }

        if self.drain_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "drain_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
