//! Per-instance proxy configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{AppRegistry, Authenticator};
use crate::error::{HarnessError, Result};
use crate::topology::{TopologyKind, UpstreamStrategy};

/// Request-line form: `GET /path` versus `GET http://host:port/path`.
///
/// Fixed by the topology kind; see [`TopologyKind::default_forms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    Relative,
    Absolute,
}

impl HeaderForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderForm::Relative => "relative",
            HeaderForm::Absolute => "absolute",
        }
    }
}

/// TLS handshake parameters shared by the proxy and the backend fixtures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsOptions {
    /// Extra subject alternative names for generated certificates.
    #[serde(default)]
    pub cert_names: Vec<String>,
}

/// Immutable configuration of one proxy instance.
///
/// Built once through [`ProxyConfigBuilder`] and never mutated after the
/// proxy starts; the engine holds it behind an `Arc`.
#[derive(Clone)]
pub struct ProxyConfig {
    confdir: PathBuf,
    authenticator: Option<Arc<dyn Authenticator>>,
    client_certs: Option<PathBuf>,
    strategy: UpstreamStrategy,
    form_in: HeaderForm,
    form_out: HeaderForm,
    tls: Option<TlsOptions>,
    apps: AppRegistry,
    drain_timeout: Duration,
}

impl ProxyConfig {
    pub fn builder(confdir: impl Into<PathBuf>, strategy: UpstreamStrategy) -> ProxyConfigBuilder {
        ProxyConfigBuilder::new(confdir.into(), strategy)
    }

    pub fn confdir(&self) -> &Path {
        &self.confdir
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    pub fn client_certs(&self) -> Option<&Path> {
        self.client_certs.as_deref()
    }

    pub fn strategy(&self) -> &UpstreamStrategy {
        &self.strategy
    }

    pub fn kind(&self) -> TopologyKind {
        self.strategy.kind()
    }

    pub fn form_in(&self) -> HeaderForm {
        self.form_in
    }

    pub fn form_out(&self) -> HeaderForm {
        self.form_out
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("confdir", &self.confdir)
            .field("authenticator", &self.authenticator.is_some())
            .field("client_certs", &self.client_certs)
            .field("strategy", &self.strategy)
            .field("form_in", &self.form_in)
            .field("form_out", &self.form_out)
            .field("tls", &self.tls)
            .field("apps", &self.apps)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

pub struct ProxyConfigBuilder {
    confdir: PathBuf,
    authenticator: Option<Arc<dyn Authenticator>>,
    client_certs: Option<PathBuf>,
    strategy: UpstreamStrategy,
    form_in: HeaderForm,
    form_out: HeaderForm,
    tls: Option<TlsOptions>,
    apps: AppRegistry,
    drain_timeout: Duration,
}

impl ProxyConfigBuilder {
    fn new(confdir: PathBuf, strategy: UpstreamStrategy) -> Self {
        let (form_in, form_out) = strategy.kind().default_forms();
        Self {
            confdir,
            authenticator: None,
            client_certs: None,
            strategy,
            form_in,
            form_out,
            tls: None,
            apps: AppRegistry::default(),
            drain_timeout: Duration::from_secs(2),
        }
    }

    pub fn authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn client_certs(mut self, dir: Option<PathBuf>) -> Self {
        self.client_certs = dir;
        self
    }

    pub fn tls(mut self, tls: Option<TlsOptions>) -> Self {
        self.tls = tls;
        self
    }

    pub fn apps(mut self, apps: AppRegistry) -> Self {
        self.apps = apps;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ProxyConfig> {
        if !self.confdir.is_dir() {
            return Err(HarnessError::InvalidConfig(format!(
                "confidential directory '{}' does not exist",
                self.confdir.display()
            )));
        }
        if let Some(ref dir) = self.client_certs {
            if !dir.is_dir() {
                return Err(HarnessError::InvalidConfig(format!(
                    "client certificate directory '{}' does not exist",
                    dir.display()
                )));
            }
        }
        if self.drain_timeout.is_zero() {
            return Err(HarnessError::InvalidConfig(
                "drain timeout must be greater than zero".to_string(),
            ));
        }

        Ok(ProxyConfig {
            confdir: self.confdir,
            authenticator: self.authenticator,
            client_certs: self.client_certs,
            strategy: self.strategy,
            form_in: self.form_in,
            form_out: self.form_out,
            tls: self.tls,
            apps: self.apps,
            drain_timeout: self.drain_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_follow_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::builder(dir.path(), UpstreamStrategy::Explicit)
            .build()
            .unwrap();
        assert_eq!(config.kind(), TopologyKind::Explicit);
        assert_eq!(config.form_in(), HeaderForm::Absolute);
        assert_eq!(config.form_out(), HeaderForm::Relative);
        assert!(!config.tls_enabled());
        assert!(config.authenticator().is_none());
    }

    #[test]
    fn test_builder_rejects_missing_confdir() {
        let err = ProxyConfig::builder("/definitely/not/here", UpstreamStrategy::Explicit)
            .build()
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_builder_rejects_zero_drain_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProxyConfig::builder(dir.path(), UpstreamStrategy::Explicit)
            .drain_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.is_config());
    }
}
