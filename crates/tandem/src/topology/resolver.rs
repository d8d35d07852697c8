//! Topology resolver: topology kind + fixture addresses → `ProxyConfig`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{
    FixedOriginalAddr, TopologyKind, TransparentResolver, UpstreamStrategy, UpstreamTarget,
};
use crate::config::{ProxyConfig, TlsOptions};
use crate::engine::{AppRegistry, Authenticator};
use crate::error::{HarnessError, Result};

/// Addresses of the backend fixtures a topology may route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureAddrs {
    pub primary: SocketAddr,
    pub secondary: Option<SocketAddr>,
}

impl FixtureAddrs {
    pub fn new(primary: SocketAddr, secondary: Option<SocketAddr>) -> Self {
        Self { primary, secondary }
    }

    fn ports(&self) -> Vec<u16> {
        std::iter::once(self.primary.port())
            .chain(self.secondary.map(|addr| addr.port()))
            .collect()
    }
}

/// Builds complete proxy configurations for each topology.
///
/// Settings shared by every instance of a test class (confidential
/// directory, TLS, authenticator, client certificates, apps) are captured
/// once; `resolve` adds the topology-specific strategy and header forms.
#[derive(Clone)]
pub struct TopologyResolver {
    fixtures: FixtureAddrs,
    confdir: PathBuf,
    tls: Option<TlsOptions>,
    authenticator: Option<Arc<dyn Authenticator>>,
    client_certs: Option<PathBuf>,
    apps: AppRegistry,
    drain_timeout: Duration,
}

impl TopologyResolver {
    pub fn new(fixtures: FixtureAddrs, confdir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures,
            confdir: confdir.into(),
            tls: None,
            authenticator: None,
            client_certs: None,
            apps: AppRegistry::default(),
            drain_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsOptions>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_client_certs(mut self, dir: Option<PathBuf>) -> Self {
        self.client_certs = dir;
        self
    }

    pub fn with_apps(mut self, apps: AppRegistry) -> Self {
        self.apps = apps;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn fixtures(&self) -> FixtureAddrs {
        self.fixtures
    }

    /// Upstream strategy for `kind`. `next_hop` is required for `Chain`.
    pub fn strategy(
        &self,
        kind: TopologyKind,
        next_hop: Option<SocketAddr>,
    ) -> Result<UpstreamStrategy> {
        let tls = self.tls.is_some();
        let primary = self.fixtures.primary;

        let strategy = match kind {
            TopologyKind::Explicit => UpstreamStrategy::Explicit,
            TopologyKind::Transparent => {
                let tls_ports = if tls { self.fixtures.ports() } else { Vec::new() };
                UpstreamStrategy::Transparent(TransparentResolver::new(
                    Arc::new(FixedOriginalAddr::new(primary.ip().to_string(), primary.port())),
                    tls_ports,
                ))
            }
            TopologyKind::Reverse => {
                let host = primary.ip().to_string();
                let port = primary.port();
                UpstreamStrategy::reverse(move |_| UpstreamTarget::new(tls, host.clone(), port))
            }
            TopologyKind::Chain => {
                let next = next_hop.ok_or(HarnessError::MissingFixture("next hop"))?;
                let host = next.ip().to_string();
                let port = next.port();
                UpstreamStrategy::chain(move |_| UpstreamTarget::new(false, host.clone(), port))
            }
        };

        debug!("Resolved {} topology to {:?}", kind, strategy);
        Ok(strategy)
    }

    /// Complete configuration for one proxy instance of `kind`.
    ///
    /// Intermediate chain hops carry no authenticator: credentials are
    /// forwarded untouched and checked by the hop that owns them.
    pub fn resolve(&self, kind: TopologyKind, next_hop: Option<SocketAddr>) -> Result<ProxyConfig> {
        let strategy = self.strategy(kind, next_hop)?;
        let authenticator = match kind {
            TopologyKind::Chain => None,
            _ => self.authenticator.clone(),
        };

        ProxyConfig::builder(self.confdir.clone(), strategy)
            .authenticator(authenticator)
            .client_certs(self.client_certs.clone())
            .tls(self.tls.clone())
            .apps(self.apps.clone())
            .drain_timeout(self.drain_timeout)
            .build()
    }
}
