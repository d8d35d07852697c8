//! Deployment topologies and upstream resolution.
//!
//! Each topology answers "where does this connection really go?" differently:
//!
//! - `Explicit`: the client names the destination in the request.
//! - `Transparent`: the original destination is recovered out-of-band from
//!   the accepted socket.
//! - `Reverse`: every connection goes to one configured origin.
//! - `Chain`: every connection goes to the next proxy hop.
//!
//! [`UpstreamStrategy`] carries the resolution capability for each kind and
//! [`TopologyResolver`] turns a kind plus fixture addresses into a complete
//! [`ProxyConfig`](crate::config::ProxyConfig).

mod resolver;
mod transparent;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::HeaderForm;
use crate::error::HarnessError;

pub use resolver::{FixtureAddrs, TopologyResolver};
pub use transparent::{FixedOriginalAddr, OriginalAddrResolver, TransparentResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum TopologyKind {
    #[default]
    Explicit,
    Transparent,
    Reverse,
    Chain,
}

impl TopologyKind {
    pub const ALL: [TopologyKind; 4] = [
        TopologyKind::Explicit,
        TopologyKind::Transparent,
        TopologyKind::Reverse,
        TopologyKind::Chain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::Explicit => "explicit",
            TopologyKind::Transparent => "transparent",
            TopologyKind::Reverse => "reverse",
            TopologyKind::Chain => "chain",
        }
    }

    /// Inbound and outbound request-line forms for this topology.
    ///
    /// A transparent or reverse proxy never sees absolute-form requests;
    /// intermediate chain hops speak proxy-to-proxy and keep absolute form.
    pub fn default_forms(&self) -> (HeaderForm, HeaderForm) {
        match self {
            TopologyKind::Explicit => (HeaderForm::Absolute, HeaderForm::Relative),
            TopologyKind::Transparent | TopologyKind::Reverse => {
                (HeaderForm::Relative, HeaderForm::Relative)
            }
            TopologyKind::Chain => (HeaderForm::Absolute, HeaderForm::Absolute),
        }
    }

    /// Whether clients address the proxy as a proxy (absolute form or CONNECT).
    pub fn is_proxy_addressed(&self) -> bool {
        matches!(self, TopologyKind::Explicit | TopologyKind::Chain)
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "explicit" | "regular" => Ok(TopologyKind::Explicit),
            "transparent" => Ok(TopologyKind::Transparent),
            "reverse" => Ok(TopologyKind::Reverse),
            "chain" => Ok(TopologyKind::Chain),
            _ => Err(HarnessError::UnknownTopology(s.to_string())),
        }
    }
}

impl TryFrom<String> for TopologyKind {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TopologyKind> for String {
    fn from(kind: TopologyKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Metadata of one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Where a connection is forwarded and whether each side speaks TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Terminate TLS from the client.
    pub client_tls: bool,
    /// Originate TLS toward the upstream.
    pub server_tls: bool,
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(tls: bool, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_tls: tls,
            server_tls: tls,
            host: host.into(),
            port,
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn matches_addr(&self, addr: SocketAddr) -> bool {
        self.port == addr.port() && self.host == addr.ip().to_string()
    }
}

/// Fixed per-connection resolution function.
pub type ResolveFn = Arc<dyn Fn(&ConnectionInfo) -> UpstreamTarget + Send + Sync>;

/// Upstream-resolution strategy, one variant per topology.
#[derive(Clone)]
pub enum UpstreamStrategy {
    /// No override: use the destination the request names.
    Explicit,
    /// Recover the original destination from the accepted socket.
    Transparent(TransparentResolver),
    /// Always forward to one origin.
    Reverse(ResolveFn),
    /// Always forward to the next proxy hop.
    Chain(ResolveFn),
}

impl UpstreamStrategy {
    pub fn reverse<F>(resolve: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> UpstreamTarget + Send + Sync + 'static,
    {
        UpstreamStrategy::Reverse(Arc::new(resolve))
    }

    pub fn chain<F>(resolve: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> UpstreamTarget + Send + Sync + 'static,
    {
        UpstreamStrategy::Chain(Arc::new(resolve))
    }

    pub fn kind(&self) -> TopologyKind {
        match self {
            UpstreamStrategy::Explicit => TopologyKind::Explicit,
            UpstreamStrategy::Transparent(_) => TopologyKind::Transparent,
            UpstreamStrategy::Reverse(_) => TopologyKind::Reverse,
            UpstreamStrategy::Chain(_) => TopologyKind::Chain,
        }
    }

    /// Connection-level upstream, or `None` when the request decides.
    pub fn resolve(&self, conn: &ConnectionInfo) -> std::io::Result<Option<UpstreamTarget>> {
        match self {
            UpstreamStrategy::Explicit => Ok(None),
            UpstreamStrategy::Transparent(resolver) => resolver.resolve(conn).map(Some),
            UpstreamStrategy::Reverse(resolve) | UpstreamStrategy::Chain(resolve) => {
                Ok(Some(resolve(conn)))
            }
        }
    }
}

impl fmt::Debug for UpstreamStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamStrategy::Explicit => f.write_str("Explicit"),
            UpstreamStrategy::Transparent(resolver) => {
                f.debug_tuple("Transparent").field(resolver).finish()
            }
            UpstreamStrategy::Reverse(_) => f.write_str("Reverse(<fn>)"),
            UpstreamStrategy::Chain(_) => f.write_str("Chain(<fn>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            client_addr: "127.0.0.1:50000".parse().unwrap(),
            local_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }

    #[test]
    fn test_topology_kind_parse() {
        for kind in TopologyKind::ALL {
            assert_eq!(kind.as_str().parse::<TopologyKind>().unwrap(), kind);
        }
        assert_eq!(
            "Transparent".parse::<TopologyKind>().unwrap(),
            TopologyKind::Transparent
        );
    }

    #[test]
    fn test_topology_kind_unknown() {
        let err = "sideways".parse::<TopologyKind>().unwrap_err();
        assert!(matches!(err, HarnessError::UnknownTopology(ref s) if s == "sideways"));
        assert!(err.is_config());
    }

    #[test]
    fn test_topology_kind_serde() {
        let kind: TopologyKind = serde_json::from_str(r#""chain""#).unwrap();
        assert_eq!(kind, TopologyKind::Chain);
        assert_eq!(serde_json::to_string(&kind).unwrap(), r#""chain""#);
        assert!(serde_json::from_str::<TopologyKind>(r#""mesh""#).is_err());
    }

    #[test]
    fn test_default_forms() {
        assert_eq!(
            TopologyKind::Transparent.default_forms(),
            (HeaderForm::Relative, HeaderForm::Relative)
        );
        assert_eq!(
            TopologyKind::Chain.default_forms(),
            (HeaderForm::Absolute, HeaderForm::Absolute)
        );
    }

    #[test]
    fn test_explicit_strategy_does_not_resolve() {
        assert_eq!(UpstreamStrategy::Explicit.resolve(&conn()).unwrap(), None);
    }

    #[test]
    fn test_reverse_strategy_ignores_connection() {
        let strategy = UpstreamStrategy::reverse(|_| UpstreamTarget::new(true, "127.0.0.1", 9000));
        assert_eq!(strategy.kind(), TopologyKind::Reverse);
        let target = strategy.resolve(&conn()).unwrap().unwrap();
        assert_eq!(target.authority(), "127.0.0.1:9000");
        assert!(target.client_tls && target.server_tls);
    }

    #[test]
    fn test_target_matches_addr() {
        let target = UpstreamTarget::new(false, "127.0.0.1", 9000);
        assert!(target.matches_addr("127.0.0.1:9000".parse().unwrap()));
        assert!(!target.matches_addr("127.0.0.1:9001".parse().unwrap()));
    }
}
