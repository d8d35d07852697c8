//! Transparent-mode destination recovery.

use std::fmt;
use std::io;
use std::sync::Arc;

use super::{ConnectionInfo, UpstreamTarget};

/// Recovers the destination a client originally dialled before it was
/// redirected to the proxy.
pub trait OriginalAddrResolver: Send + Sync {
    fn original_addr(&self, conn: &ConnectionInfo) -> io::Result<(String, u16)>;
}

/// Resolver that reports the same destination for every socket.
#[derive(Debug, Clone)]
pub struct FixedOriginalAddr {
    host: String,
    port: u16,
}

impl FixedOriginalAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl OriginalAddrResolver for FixedOriginalAddr {
    fn original_addr(&self, _conn: &ConnectionInfo) -> io::Result<(String, u16)> {
        Ok((self.host.clone(), self.port))
    }
}

/// Transparent upstream resolution: original address plus the set of ports
/// spoken to over TLS.
#[derive(Clone)]
pub struct TransparentResolver {
    resolver: Arc<dyn OriginalAddrResolver>,
    tls_ports: Vec<u16>,
}

impl TransparentResolver {
    pub fn new(resolver: Arc<dyn OriginalAddrResolver>, tls_ports: Vec<u16>) -> Self {
        Self {
            resolver,
            tls_ports,
        }
    }

    pub fn tls_ports(&self) -> &[u16] {
        &self.tls_ports
    }

    /// TLS is used on both sides iff the recovered port is in the TLS set.
    pub fn resolve(&self, conn: &ConnectionInfo) -> io::Result<UpstreamTarget> {
        let (host, port) = self.resolver.original_addr(conn)?;
        let tls = self.tls_ports.contains(&port);
        Ok(UpstreamTarget::new(tls, host, port))
    }
}

impl fmt::Debug for TransparentResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransparentResolver")
            .field("tls_ports", &self.tls_ports)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(local_port: u16) -> ConnectionInfo {
        ConnectionInfo {
            client_addr: "127.0.0.1:50000".parse().unwrap(),
            local_addr: format!("127.0.0.1:{local_port}").parse().unwrap(),
        }
    }

    #[test]
    fn test_fixed_resolver_ignores_socket() {
        let resolver = FixedOriginalAddr::localhost(9000);
        assert_eq!(
            resolver.original_addr(&conn(1)).unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            resolver.original_addr(&conn(2)).unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
    }

    #[test]
    fn test_plain_without_tls_ports() {
        let resolver = TransparentResolver::new(Arc::new(FixedOriginalAddr::localhost(9000)), vec![]);
        let target = resolver.resolve(&conn(1)).unwrap();
        assert!(!target.client_tls);
        assert!(!target.server_tls);
        assert_eq!(target.port, 9000);
    }

    #[test]
    fn test_tls_when_port_in_set() {
        let resolver =
            TransparentResolver::new(Arc::new(FixedOriginalAddr::localhost(9000)), vec![9000, 9001]);
        let target = resolver.resolve(&conn(1)).unwrap();
        assert!(target.client_tls);
        assert!(target.server_tls);
    }

    #[test]
    fn test_plain_when_port_outside_set() {
        let resolver =
            TransparentResolver::new(Arc::new(FixedOriginalAddr::localhost(7000)), vec![9000, 9001]);
        let target = resolver.resolve(&conn(1)).unwrap();
        assert!(!target.client_tls);
    }

    struct FailingResolver;

    impl OriginalAddrResolver for FailingResolver {
        fn original_addr(&self, _conn: &ConnectionInfo) -> io::Result<(String, u16)> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no original destination"))
        }
    }

    #[test]
    fn test_resolver_errors_propagate() {
        let resolver = TransparentResolver::new(Arc::new(FailingResolver), vec![]);
        assert!(resolver.resolve(&conn(1)).is_err());
    }
}
