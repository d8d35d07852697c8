//! Topology-aware traffic helpers.
//!
//! A [`TopologyClient`] knows how a client reaches the backend through the
//! proxy in the current topology: absolute form through explicit proxies,
//! CONNECT plus TLS when TLS is on, and relative form straight at the proxy
//! in transparent and reverse mode.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use super::{Connection, RequestSpec, TestClient, TestResponse};
use crate::config::{APP_HOST, APP_PORT};
use crate::engine::BasicProxyAuth;
use crate::error::{HarnessError, Result};
use crate::language;
use crate::topology::TopologyKind;

#[derive(Debug, Clone)]
pub struct TopologyClient {
    kind: TopologyKind,
    tls: bool,
    entry: SocketAddr,
    backend: SocketAddr,
    apps: bool,
    proxy_authorization: Option<String>,
}

impl TopologyClient {
    pub fn new(kind: TopologyKind, tls: bool, entry: SocketAddr, backend: SocketAddr) -> Self {
        Self {
            kind,
            tls,
            entry,
            backend,
            apps: false,
            proxy_authorization: None,
        }
    }

    pub fn with_apps(mut self, apps: bool) -> Self {
        self.apps = apps;
        self
    }

    /// Send these proxy credentials on proxy-addressed requests.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.proxy_authorization = Some(BasicProxyAuth::header_value(username, password));
        self
    }

    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    pub fn entry(&self) -> SocketAddr {
        self.entry
    }

    pub fn backend(&self) -> SocketAddr {
        self.backend
    }

    fn proxy_addressed(&self) -> bool {
        self.kind.is_proxy_addressed()
    }

    fn tunnel_client(&self, authority: String, sni: Option<&str>) -> TestClient {
        let mut client = TestClient::new(self.entry).tunnel(authority);
        if let Some(ref value) = self.proxy_authorization {
            client = client.connect_header("Proxy-Authorization", value.clone());
        }
        client.tls(sni)
    }

    fn with_auth(&self, spec: RequestSpec) -> RequestSpec {
        match self.proxy_authorization {
            Some(ref value) => spec.header("Proxy-Authorization", value.clone()),
            None => spec,
        }
    }

    /// Connection to the entry hop, ready to carry requests to the backend.
    ///
    /// `sni` only goes into the TLS handshake.
    pub async fn connect(&self, sni: Option<&str>) -> Result<Connection> {
        let client = if self.proxy_addressed() && self.tls {
            self.tunnel_client(self.backend.to_string(), sni)
        } else if self.tls {
            TestClient::new(self.entry).tls(sni)
        } else {
            TestClient::new(self.entry)
        };
        client.connect().await
    }

    /// Plain TCP to the entry hop.
    pub async fn connect_raw(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.entry).await?)
    }

    /// The `GET` that asks the backend for response spec `spec`.
    pub fn pathod_request(&self, spec: &str) -> RequestSpec {
        let path = format!("/p/{}", language::encode_path(spec));
        let host = self.backend.to_string();
        if self.proxy_addressed() && !self.tls {
            let request = RequestSpec::get(format!("http://{host}{path}")).header("Host", host);
            self.with_auth(request)
        } else {
            RequestSpec::get(path).header("Host", host)
        }
    }

    pub async fn pathod(&self, spec: &str, sni: Option<&str>) -> Result<TestResponse> {
        let mut conn = self.connect(sni).await?;
        conn.request(&self.pathod_request(spec)).await
    }

    /// Fetch `page` from the onboarding app at `APP_HOST:APP_PORT`.
    pub async fn app(&self, page: &str) -> Result<TestResponse> {
        if !self.apps {
            return Err(HarnessError::AppsDisabled);
        }
        let authority = format!("{APP_HOST}:{APP_PORT}");

        let (mut conn, request) = if self.proxy_addressed() && self.tls {
            let conn = self.tunnel_client(authority.clone(), Some(APP_HOST)).connect().await?;
            (conn, RequestSpec::get(page).header("Host", authority))
        } else if self.proxy_addressed() {
            let conn = TestClient::new(self.entry).connect().await?;
            let request = RequestSpec::get(format!("http://{authority}{page}")).header("Host", authority);
            (conn, self.with_auth(request))
        } else {
            let conn = self.connect(None).await?;
            (conn, RequestSpec::get(page).header("Host", authority))
        };
        conn.request(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(kind: TopologyKind, tls: bool) -> TopologyClient {
        TopologyClient::new(
            kind,
            tls,
            "127.0.0.1:8080".parse().unwrap(),
            "127.0.0.1:9001".parse().unwrap(),
        )
    }

    #[test]
    fn test_pathod_absolute_for_plain_proxy_addressed() {
        for kind in [TopologyKind::Explicit, TopologyKind::Chain] {
            let request = client(kind, false).pathod_request("200");
            assert_eq!(request.target, "http://127.0.0.1:9001/p/200");
        }
    }

    #[test]
    fn test_pathod_relative_otherwise() {
        for (kind, tls) in [
            (TopologyKind::Explicit, true),
            (TopologyKind::Chain, true),
            (TopologyKind::Transparent, false),
            (TopologyKind::Transparent, true),
            (TopologyKind::Reverse, false),
            (TopologyKind::Reverse, true),
        ] {
            let request = client(kind, tls).pathod_request("200");
            assert_eq!(request.target, "/p/200", "{kind} tls={tls}");
            assert!(request.has_header("host"));
        }
    }

    #[test]
    fn test_credentials_only_on_absolute_requests() {
        let explicit = client(TopologyKind::Explicit, false).with_credentials("alice", "secret");
        assert!(explicit.pathod_request("200").has_header("proxy-authorization"));

        let tls = client(TopologyKind::Explicit, true).with_credentials("alice", "secret");
        assert!(!tls.pathod_request("200").has_header("proxy-authorization"));
    }

    #[tokio::test]
    async fn test_app_requires_apps() {
        let err = client(TopologyKind::Explicit, false).app("/").await.unwrap_err();
        assert!(matches!(err, HarnessError::AppsDisabled));
    }
}
