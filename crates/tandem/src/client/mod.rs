//! Raw protocol client used by tests.
//!
//! Unlike a general-purpose HTTP client, [`Connection::request`] writes the
//! request target exactly as given, so tests control whether a proxy sees
//! absolute or relative form.

pub mod helpers;
mod request;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::engine::io::{connect_tunnel, BoxedIo};
use crate::engine::tls;
use crate::error::{HarnessError, Result};

pub use helpers::TopologyClient;
pub use request::RequestSpec;

/// How to reach the server: optional CONNECT, optional TLS.
#[derive(Debug, Clone)]
pub struct TestClient {
    addr: SocketAddr,
    tunnel: Option<String>,
    connect_headers: Vec<(String, String)>,
    tls: bool,
    sni: Option<String>,
    client_cert: Option<PathBuf>,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            tunnel: None,
            connect_headers: Vec::new(),
            tls: false,
            sni: None,
            client_cert: None,
        }
    }

    /// Issue `CONNECT authority` right after connecting.
    pub fn tunnel(mut self, authority: impl Into<String>) -> Self {
        self.tunnel = Some(authority.into());
        self
    }

    /// Header sent with the CONNECT request.
    pub fn connect_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.connect_headers.push((name.to_string(), value.into()));
        self
    }

    /// Speak TLS, sending `sni` in the handshake (none when `None`).
    pub fn tls(mut self, sni: Option<&str>) -> Self {
        self.tls = true;
        self.sni = sni.map(str::to_string);
        self
    }

    /// Present the certificate and key in `path` during the TLS handshake.
    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(path.into());
        self
    }

    pub async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(self.addr).await?;
        let _ = stream.set_nodelay(true);
        let mut io: BoxedIo = Box::new(stream);

        if let Some(ref authority) = self.tunnel {
            io = connect_tunnel(io, authority, &self.connect_headers)
                .await
                .map_err(|e| HarnessError::Protocol(format!("{e} (via {})", self.addr)))?;
        }

        if self.tls {
            let config = tls::client_config(self.client_cert.as_deref())
                .map_err(|e| HarnessError::tls(format!("{e:#}")))?;
            let name = match self.sni {
                Some(ref sni) => tls::server_name(sni),
                None => tls::server_name(&self.addr.ip().to_string()),
            }
            .map_err(|e| HarnessError::tls(format!("{e:#}")))?;
            let stream = TlsConnector::from(Arc::new(config))
                .connect(name, io)
                .await
                .map_err(HarnessError::tls)?;
            io = Box::new(stream);
        }

        let (sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(io)).await?;
        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Client connection to {} closed: {}", addr, err);
            }
        });

        Ok(Connection {
            sender,
            addr: self.addr,
            tls: self.tls,
        })
    }
}

/// An established HTTP/1.1 connection.
pub struct Connection {
    sender: SendRequest<Full<Bytes>>,
    addr: SocketAddr,
    tls: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Connection {
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    /// Send `spec` and read the whole response.
    ///
    /// A `Host` header is added when the spec has none: the authority of an
    /// absolute target, otherwise the connected address.
    pub async fn request(&mut self, spec: &RequestSpec) -> Result<TestResponse> {
        let method = Method::from_bytes(spec.method.as_bytes()).map_err(HarnessError::protocol)?;
        let uri: Uri = spec.target.parse().map_err(HarnessError::protocol)?;

        let mut req = Request::new(Full::new(Bytes::from(spec.body.clone())));
        *req.method_mut() = method;
        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(HarnessError::protocol)?;
            let value = HeaderValue::from_str(value).map_err(HarnessError::protocol)?;
            req.headers_mut().append(name, value);
        }
        if !spec.has_header("host") {
            let host = match uri.authority() {
                Some(authority) => authority.to_string(),
                None => self.addr.to_string(),
            };
            let value = HeaderValue::from_str(&host).map_err(HarnessError::protocol)?;
            req.headers_mut().insert(HOST, value);
        }
        *req.uri_mut() = uri;

        self.sender.ready().await?;
        let response = self.sender.send_request(req).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await?.to_bytes();
        Ok(TestResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{BackendFixture, FixtureOptions};

    #[tokio::test]
    async fn test_direct_request_to_fixture() {
        let fixture = BackendFixture::start(FixtureOptions::plain()).unwrap();
        let mut conn = TestClient::new(fixture.addr()).connect().await.unwrap();
        let response = conn
            .request(&RequestSpec::get("/p/200:b'direct'"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "direct");

        let recorded = fixture.last_request().unwrap();
        assert_eq!(recorded.header("host"), Some(fixture.addr().to_string().as_str()));
    }

    #[tokio::test]
    async fn test_tls_request_records_sni() {
        let fixture = BackendFixture::start(FixtureOptions::tls()).unwrap();
        let mut conn = TestClient::new(fixture.addr())
            .tls(Some("example.test"))
            .connect()
            .await
            .unwrap();
        assert!(conn.is_tls());
        let response = conn.request(&RequestSpec::get("/p/204")).await.unwrap();
        assert_eq!(response.status, 204);

        let recorded = fixture.last_request().unwrap();
        assert!(recorded.tls);
        assert_eq!(recorded.sni.as_deref(), Some("example.test"));
        assert!(!recorded.client_cert);
    }

    #[tokio::test]
    async fn test_failed_tunnel_is_reported() {
        // A plain backend answers CONNECT with 404.
        let fixture = BackendFixture::start(FixtureOptions::plain()).unwrap();
        let err = TestClient::new(fixture.addr())
            .tunnel("127.0.0.1:9")
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(ref msg) if msg.contains("404")), "{err}");
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let fixture = BackendFixture::start(FixtureOptions::plain()).unwrap();
        let mut conn = TestClient::new(fixture.addr()).connect().await.unwrap();
        for _ in 0..3 {
            let response = conn.request(&RequestSpec::get("/p/200")).await.unwrap();
            assert_eq!(response.status, 200);
        }
        assert_eq!(fixture.log().len(), 3);
    }
}
