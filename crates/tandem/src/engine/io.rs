//! Boxed byte streams and CONNECT tunnels over them.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Any bidirectional byte stream the harness layers protocols on.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("CONNECT {authority} refused with status {status}")]
    Refused {
        authority: String,
        status: StatusCode,
    },
    #[error("Invalid CONNECT request for {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Http(#[from] hyper::Error),
}

impl TunnelError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TunnelError::Refused { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Send `CONNECT authority` over `io` and return the upgraded tunnel.
pub async fn connect_tunnel(
    io: BoxedIo,
    authority: &str,
    extra_headers: &[(String, String)],
) -> Result<BoxedIo, TunnelError> {
    let invalid = || TunnelError::InvalidRequest(authority.to_string());

    let mut req = Request::new(Empty::<Bytes>::new());
    *req.method_mut() = Method::CONNECT;
    *req.uri_mut() = authority.parse().map_err(|_| invalid())?;
    let host = HeaderValue::from_str(authority).map_err(|_| invalid())?;
    req.headers_mut().insert(HOST, host);
    for (name, value) in extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        req.headers_mut().append(name, value);
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!("CONNECT connection closed with error: {}", err);
        }
    });

    let response = sender.send_request(req).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TunnelError::Refused {
            authority: authority.to_string(),
            status,
        });
    }
    let upgraded = hyper::upgrade::on(response).await?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::PROXY_AUTHORIZATION;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Response;
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Serve one connection that accepts CONNECT when `authorization`
    /// matches and writes `greeting` into the tunnel.
    fn serve(server: DuplexStream, authorization: &'static str, greeting: &'static [u8]) {
        let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
            assert_eq!(req.method(), Method::CONNECT);
            let authorized = req
                .headers()
                .get(PROXY_AUTHORIZATION)
                .is_some_and(|v| v == authorization);
            if !authorized {
                let mut response = Response::new(Empty::<Bytes>::new());
                *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
                return Ok::<_, Infallible>(response);
            }
            tokio::spawn(async move {
                let upgraded = hyper::upgrade::on(req).await.unwrap();
                let mut io = TokioIo::new(upgraded);
                io.write_all(greeting).await.unwrap();
                io.flush().await.unwrap();
            });
            Ok(Response::new(Empty::<Bytes>::new()))
        });
        tokio::spawn(async move {
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(server), service)
                .with_upgrades()
                .await;
        });
    }

    #[tokio::test]
    async fn test_connect_tunnel_upgrades() {
        let (client, server) = tokio::io::duplex(1024);
        serve(server, "Basic abc", b"tunnel-bytes");

        let headers = vec![("Proxy-Authorization".to_string(), "Basic abc".to_string())];
        let mut tunnel = connect_tunnel(Box::new(client), "127.0.0.1:9000", &headers)
            .await
            .unwrap();

        let mut rest = [0u8; 12];
        tunnel.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"tunnel-bytes");
    }

    #[tokio::test]
    async fn test_connect_tunnel_refused() {
        let (client, server) = tokio::io::duplex(1024);
        serve(server, "Basic abc", b"");

        let err = connect_tunnel(Box::new(client), "127.0.0.1:9000", &[])
            .await
            .err().unwrap();
        assert_eq!(err.status(), Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED));
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn test_connect_tunnel_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        assert!(connect_tunnel(Box::new(client), "127.0.0.1:1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_authority() {
        let (client, _server) = tokio::io::duplex(64);
        let err = connect_tunnel(Box::new(client), "bad authority", &[])
            .await
            .err().unwrap();
        assert!(matches!(err, TunnelError::InvalidRequest(_)));
    }
}
