//! Backend fixture request handling.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::spec::ResponseSpec;
use super::{RecordedRequest, RequestLog};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Facts about the connection a request arrived on.
#[derive(Debug, Clone)]
struct ConnMeta {
    peer: SocketAddr,
    tls: bool,
    sni: Option<String>,
    client_cert: bool,
}

pub(super) async fn run(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    log: RequestLog,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Fixture accept failed: {}", err);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let log = log.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let (_, conn) = tls_stream.get_ref();
                                let meta = ConnMeta {
                                    peer,
                                    tls: true,
                                    sni: conn.server_name().map(str::to_string),
                                    client_cert: conn.peer_certificates().is_some_and(|c| !c.is_empty()),
                                };
                                serve(tls_stream, meta, log, cancel).await;
                            }
                            Err(err) => error!("Fixture TLS handshake failed from {}: {}", peer, err),
                        },
                        None => {
                            let meta = ConnMeta {
                                peer,
                                tls: false,
                                sni: None,
                                client_cert: false,
                            };
                            serve(stream, meta, log, cancel).await;
                        }
                    }
                });
            }
        }
    }

    drop(listener);
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!("Fixture connections still open after {:?}", DRAIN_TIMEOUT);
    }
    Ok(())
}

async fn serve<I>(io: I, meta: ConnMeta, log: RequestLog, cancel: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = meta.peer;
    let service = service_fn(move |req| handle(req, meta.clone(), log.clone()));
    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!("Fixture connection from {} ended: {}", peer, err);
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    meta: ConnMeta,
    log: RequestLog,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().clone();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            debug!("Failed to read fixture request body: {}", err);
            Bytes::new()
        }
    };

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    log.push(RecordedRequest {
        request_from: meta.peer,
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
        tls: meta.tls,
        sni: meta.sni,
        client_cert: meta.client_cert,
        timestamp: chrono::Utc::now().to_rfc3339(),
    });

    Ok(respond(uri.path()))
}

/// Answer `/p/<spec>`; anything else is a 404.
fn respond(path: &str) -> Response<Full<Bytes>> {
    let Some(raw) = path.strip_prefix("/p/") else {
        return text(StatusCode::NOT_FOUND, "Not found");
    };
    let decoded = match urlencoding::decode(raw) {
        Ok(decoded) => decoded,
        Err(_) => return text(StatusCode::BAD_REQUEST, "Response spec is not valid UTF-8"),
    };
    let spec: ResponseSpec = match decoded.parse() {
        Ok(spec) => spec,
        Err(err) => return text(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let mut response = Response::new(Full::new(spec.body.clone()));
    *response.status_mut() = StatusCode::from_u16(spec.status).unwrap_or(StatusCode::OK);
    for (name, value) in &spec.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!("Skipping invalid header in response spec: {}", name),
        }
    }
    response
}

fn text(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{message}\n"))));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respond_with_spec() {
        let response = respond("/p/201:b'made':h'X-Fixture'='1'");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-fixture").unwrap(), "1");
    }

    #[test]
    fn test_respond_percent_encoded_spec() {
        let response = respond("/p/200:b'a%20b'");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_respond_not_found_and_invalid() {
        assert_eq!(respond("/").status(), StatusCode::NOT_FOUND);
        assert_eq!(respond("/other").status(), StatusCode::NOT_FOUND);
        assert_eq!(respond("/p/abc").status(), StatusCode::BAD_REQUEST);
    }
}
