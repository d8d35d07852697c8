//! Upstream routing and request forwarding.
//!
//! Each forwarded request opens its own upstream connection. Intercepted
//! traffic is low volume and a fresh connection keeps every exchange
//! visible to the backend fixture as a separate request.

use anyhow::Context;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use super::headers::strip_hop_headers;
use super::io::{connect_tunnel, BoxedIo};
use super::server::{ConnContext, Shared};
use super::tls;
use crate::config::{HeaderForm, ProxyConfig};
use crate::topology::UpstreamStrategy;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Where a request is going as far as the client is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Destination {
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn absolute_uri(&self, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }
}

/// How the proxy reaches the upstream for one request.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub connect_host: String,
    pub connect_port: u16,
    /// CONNECT this authority through the upstream proxy first.
    pub tunnel: Option<String>,
    pub tunnel_headers: Vec<(String, String)>,
    /// Server name for the upstream TLS handshake; `None` means plaintext.
    pub tls: Option<String>,
    /// Host whose client certificate (if any) is presented.
    pub cert_host: String,
    pub host_header: String,
    pub uri: Uri,
}

impl Route {
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.connect_host, self.connect_port)
    }
}

/// Work out the upstream connection for a request to `dest`.
pub(crate) fn route(
    config: &ProxyConfig,
    ctx: &ConnContext,
    dest: &Destination,
    uri: &Uri,
) -> anyhow::Result<Route> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let relative: Uri = path.parse().context("Invalid request path")?;
    let outbound: Uri = match config.form_out() {
        HeaderForm::Relative => relative.clone(),
        HeaderForm::Absolute => dest
            .absolute_uri(path)
            .parse()
            .context("Invalid absolute request target")?,
    };
    let sni = |fallback: &str| ctx.sni.clone().unwrap_or_else(|| fallback.to_string());

    let route = match config.strategy() {
        UpstreamStrategy::Explicit => Route {
            connect_host: dest.host.clone(),
            connect_port: dest.port,
            tunnel: None,
            tunnel_headers: Vec::new(),
            tls: dest.is_tls().then(|| sni(&dest.host)),
            cert_host: dest.host.clone(),
            host_header: dest.authority(),
            uri: outbound,
        },
        UpstreamStrategy::Transparent(_) | UpstreamStrategy::Reverse(_) => {
            let target = ctx
                .resolved
                .as_ref()
                .context("No upstream resolved for this connection")?;
            Route {
                connect_host: target.host.clone(),
                connect_port: target.port,
                tunnel: None,
                tunnel_headers: Vec::new(),
                tls: target.server_tls.then(|| sni(&target.host)),
                cert_host: target.host.clone(),
                host_header: dest.authority(),
                uri: outbound,
            }
        }
        UpstreamStrategy::Chain(_) => {
            let next = ctx
                .resolved
                .as_ref()
                .context("No next hop resolved for this connection")?;
            if dest.is_tls() {
                // Re-establish the tunnel on the next hop and speak TLS
                // through it; inside a tunnel the request is relative.
                Route {
                    connect_host: next.host.clone(),
                    connect_port: next.port,
                    tunnel: Some(dest.authority()),
                    tunnel_headers: ctx.connect_headers.clone(),
                    tls: Some(sni(&dest.host)),
                    cert_host: dest.host.clone(),
                    host_header: dest.authority(),
                    uri: relative,
                }
            } else {
                Route {
                    connect_host: next.host.clone(),
                    connect_port: next.port,
                    tunnel: None,
                    tunnel_headers: Vec::new(),
                    tls: None,
                    cert_host: next.host.clone(),
                    host_header: dest.authority(),
                    uri: outbound,
                }
            }
        }
    };
    Ok(route)
}

/// Forward `req` along `route` and return the upstream response.
pub(crate) async fn send(
    shared: &Shared,
    route: &Route,
    req: Request<Incoming>,
) -> anyhow::Result<Response<Incoming>> {
    let upstream = route.upstream();
    let stream = TcpStream::connect((route.connect_host.as_str(), route.connect_port))
        .await
        .with_context(|| format!("Failed to connect to {upstream}"))?;
    let _ = stream.set_nodelay(true);
    let mut io: BoxedIo = Box::new(stream);

    if let Some(ref authority) = route.tunnel {
        io = connect_tunnel(io, authority, &route.tunnel_headers)
            .await
            .with_context(|| format!("Upstream proxy {upstream} did not open a tunnel"))?;
    }

    if let Some(ref name) = route.tls {
        let connector = shared.upstream_tls.connector(&route.cert_host)?;
        let server_name = tls::server_name(name)?;
        let stream = connector
            .connect(server_name, io)
            .await
            .with_context(|| format!("TLS handshake with {upstream} failed"))?;
        io = Box::new(stream);
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Incoming>(TokioIo::new(io))
        .await
        .with_context(|| format!("HTTP handshake with {upstream} failed"))?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Upstream connection closed with error: {}", err);
        }
    });

    let (mut parts, body) = req.into_parts();
    parts.uri = route.uri.clone();
    strip_hop_headers(&mut parts.headers);
    if !parts.headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&route.host_header) {
            parts.headers.insert(HOST, value);
        }
    }

    debug!("Forwarding {} {} via {}", parts.method, parts.uri, upstream);
    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .with_context(|| format!("Upstream {upstream} failed to respond"))?;
    Ok(response)
}
