//! Per-request processing.
//!
//! Every non-CONNECT request produces exactly one flow and exactly one log
//! entry, whether it is forwarded, served by an app, rejected, killed or
//! fails upstream. CONNECT requests only set up tunnels and are traced.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST, PROXY_AUTHORIZATION};
use hyper::http::request::Parts;
use hyper::http::uri::Authority;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use super::apps::{App, AppRequest};
use super::flow::{Flow, Reply};
use super::forwarding::{self, empty, full, Destination, ProxyBody};
use super::headers::{HeadersExt, VALUE_TRUE, X_TANDEM_APP, X_TANDEM_ERROR};
use super::server::{serve_tunnel, ConnContext, Shared, TunnelTarget};
use crate::config::HeaderForm;

const KILLED: &str = "Flow killed by interception handler";

/// A request the proxy answers itself with an error status.
#[derive(Debug)]
pub(crate) struct Rejection {
    status: StatusCode,
    message: String,
    headers: HeaderMap,
}

impl Rejection {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    fn auth_required(challenge: HeaderMap) -> Self {
        Self {
            status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            message: "Proxy Authentication Required".to_string(),
            headers: challenge,
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(full(format!("{}\n", self.message)));
        *response.status_mut() = self.status;
        response.headers_mut().extend(self.headers);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response.set_header(&X_TANDEM_ERROR, &VALUE_TRUE);
        response
    }
}

pub(crate) async fn handle_request(
    shared: Arc<Shared>,
    ctx: ConnContext,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(shared, ctx, req));
    }

    let mut flow = Flow::new(
        shared.next_flow_id(),
        ctx.client_addr,
        req.method().as_str(),
        path_of(req.uri()),
        ctx.sni.clone(),
    );

    let response = match process(&shared, &ctx, req, &mut flow).await {
        Ok(response) => {
            flow.status = Some(response.status().as_u16());
            response
        }
        Err(rejection) => {
            flow.fail(rejection.status.as_u16(), rejection.message.clone());
            rejection.into_response()
        }
    };

    let response = match shared.handler.response(&flow) {
        Reply::Continue => response,
        Reply::Kill => {
            flow.fail(StatusCode::BAD_GATEWAY.as_u16(), KILLED);
            Rejection::new(StatusCode::BAD_GATEWAY, KILLED).into_response()
        }
    };

    shared.emit(&flow);
    Ok(response)
}

async fn process(
    shared: &Shared,
    ctx: &ConnContext,
    req: Request<Incoming>,
    flow: &mut Flow,
) -> Result<Response<ProxyBody>, Rejection> {
    let config = &shared.config;
    let dest = destination(ctx, &req)?;
    flow.scheme = dest.scheme.to_string();
    flow.host = dest.host.clone();
    flow.port = dest.port;

    if ctx.tunnel.is_none() {
        let form = if req.uri().scheme().is_some() {
            HeaderForm::Absolute
        } else {
            HeaderForm::Relative
        };
        if form != config.form_in() {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                format!(
                    "Invalid request form: expected {} form, got {} form",
                    config.form_in().as_str(),
                    form.as_str()
                ),
            ));
        }
    }

    let (mut parts, body) = req.into_parts();
    if let Some(auth) = config.authenticator() {
        // Tunneled requests were authenticated by their CONNECT.
        if config.kind().is_proxy_addressed() && ctx.tunnel.is_none() {
            if !auth.authenticate(&parts.headers) {
                return Err(Rejection::auth_required(auth.challenge_headers()));
            }
            auth.clean(&mut parts.headers);
        }
    }

    if shared.handler.request(flow) == Reply::Kill {
        return Err(Rejection::new(StatusCode::BAD_GATEWAY, KILLED));
    }

    if let Some(app) = config.apps().find(&dest.host, dest.port) {
        flow.app = Some(app.name().to_string());
        return serve_app(app.as_ref(), &parts);
    }

    let route = forwarding::route(config, ctx, &dest, &parts.uri)
        .map_err(|e| Rejection::new(StatusCode::BAD_GATEWAY, format!("Upstream error: {e:#}")))?;
    flow.upstream = Some(route.upstream());

    match forwarding::send(shared, &route, Request::from_parts(parts, body)).await {
        Ok(response) => Ok(response.map(|body| body.boxed())),
        Err(e) => Err(Rejection::new(
            StatusCode::BAD_GATEWAY,
            format!("Upstream error: {e:#}"),
        )),
    }
}

/// Destination named by the client: tunnel authority, absolute target,
/// Host header, then the connection-level resolution.
fn destination(ctx: &ConnContext, req: &Request<Incoming>) -> Result<Destination, Rejection> {
    let scheme = if ctx.client_tls { "https" } else { "http" };
    let default_port = if ctx.client_tls { 443 } else { 80 };

    if let Some(ref tunnel) = ctx.tunnel {
        return Ok(Destination {
            scheme,
            host: tunnel.host.clone(),
            port: tunnel.port,
        });
    }

    if let Some(authority) = req.uri().authority() {
        let https = req.uri().scheme_str() == Some("https");
        return Ok(Destination {
            scheme: if https { "https" } else { "http" },
            host: authority.host().to_string(),
            port: authority
                .port_u16()
                .unwrap_or(if https { 443 } else { 80 }),
        });
    }

    if let Some(host) = req.headers().get(HOST) {
        let authority = host
            .to_str()
            .ok()
            .and_then(|h| h.parse::<Authority>().ok())
            .ok_or_else(|| {
                Rejection::new(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid Host header: {host:?}"),
                )
            })?;
        return Ok(Destination {
            scheme,
            host: authority.host().to_string(),
            port: authority.port_u16().unwrap_or(default_port),
        });
    }

    match ctx.resolved {
        Some(ref target) => Ok(Destination {
            scheme,
            host: target.host.clone(),
            port: target.port,
        }),
        None => Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "Request names no destination",
        )),
    }
}

fn serve_app(app: &dyn App, parts: &Parts) -> Result<Response<ProxyBody>, Rejection> {
    let request = AppRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        headers: parts.headers.clone(),
    };
    match app.call(&request) {
        Ok(resp) => {
            let mut response = Response::new(full(resp.body));
            *response.status_mut() = resp.status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(resp.content_type));
            response.set_header_value(&X_TANDEM_APP, app.name());
            Ok(response)
        }
        Err(e) => Err(Rejection::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error in application {}: {}", app.name(), e),
        )),
    }
}

/// Answer a CONNECT with 200 and serve the tunnel once upgraded.
fn handle_connect(shared: Arc<Shared>, ctx: ConnContext, req: Request<Incoming>) -> Response<ProxyBody> {
    let kind = shared.config.kind();
    if !kind.is_proxy_addressed() || ctx.tunnel.is_some() {
        warn!("Rejected CONNECT from {} in {} mode", ctx.client_addr, kind);
        return Rejection::new(
            StatusCode::BAD_REQUEST,
            format!("CONNECT is not supported in {kind} mode"),
        )
        .into_response();
    }

    let Some(authority) = req.uri().authority().cloned() else {
        return Rejection::new(StatusCode::BAD_REQUEST, "CONNECT without authority").into_response();
    };

    let mut connect_headers = Vec::new();
    match shared.config.authenticator() {
        Some(auth) => {
            if !auth.authenticate(req.headers()) {
                info!(
                    "Rejected CONNECT {} from {}: proxy authentication required",
                    authority, ctx.client_addr
                );
                return Rejection::auth_required(auth.challenge_headers()).into_response();
            }
        }
        None => {
            // Unauthenticated hops pass credentials on to the next CONNECT.
            if let Some(value) = req.headers().get(PROXY_AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                connect_headers.push((PROXY_AUTHORIZATION.to_string(), value.to_string()));
            }
        }
    }

    debug!("CONNECT {} from {}", authority, ctx.client_addr);
    let mut inner = ctx;
    inner.tunnel = Some(TunnelTarget {
        host: authority.host().to_string(),
        port: authority.port_u16().unwrap_or(443),
    });
    inner.connect_headers = connect_headers;

    let task_shared = Arc::clone(&shared);
    shared.tracker.spawn(async move {
        let client_addr = inner.client_addr;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => serve_tunnel(task_shared, inner, TokioIo::new(upgraded)).await,
            Err(err) => debug!("CONNECT upgrade failed for {}: {}", client_addr, err),
        }
    });

    Response::new(empty())
}

fn path_of(uri: &hyper::Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}
