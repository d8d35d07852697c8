//! ProxyServer struct and main run loop.
//!
//! The server accepts connections until its cancellation token fires, then
//! stops accepting, asks every open connection to finish its in-flight
//! exchange and waits (bounded by the drain timeout) for them to close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::flow::{Flow, InterceptHandler, LogEntry, LogLevel};
use super::handler::handle_request;
use super::tls::{create_tls_acceptor, ensure_cert_material, UpstreamTls};
use crate::config::ProxyConfig;
use crate::topology::{ConnectionInfo, UpstreamTarget};

/// State shared by every connection of one proxy instance.
pub(crate) struct Shared {
    pub config: ProxyConfig,
    pub handler: Arc<dyn InterceptHandler>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub upstream_tls: UpstreamTls,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    next_flow_id: AtomicU64,
}

impl Shared {
    pub fn next_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Emit the single log entry for a finished flow.
    pub fn emit(&self, flow: &Flow) {
        let entry = LogEntry::for_flow(flow);
        match entry.level {
            LogLevel::Info => debug!("{}", entry.message),
            LogLevel::Error => warn!("{}", entry.message),
        }
        let _ = self.handler.log(&entry);
    }
}

/// CONNECT target a tunneled connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

/// Per-connection facts every request on that connection inherits.
#[derive(Debug, Clone)]
pub(crate) struct ConnContext {
    pub client_addr: SocketAddr,
    pub resolved: Option<UpstreamTarget>,
    pub tunnel: Option<TunnelTarget>,
    /// Headers replayed on a chained CONNECT.
    pub connect_headers: Vec<(String, String)>,
    pub client_tls: bool,
    pub sni: Option<String>,
}

impl ConnContext {
    pub fn new(client_addr: SocketAddr, resolved: Option<UpstreamTarget>) -> Self {
        Self {
            client_addr,
            resolved,
            tunnel: None,
            connect_headers: Vec::new(),
            client_tls: false,
            sni: None,
        }
    }
}

/// The interception engine for one proxy instance.
pub struct ProxyServer {
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Build a server. Loads (or generates) certificate material from the
    /// confidential directory when TLS is enabled.
    pub fn new(
        config: ProxyConfig,
        handler: Arc<dyn InterceptHandler>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let tls_acceptor = match config.tls() {
            Some(options) => {
                let material = ensure_cert_material(config.confdir(), &options.cert_names)?;
                Some(create_tls_acceptor(&material)?)
            }
            None => None,
        };
        let upstream_tls = UpstreamTls::new(config.client_certs())?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handler,
                tls_acceptor,
                upstream_tls,
                cancel,
                tracker: TaskTracker::new(),
                next_flow_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    /// Accept and serve connections until cancelled, then drain.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let shared = self.shared;
        info!(
            "Proxy listening on {} ({} mode, tls: {})",
            local_addr,
            shared.config.kind(),
            shared.config.tls_enabled()
        );

        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        let task = accept_connection(Arc::clone(&shared), stream, client_addr);
                        shared.tracker.spawn(task);
                    }
                    Err(err) => warn!("Accept failed on {}: {}", local_addr, err),
                },
            }
        }

        drop(listener);
        shared.tracker.close();
        let drain = shared.config.drain_timeout();
        if tokio::time::timeout(drain, shared.tracker.wait()).await.is_err() {
            warn!(
                "{} connection(s) on {} still open after {:?}, abandoning them",
                shared.tracker.len(),
                local_addr,
                drain
            );
        }
        info!("Proxy on {} stopped", local_addr);
        Ok(())
    }
}

async fn accept_connection(shared: Arc<Shared>, stream: TcpStream, client_addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            error!("Failed to read local address for {}: {}", client_addr, err);
            return;
        }
    };
    let conn = ConnectionInfo {
        client_addr,
        local_addr,
    };
    let resolved = match shared.config.strategy().resolve(&conn) {
        Ok(resolved) => resolved,
        Err(err) => {
            error!("Failed to resolve upstream for {}: {}", client_addr, err);
            return;
        }
    };

    let client_tls = resolved.as_ref().is_some_and(|target| target.client_tls);
    let mut ctx = ConnContext::new(client_addr, resolved);
    if !client_tls {
        serve_connection(shared, ctx, stream).await;
        return;
    }

    let Some(acceptor) = shared.tls_acceptor.clone() else {
        error!(
            "Connection from {} requires TLS but no certificate material is loaded",
            client_addr
        );
        return;
    };
    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            ctx.client_tls = true;
            ctx.sni = tls_stream.get_ref().1.server_name().map(str::to_string);
            serve_connection(shared, ctx, tls_stream).await;
        }
        Err(err) => error!("TLS handshake failed from {}: {}", client_addr, err),
    }
}

/// Serve an established CONNECT tunnel, intercepting TLS when enabled.
pub(crate) async fn serve_tunnel<I>(shared: Arc<Shared>, mut ctx: ConnContext, io: I)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(acceptor) = shared.tls_acceptor.clone() else {
        serve_connection(shared, ctx, io).await;
        return;
    };
    match acceptor.accept(io).await {
        Ok(tls_stream) => {
            ctx.client_tls = true;
            ctx.sni = tls_stream.get_ref().1.server_name().map(str::to_string);
            serve_connection(shared, ctx, tls_stream).await;
        }
        Err(err) => error!("TLS handshake in tunnel from {} failed: {}", ctx.client_addr, err),
    }
}

/// Serve HTTP/1.1 on `io` until the client closes or the proxy shuts down.
///
/// Returns a boxed future: tunnels serve connections from inside a request
/// handler, which would otherwise make the future type recursive.
pub(crate) fn serve_connection<I>(shared: Arc<Shared>, ctx: ConnContext, io: I) -> BoxFuture<'static, ()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cancel = shared.cancel.clone();
    let client_addr = ctx.client_addr;
    Box::pin(async move {
        let service = service_fn(move |req| handle_request(Arc::clone(&shared), ctx.clone(), req));
        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    debug!("Error serving connection from {}: {}", client_addr, err);
                }
            }
            _ = cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if let Err(err) = conn.await {
                    debug!("Error draining connection from {}: {}", client_addr, err);
                }
            }
        }
    })
}
