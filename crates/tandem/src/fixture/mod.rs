//! Backend test servers.
//!
//! A [`BackendFixture`] answers `/p/<spec>` with the response the spec
//! describes and records every request it receives, including whether it
//! arrived over TLS, the SNI it carried and whether the client presented a
//! certificate.

mod server;
mod spec;

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{localhost_listener, tls};
use crate::error::{HarnessError, Result};
use crate::lifecycle::BackgroundThread;

pub use spec::{ResponseSpec, MAX_GENERATED_BODY};

#[derive(Debug, Clone, Default)]
pub struct FixtureOptions {
    /// Serve HTTPS with a freshly generated certificate.
    pub tls: bool,
    /// Extra subject alternative names for the certificate.
    pub cert_names: Vec<String>,
}

impl FixtureOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn tls() -> Self {
        Self {
            tls: true,
            cert_names: Vec::new(),
        }
    }
}

/// One request as seen by a backend fixture.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRequest {
    pub request_from: SocketAddr,
    pub method: String,
    /// Path and query exactly as received.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    pub client_cert: bool,
    pub timestamp: String,
}

impl RecordedRequest {
    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RequestLog {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl RequestLog {
    fn push(&self, request: RecordedRequest) {
        self.requests.lock().push(request);
    }
}

pub struct BackendFixture {
    addr: SocketAddr,
    tls: bool,
    log: RequestLog,
    thread: BackgroundThread,
}

impl BackendFixture {
    pub fn start(options: FixtureOptions) -> Result<Self> {
        Self::start_with_cancel(options, CancellationToken::new())
    }

    /// Start a fixture that also stops when `cancel` fires.
    pub fn start_with_cancel(options: FixtureOptions, cancel: CancellationToken) -> Result<Self> {
        let acceptor = if options.tls {
            let (cert, key) =
                tls::generate_pem(&options.cert_names).map_err(|e| HarnessError::tls(format!("{e:#}")))?;
            let config = tls::server_config(cert.as_bytes(), key.as_bytes(), true)
                .map_err(|e| HarnessError::tls(format!("{e:#}")))?;
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let listener = localhost_listener().map_err(|source| HarnessError::Bind {
            what: "backend fixture".to_string(),
            source,
        })?;
        let addr = listener.local_addr()?;
        let log = RequestLog::default();

        let server_log = log.clone();
        let server_cancel = cancel.clone();
        let thread = BackgroundThread::spawn(
            format!("FixtureThread ({addr})"),
            listener,
            cancel,
            move |listener| server::run(listener, acceptor, server_log, server_cancel),
        )?;
        info!("Started {} backend fixture on {}", if options.tls { "https" } else { "http" }, addr);

        Ok(Self {
            addr,
            tls: options.tls,
            log,
            thread,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// `http://127.0.0.1:<port>` or `https://...`.
    pub fn urlbase(&self) -> String {
        format!("{}://{}", self.scheme(), self.addr)
    }

    pub fn log(&self) -> Vec<RecordedRequest> {
        self.log.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.log.requests.lock().last().cloned()
    }

    pub fn clear_log(&self) {
        self.log.requests.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.thread.shutdown()?;
        info!("Stopped backend fixture on {}", self.addr);
        Ok(())
    }
}

impl std::fmt::Debug for BackendFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFixture")
            .field("urlbase", &self.urlbase())
            .field("running", &self.is_running())
            .finish()
    }
}
