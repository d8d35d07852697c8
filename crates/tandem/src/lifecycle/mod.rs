//! Proxy lifecycle: one running proxy instance per [`ProxyInstance`].

mod background;
mod recorder;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ProxyConfig;
use crate::engine::{localhost_listener, Flow, InterceptHandler, ProxyServer};
use crate::error::{HarnessError, Result};
use crate::topology::{ConnectionInfo, TopologyKind, UpstreamTarget};

pub(crate) use background::BackgroundThread;
pub use recorder::{FlowState, InterceptLog, RecordingHandler};

/// A proxy bound to an ephemeral loopback port and served on its own thread.
pub struct ProxyInstance {
    addr: SocketAddr,
    config: ProxyConfig,
    log: InterceptLog,
    flows: FlowState,
    thread: BackgroundThread,
}

impl ProxyInstance {
    /// Bind, spawn the proxy thread and wait until it is accepting.
    pub fn start(config: ProxyConfig, cancel: CancellationToken) -> Result<Self> {
        Self::launch(config, cancel, None)
    }

    /// Like [`ProxyInstance::start`], with `handler` deciding the fate of
    /// every event after it has been recorded.
    pub fn start_with_handler(
        config: ProxyConfig,
        cancel: CancellationToken,
        handler: Arc<dyn InterceptHandler>,
    ) -> Result<Self> {
        Self::launch(config, cancel, Some(handler))
    }

    pub(crate) fn launch(
        config: ProxyConfig,
        cancel: CancellationToken,
        inner: Option<Arc<dyn InterceptHandler>>,
    ) -> Result<Self> {
        let listener = localhost_listener().map_err(|source| HarnessError::Bind {
            what: "proxy listener".to_string(),
            source,
        })?;
        let addr = listener.local_addr()?;

        let log = InterceptLog::default();
        let flows = FlowState::default();
        let mut handler = RecordingHandler::new(log.clone(), flows.clone());
        if let Some(inner) = inner {
            handler = handler.wrapping(inner);
        }
        let handler = Arc::new(handler);
        let server = ProxyServer::new(config.clone(), handler, cancel.clone())
            .map_err(|e| HarnessError::tls(format!("{e:#}")))?;

        let thread = BackgroundThread::spawn(
            format!("ProxyThread ({addr})"),
            listener,
            cancel,
            move |listener| server.run(listener),
        )?;
        info!("Started {} proxy on {}", config.kind(), addr);

        Ok(Self {
            addr,
            config,
            log,
            flows,
            thread,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Thread name, `ProxyThread (127.0.0.1:<port>)`.
    pub fn name(&self) -> &str {
        self.thread.name()
    }

    pub fn kind(&self) -> TopologyKind {
        self.config.kind()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Upstream this proxy resolves connections to, if the topology fixes one.
    pub fn resolved_upstream(&self) -> Result<Option<UpstreamTarget>> {
        let conn = ConnectionInfo {
            client_addr: self.addr,
            local_addr: self.addr,
        };
        Ok(self.config.strategy().resolve(&conn)?)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    /// Interception-log messages since the last clear, oldest first.
    pub fn log(&self) -> Vec<String> {
        self.log.entries()
    }

    pub fn clear_log(&self) {
        self.log.clear();
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.flows.flows()
    }

    pub fn clear_flows(&self) {
        self.flows.clear();
    }

    /// Clear log and flow state; called before every test case.
    pub fn reset(&self) {
        self.clear_log();
        self.clear_flows();
    }

    /// Stop accepting, drain in-flight connections and join the thread.
    pub fn shutdown(&mut self) -> Result<()> {
        self.thread.shutdown()?;
        info!("Stopped proxy on {}", self.addr);
        Ok(())
    }
}

impl std::fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("running", &self.is_running())
            .finish()
    }
}
