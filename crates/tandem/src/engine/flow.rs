//! Intercepted flows and the synchronous interception hook contract.

use std::net::SocketAddr;

use serde::Serialize;

/// One intercepted request/response exchange.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: u64,
    pub client_addr: SocketAddr,
    pub method: String,
    pub scheme: String,
    /// Destination as addressed by the client (request target, CONNECT
    /// authority or Host header).
    pub host: String,
    pub port: u16,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    /// Address the proxy actually connected to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    /// Embedded application that answered instead of an upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl Flow {
    pub(crate) fn new(
        id: u64,
        client_addr: SocketAddr,
        method: &str,
        path: &str,
        sni: Option<String>,
    ) -> Self {
        Self {
            id,
            client_addr,
            method: method.to_string(),
            scheme: "http".to_string(),
            host: String::new(),
            port: 0,
            path: path.to_string(),
            sni,
            upstream: None,
            app: None,
            status: None,
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn url(&self) -> String {
        if self.host.is_empty() {
            return self.path.clone();
        }
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn fail(&mut self, status: u16, message: impl Into<String>) {
        self.status = Some(status);
        self.error = Some(message.into());
    }

    /// One-line description written to the interception log.
    pub fn summary(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        match self.error {
            Some(ref error) => format!(
                "{}: {} {} -> {} {}",
                self.client_addr,
                self.method,
                self.url(),
                status,
                error
            ),
            None => format!(
                "{}: {} {} -> {}",
                self.client_addr,
                self.method,
                self.url(),
                status
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// A message emitted through the log hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn for_flow(flow: &Flow) -> Self {
        let level = if flow.is_error() {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        Self {
            level,
            message: flow.summary(),
        }
    }
}

/// Decision returned by every interception hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Release the event and carry on.
    Continue,
    /// Abort the flow; the client receives a 502.
    Kill,
}

/// Interception hooks invoked by the engine.
///
/// The engine calls each hook inline and waits for its return value before
/// touching the flow again, so a handler must record what it needs and
/// return promptly. Hooks may be called from several connections at once.
pub trait InterceptHandler: Send + Sync {
    /// The request head has been read and its destination resolved.
    fn request(&self, flow: &Flow) -> Reply;

    /// The exchange is complete (status or error set).
    fn response(&self, flow: &Flow) -> Reply;

    /// A log message was emitted.
    fn log(&self, entry: &LogEntry) -> Reply;
}
