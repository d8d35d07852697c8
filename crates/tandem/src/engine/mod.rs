//! In-process interception proxy.
//!
//! The engine serves HTTP/1.1 (and TLS-intercepted HTTP/1.1 through CONNECT
//! tunnels or transparent/reverse TLS listeners) and reports every exchange
//! through the synchronous [`InterceptHandler`] hooks.

mod apps;
mod auth;
mod flow;
mod forwarding;
mod handler;
mod headers;
pub(crate) mod io;
mod network;
mod server;
pub mod tls;

pub use apps::{
    App, AppError, AppRegistry, AppRequest, AppResponse, ErrApp, OnboardingApp, TestApp,
    ERRAPP_HOST, TESTAPP_HOST,
};
pub use auth::{Authenticator, BasicProxyAuth};
pub use flow::{Flow, InterceptHandler, LogEntry, LogLevel, Reply};
pub use forwarding::ProxyBody;
pub use headers::{X_TANDEM_APP, X_TANDEM_ERROR};
pub use network::{create_listener, localhost_listener};
pub use server::ProxyServer;
