//! Integration-test harness for an intercepting proxy.
//!
//! Stands up backend fixtures and one or more proxy instances in the
//! explicit, transparent, reverse or chained topology, and hands tests the
//! helpers to drive traffic through them.

// ===== Harness =====
pub mod client;
pub mod config;
pub mod fixture;
pub mod harness;
pub mod lifecycle;
pub mod topology;

// ===== Proxy engine =====
pub mod engine;

// ===== Ambient =====
pub mod error;
pub mod logging;

// Don't export internal modules
mod language;

pub use client::{Connection, RequestSpec, TestClient, TestResponse, TopologyClient};
pub use config::{HarnessConfig, ProxyConfig, TlsOptions, APP_HOST, APP_PORT};
pub use error::{HarnessError, Result};
pub use fixture::{BackendFixture, FixtureOptions, RecordedRequest};
pub use harness::{ChainComposer, Harness};
pub use lifecycle::ProxyInstance;
pub use topology::{TopologyKind, TopologyResolver, UpstreamStrategy, UpstreamTarget};
