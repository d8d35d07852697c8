//! Test fixture orchestration.
//!
//! A [`Harness`] owns everything a test class needs: two backend fixtures,
//! the scratch confidential directory and the proxy instance(s) of the
//! configured topology. Setup runs backends → config → proxies; teardown
//! runs the exact reverse.

pub mod chain;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::TopologyClient;
use crate::config::HarnessConfig;
use crate::engine::{tls, AppRegistry, Authenticator, BasicProxyAuth, InterceptHandler};
use crate::error::{HarnessError, Result};
use crate::fixture::{BackendFixture, FixtureOptions};
use crate::lifecycle::ProxyInstance;
use crate::topology::{FixtureAddrs, TopologyKind, TopologyResolver};

pub use chain::ChainComposer;

pub struct Harness {
    config: HarnessConfig,
    cancel: CancellationToken,
    server: BackendFixture,
    server2: BackendFixture,
    confdir: Option<TempDir>,
    confdir_path: PathBuf,
    /// Entry hop first. Never empty once setup returns.
    proxies: Vec<ProxyInstance>,
    handler: Option<Arc<dyn InterceptHandler>>,
    torn_down: bool,
}

impl Harness {
    pub fn setup(config: HarnessConfig) -> Result<Self> {
        Self::launch(config, None)
    }

    /// Set up with `handler` consulted by every hop after its events are
    /// recorded. Returning [`Reply::Kill`](crate::engine::Reply::Kill)
    /// aborts the flow with a 502.
    pub fn setup_with_handler(
        config: HarnessConfig,
        handler: Arc<dyn InterceptHandler>,
    ) -> Result<Self> {
        Self::launch(config, Some(handler))
    }

    fn launch(config: HarnessConfig, handler: Option<Arc<dyn InterceptHandler>>) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let options = FixtureOptions {
            tls: config.tls,
            cert_names: config.tls_options.cert_names.clone(),
        };
        let mut server = BackendFixture::start_with_cancel(options.clone(), cancel.child_token())?;
        let server2 = match BackendFixture::start_with_cancel(options, cancel.child_token()) {
            Ok(server2) => server2,
            Err(err) => {
                let _ = server.shutdown();
                return Err(err);
            }
        };

        let confdir = tempfile::Builder::new()
            .prefix(&config.confdir_prefix)
            .tempdir()?;
        let confdir_path = confdir.path().to_path_buf();

        let mut harness = Self {
            config,
            cancel,
            server,
            server2,
            confdir: Some(confdir),
            confdir_path,
            proxies: Vec::new(),
            handler,
            torn_down: false,
        };

        match harness.start_proxies() {
            Ok(proxies) => {
                harness.proxies = proxies;
                info!(
                    "Harness ready: {} topology, entry {}, backends {} and {}",
                    harness.kind(),
                    harness.proxies[0].addr(),
                    harness.server.addr(),
                    harness.server2.addr()
                );
                Ok(harness)
            }
            Err(err) => {
                if let Err(teardown_err) = harness.teardown() {
                    warn!("Teardown after failed setup: {}", teardown_err);
                }
                Err(err)
            }
        }
    }

    fn resolver(&self) -> Result<TopologyResolver> {
        let config = &self.config;
        // testapp and errapp are always mounted; `apps` only gates onboarding.
        let mut apps = AppRegistry::with_test_apps();
        if config.apps {
            let material = tls::ensure_cert_material(&self.confdir_path, &config.tls_options.cert_names)
                .map_err(|e| HarnessError::tls(format!("{e:#}")))?;
            let pem = material
                .cert_pem()
                .map_err(|e| HarnessError::tls(format!("{e:#}")))?;
            apps = apps.with_onboarding(pem);
        }
        let authenticator = config.auth.as_ref().map(|auth| {
            Arc::new(BasicProxyAuth::new(&auth.username, &auth.password, &auth.realm))
                as Arc<dyn Authenticator>
        });

        Ok(TopologyResolver::new(
            FixtureAddrs::new(self.server.addr(), Some(self.server2.addr())),
            self.confdir_path.clone(),
        )
        .with_tls(config.tls.then(|| config.tls_options.clone()))
        .with_authenticator(authenticator)
        .with_client_certs(config.client_certs.clone())
        .with_apps(apps)
        .with_drain_timeout(config.drain_timeout()))
    }

    fn start_proxies(&self) -> Result<Vec<ProxyInstance>> {
        let resolver = self.resolver()?;
        match self.config.topology {
            TopologyKind::Chain => ChainComposer::new(&resolver, self.cancel.clone())
                .with_handler(self.handler.clone())
                .start(self.config.chain_length),
            kind => {
                let config = resolver.resolve(kind, None)?;
                Ok(vec![ProxyInstance::launch(
                    config,
                    self.cancel.child_token(),
                    self.handler.clone(),
                )?])
            }
        }
    }

    /// Stop proxies, remove the confidential directory, stop `server2`
    /// then `server`. Every step runs; the first error is returned.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Err(HarnessError::AlreadyShutdown("harness".to_string()));
        }
        self.torn_down = true;

        let mut first_error = None;
        let mut keep = |result: Result<()>| {
            if let Err(err) = result {
                warn!("Teardown step failed: {}", err);
                first_error.get_or_insert(err);
            }
        };

        for proxy in self.proxies.iter_mut() {
            if proxy.is_running() {
                keep(proxy.shutdown());
            }
        }
        if let Some(confdir) = self.confdir.take() {
            keep(confdir.close().map_err(HarnessError::from));
        }
        if self.server2.is_running() {
            keep(self.server2.shutdown());
        }
        if self.server.is_running() {
            keep(self.server.shutdown());
        }
        self.cancel.cancel();
        info!("Harness torn down");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clear every hop's log and flow state and both fixture logs.
    pub fn reset(&self) {
        for proxy in &self.proxies {
            proxy.reset();
        }
        self.server.clear_log();
        self.server2.clear_log();
    }

    /// Start a test case: reset all state and hand out the traffic helpers.
    pub fn case(&self) -> TopologyClient {
        self.reset();
        self.client()
    }

    fn client(&self) -> TopologyClient {
        let client = TopologyClient::new(
            self.kind(),
            self.config.tls,
            self.proxy().addr(),
            self.server.addr(),
        )
        .with_apps(self.config.apps);
        match self.config.auth {
            Some(ref auth) => client.with_credentials(&auth.username, &auth.password),
            None => client,
        }
    }

    /// The entry hop.
    pub fn proxy(&self) -> &ProxyInstance {
        &self.proxies[0]
    }

    /// The entry hop, for tests that stop it early.
    pub fn proxy_mut(&mut self) -> &mut ProxyInstance {
        &mut self.proxies[0]
    }

    /// All hops, entry first. A single element outside chain mode.
    pub fn chain(&self) -> &[ProxyInstance] {
        &self.proxies
    }

    pub fn server(&self) -> &BackendFixture {
        &self.server
    }

    pub fn server2(&self) -> &BackendFixture {
        &self.server2
    }

    pub fn confdir(&self) -> &Path {
        &self.confdir_path
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn kind(&self) -> TopologyKind {
        self.config.topology
    }

    pub fn scheme(&self) -> &'static str {
        if self.config.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Proxy URL a client is configured with. Explicit and chain entries
    /// are always addressed over plain HTTP; TLS rides inside CONNECT.
    pub fn proxies(&self) -> String {
        let scheme = if self.kind().is_proxy_addressed() {
            "http"
        } else {
            self.scheme()
        };
        format!("{}://{}", scheme, self.proxy().addr())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!("Harness dropped without teardown, tearing down");
            if let Err(err) = self.teardown() {
                warn!("{}", err);
            }
        }
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("kind", &self.kind())
            .field("tls", &self.config.tls)
            .field("proxies", &self.proxies)
            .field("server", &self.server)
            .field("server2", &self.server2)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}
