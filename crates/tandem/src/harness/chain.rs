//! Upstream proxy chains.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::engine::InterceptHandler;
use crate::error::{HarnessError, Result};
use crate::lifecycle::ProxyInstance;
use crate::topology::{TopologyKind, TopologyResolver};

/// Starts `n` proxies where each hop forwards to the next and the last one
/// is an explicit proxy talking to the real backend.
pub struct ChainComposer<'a> {
    resolver: &'a TopologyResolver,
    cancel: CancellationToken,
    handler: Option<Arc<dyn InterceptHandler>>,
}

impl<'a> ChainComposer<'a> {
    pub fn new(resolver: &'a TopologyResolver, cancel: CancellationToken) -> Self {
        Self {
            resolver,
            cancel,
            handler: None,
        }
    }

    /// Install `handler` on every hop.
    pub fn with_handler(mut self, handler: Option<Arc<dyn InterceptHandler>>) -> Self {
        self.handler = handler;
        self
    }

    fn start_hop(&self, config: ProxyConfig) -> Result<ProxyInstance> {
        ProxyInstance::launch(config, self.cancel.child_token(), self.handler.clone())
    }

    /// Start the chain, last hop first. The result is ordered entry-first.
    pub fn start(&self, hops: usize) -> Result<Vec<ProxyInstance>> {
        if hops == 0 {
            return Err(HarnessError::InvalidConfig(
                "a chain needs at least one hop".to_string(),
            ));
        }

        let config = self.resolver.resolve(TopologyKind::Explicit, None)?;
        let mut started = vec![self.start_hop(config)?];

        while started.len() < hops {
            let next = started[started.len() - 1].addr();
            let result = self
                .resolver
                .resolve(TopologyKind::Chain, Some(next))
                .and_then(|config| self.start_hop(config));
            match result {
                Ok(proxy) => started.push(proxy),
                Err(err) => {
                    started.reverse();
                    stop_all(&mut started);
                    return Err(err);
                }
            }
        }

        started.reverse();
        if let Err(err) = verify(&started) {
            stop_all(&mut started);
            return Err(err);
        }

        info!(
            "Started {}-hop chain, entry {}",
            started.len(),
            started[0].addr()
        );
        Ok(started)
    }
}

/// Check that hop `i` resolves to hop `i + 1` and the last hop is explicit.
pub fn verify(hops: &[ProxyInstance]) -> Result<()> {
    for (i, pair) in hops.windows(2).enumerate() {
        let upstream = pair[0].resolved_upstream()?;
        match upstream {
            Some(ref target) if target.matches_addr(pair[1].addr()) => {}
            other => {
                return Err(HarnessError::InvalidConfig(format!(
                    "chain hop {i} resolves to {:?}, expected {}",
                    other.map(|t| t.authority()),
                    pair[1].addr()
                )))
            }
        }
    }
    match hops.last() {
        Some(last) if last.kind() == TopologyKind::Explicit => Ok(()),
        Some(last) => Err(HarnessError::InvalidConfig(format!(
            "last chain hop must be explicit, got {}",
            last.kind()
        ))),
        None => Err(HarnessError::InvalidConfig("empty chain".to_string())),
    }
}

/// Stop every running hop in slice order.
pub(crate) fn stop_all(hops: &mut [ProxyInstance]) {
    for hop in hops.iter_mut() {
        if hop.is_running() {
            if let Err(err) = hop.shutdown() {
                warn!("Failed to stop {}: {}", hop.name(), err);
            }
        }
    }
}
