//! Dedicated server threads.
//!
//! Every proxy and backend fixture runs on its own OS thread with a
//! current-thread runtime, so test code on any runtime can talk to it over
//! TCP without sharing an executor.

use std::future::Future;
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{HarnessError, Result};

/// A server thread that stops when its token is cancelled.
pub(crate) struct BackgroundThread {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundThread {
    /// Spawn `name` serving `listener` with the future built by `serve`.
    ///
    /// Returns once the listener is registered with the thread's runtime.
    /// `serve` must return when `cancel` fires.
    pub fn spawn<F, Fut>(
        name: String,
        listener: std::net::TcpListener,
        cancel: CancellationToken,
        serve: F,
    ) -> Result<Self>
    where
        F: FnOnce(tokio::net::TcpListener) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), String>>(1);
        let thread_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };

                let serve_name = thread_name.clone();
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err.to_string()));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    if let Err(err) = serve(listener).await {
                        error!("{} failed: {:#}", serve_name, err);
                    }
                });
                debug!("{} exited", thread_name);
            })
            .map_err(|err| HarnessError::Runtime(format!("{name}: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                name,
                cancel,
                handle: Some(handle),
            }),
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(HarnessError::Runtime(format!("{name}: {reason}")))
            }
            Err(_) => {
                let _ = handle.join();
                Err(HarnessError::Runtime(format!(
                    "{name}: thread exited before becoming ready"
                )))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Cancel the server and join its thread.
    pub fn shutdown(&mut self) -> Result<()> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| HarnessError::AlreadyShutdown(self.name.clone()))?;
        self.cancel.cancel();
        handle
            .join()
            .map_err(|_| HarnessError::Runtime(format!("{} panicked", self.name)))
    }
}

impl Drop for BackgroundThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("{} dropped while running, shutting it down", self.name);
            if let Err(err) = self.shutdown() {
                warn!("{}", err);
            }
        }
    }
}
