//! Interception log and flow state recorded from engine hooks.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{Flow, InterceptHandler, LogEntry, Reply};

/// Ordered, thread-safe list of interception-log messages.
#[derive(Debug, Clone, Default)]
pub struct InterceptLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl InterceptLog {
    pub fn push(&self, message: impl Into<String>) {
        self.entries.lock().push(message.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Completed flows in the order they finished.
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    flows: Arc<Mutex<Vec<Flow>>>,
}

impl FlowState {
    pub fn push(&self, flow: Flow) {
        self.flows.lock().push(flow);
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.flows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    pub fn clear(&self) {
        self.flows.lock().clear();
    }
}

/// Records every event, then defers to the wrapped handler if there is one.
/// Without one every event is released immediately.
#[derive(Clone)]
pub struct RecordingHandler {
    log: InterceptLog,
    flows: FlowState,
    inner: Option<Arc<dyn InterceptHandler>>,
}

impl RecordingHandler {
    pub fn new(log: InterceptLog, flows: FlowState) -> Self {
        Self {
            log,
            flows,
            inner: None,
        }
    }

    pub fn wrapping(mut self, inner: Arc<dyn InterceptHandler>) -> Self {
        self.inner = Some(inner);
        self
    }
}

impl std::fmt::Debug for RecordingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingHandler")
            .field("log", &self.log.len())
            .field("flows", &self.flows.len())
            .field("wrapping", &self.inner.is_some())
            .finish()
    }
}

impl InterceptHandler for RecordingHandler {
    fn request(&self, flow: &Flow) -> Reply {
        match self.inner {
            Some(ref inner) => inner.request(flow),
            None => Reply::Continue,
        }
    }

    fn response(&self, flow: &Flow) -> Reply {
        self.flows.push(flow.clone());
        match self.inner {
            Some(ref inner) => inner.response(flow),
            None => Reply::Continue,
        }
    }

    fn log(&self, entry: &LogEntry) -> Reply {
        self.log.push(entry.message.clone());
        match self.inner {
            Some(ref inner) => inner.log(entry),
            None => Reply::Continue,
        }
    }
}
