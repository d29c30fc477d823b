//! Progress notifications

use tracing::info;

/// Receives periodic request-count notifications
pub trait ProgressSink: Send {
    fn on_progress(&mut self, requests: u64);
}

impl<F: FnMut(u64) + Send> ProgressSink for F {
    fn on_progress(&mut self, requests: u64) {
        self(requests)
    }
}

/// Default sink: one INFO line per notification
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&mut self, requests: u64) {
        info!(requests, "Request #{}", requests);
    }
}
