//! Log-based metrics for handler outcomes.
//!
//! Emits structured tracing events; an external collector scrapes them from
//! the log pipeline.

use std::time::Duration;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Ok,
    Fail,
}

impl HandlerStatus {
    fn as_str(self) -> &'static str {
        match self {
            HandlerStatus::Ok => "ok",
            HandlerStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    /// Records one handler invocation.
    pub fn record_handled(
        &self,
        function: &str,
        subject: &str,
        status: HandlerStatus,
        retryable: bool,
        elapsed: Duration,
    ) {
        info!(
            function = %function,
            subject = %subject,
            status = %status.as_str(),
            retryable = retryable,
            elapsed_ms = elapsed.as_millis() as u64,
            "handler invocation recorded"
        );
    }

    /// Records a pipeline error outside handler bodies.
    pub fn record_error(&self, kind: &str, subject: &str) {
        info!(kind = %kind, subject = %subject, "pipeline error recorded");
    }
}
