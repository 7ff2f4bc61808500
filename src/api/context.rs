use std::time::Duration;
use tokio::time::Instant;

/// Context carries a deadline and a trace ID along a call chain.
///
/// Outbound calls derive the request expiration from the deadline; command
/// handlers receive a context whose deadline equals the inbound message's
/// declared expiration, so they can self-abort.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    trace_id: Option<String>,
}

impl Context {
    /// An empty context: no deadline, no trace.
    pub fn background() -> Self {
        Context::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Time left until the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if d <= Instant::now())
    }

    /// Resolves when the deadline passes. Pends forever if there is none.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Applies the given timeout if no deadline has been set.
    pub(crate) fn or_timeout(self, timeout: Duration) -> Self {
        if self.deadline.is_some() {
            self
        } else {
            self.with_timeout(timeout)
        }
    }
}
