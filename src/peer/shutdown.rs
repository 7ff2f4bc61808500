use std::sync::Arc;
use tokio::sync::watch;

/// Stop is a broadcast shutdown signal. Cloning is cheap; every clone
/// observes the same signal.
#[derive(Clone)]
pub(crate) struct Stop {
    tx: Arc<watch::Sender<bool>>,
}

impl Stop {
    pub(crate) fn new() -> Stop {
        let (tx, _) = watch::channel(false);
        Stop { tx: Arc::new(tx) }
    }

    pub(crate) fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves when the signal fires. Resolves immediately if it already
    /// has.
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// TaskGauge counts in-flight handler tasks so a graceful stop can wait for
/// them to drain.
#[derive(Clone)]
pub(crate) struct TaskGauge {
    tx: Arc<watch::Sender<usize>>,
}

pub(crate) struct TaskGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl TaskGauge {
    pub(crate) fn new() -> TaskGauge {
        let (tx, _) = watch::channel(0);
        TaskGauge { tx: Arc::new(tx) }
    }

    pub(crate) fn enter(&self) -> TaskGuard {
        self.tx.send_modify(|count| *count += 1);
        TaskGuard { tx: Arc::clone(&self.tx) }
    }

    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|count| *count -= 1);
    }
}
