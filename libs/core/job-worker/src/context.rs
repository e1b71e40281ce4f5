//! Cancellation and deadline context handed to job handlers

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Create a linked shutdown trigger and signal.
///
/// The worker owns the sender; every consumption loop, retry task and job
/// context holds a cloned [`ShutdownSignal`].
pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownSignal::new(rx))
}

/// Read side of the worker's shutdown channel
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    ///
    /// A dropped sender counts as a shutdown request.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|&stop| stop).await;
    }
}

/// Roughly 30 years; stands in for deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Per-invocation context for a job handler.
///
/// Cancellation is cooperative: the worker never aborts a running handler
/// on shutdown, handlers that care should watch [`JobContext::cancelled`].
/// The deadline, on the other hand, is enforced by the worker.
#[derive(Clone, Debug)]
pub struct JobContext {
    worker_id: usize,
    attempt: u32,
    deadline: Instant,
    shutdown: ShutdownSignal,
}

impl JobContext {
    pub fn new(worker_id: usize, attempt: u32, timeout: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            worker_id,
            attempt,
            deadline: deadline_after(timeout),
            shutdown,
        }
    }

    /// Index of the consumption loop running this job
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// 1-based attempt number of this invocation
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the worker gives up on this invocation
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Resolve once the worker begins shutting down
    pub async fn cancelled(&self) {
        self.shutdown.triggered().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_not_triggered_initially() {
        let (_tx, signal) = shutdown_channel();
        assert!(!signal.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_triggered_after_send() {
        let (tx, signal) = shutdown_channel();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.triggered().await }
        });

        tx.send_replace(true);
        waiter.await.unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_resolves_when_sender_dropped() {
        let (tx, signal) = shutdown_channel();
        drop(tx);
        signal.triggered().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_and_remaining() {
        let (_tx, signal) = shutdown_channel();
        let ctx = JobContext::new(2, 1, Duration::from_secs(300), signal);

        assert_eq!(ctx.worker_id(), 2);
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.remaining(), Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(ctx.remaining(), Duration::from_secs(200));

        tokio::time::advance(Duration::from_secs(500)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_context_observes_shutdown() {
        let (tx, signal) = shutdown_channel();
        let ctx = JobContext::new(0, 1, Duration::from_secs(5), signal);

        assert!(!ctx.is_cancelled());
        tx.send_replace(true);
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_context_with_unbounded_timeout() {
        let (_tx, signal) = shutdown_channel();
        let ctx = JobContext::new(0, 1, Duration::MAX, signal);

        assert!(ctx.remaining() > Duration::from_secs(86_400 * 365));
        assert!(!ctx.is_cancelled());
    }
}
