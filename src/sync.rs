use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Outcome of a bounded wait on an [`EventSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited event arrived (or was force-signaled)
    Signaled,
    /// The timeout elapsed first
    TimedOut,
    /// The wait was abandoned because the adapter is shutting down
    Cancelled,
}

impl WaitOutcome {
    pub fn is_signaled(&self) -> bool {
        matches!(self, WaitOutcome::Signaled)
    }
}

/// Countable wait primitive that turns asynchronous hardware notifications
/// into synchronous checkpoints for the thread driving the capture lifecycle.
///
/// Every `signal` adds one permit; every successful wait consumes one.
/// Permits handed out by `signal` go to queued waiters first, so a
/// force-signal after a timeout always unblocks anyone still parked.
#[derive(Debug)]
pub struct EventSignal {
    name: &'static str,
    permits: Semaphore,
}

impl EventSignal {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            permits: Semaphore::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of signals not yet consumed by a waiter
    pub fn count(&self) -> usize {
        self.permits.available_permits()
    }

    /// Release one waiter (or bank a permit for the next one)
    pub fn signal(&self) {
        trace!("Signaling {}", self.name);
        self.permits.add_permits(1);
    }

    /// Block until signaled, the timeout elapses, or `cancel` fires
    pub async fn wait_timeout(&self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Wait on {} cancelled", self.name);
                WaitOutcome::Cancelled
            }
            acquired = tokio::time::timeout(timeout, self.permits.acquire()) => match acquired {
                Ok(Ok(permit)) => {
                    permit.forget();
                    WaitOutcome::Signaled
                }
                Ok(Err(_)) => WaitOutcome::Cancelled,
                Err(_) => WaitOutcome::TimedOut,
            }
        }
    }

    /// Wake any waiter still parked on this signal without leaving a banked
    /// permit behind for the next session.
    pub fn release_waiters(&self) {
        warn!("Force-signaling {}", self.name);
        self.permits.add_permits(1);
        self.drain();
    }

    /// Discard banked permits so the next session starts from zero.
    /// Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while let Ok(permit) = self.permits.try_acquire() {
            permit.forget();
            drained += 1;
        }
        if drained > 0 {
            trace!("Drained {} stale permit(s) from {}", drained, self.name);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_signal_before_wait_is_banked() {
        let signal = EventSignal::new("banked");
        signal.signal();
        assert_eq!(signal.count(), 1);

        let outcome = signal
            .wait_timeout(Duration::from_millis(10), &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::Signaled);
        assert_eq!(signal.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let signal = EventSignal::new("silent");
        let outcome = signal
            .wait_timeout(Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_signal_from_other_task_releases_waiter() {
        let signal = Arc::new(EventSignal::new("cross-task"));
        let remote = Arc::clone(&signal);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.signal();
        });

        let outcome = signal
            .wait_timeout(Duration::from_secs(2), &CancellationToken::new())
            .await;
        assert!(outcome.is_signaled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let signal = EventSignal::new("cancelled");
        let token = CancellationToken::new();
        token.cancel();

        let outcome = signal.wait_timeout(Duration::from_secs(5), &token).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_release_waiters_unblocks_parked_task() {
        let signal = Arc::new(EventSignal::new("parked"));
        let waiter = Arc::clone(&signal);
        let handle = tokio::spawn(async move {
            waiter
                .wait_timeout(Duration::from_secs(5), &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.release_waiters();

        assert_eq!(handle.await.unwrap(), WaitOutcome::Signaled);
        assert_eq!(signal.count(), 0);
    }

    #[tokio::test]
    async fn test_release_waiters_leaves_no_permit_when_idle() {
        let signal = EventSignal::new("idle");
        signal.release_waiters();
        assert_eq!(signal.count(), 0);
    }

    #[tokio::test]
    async fn test_drain_clears_stale_permits() {
        let signal = EventSignal::new("stale");
        signal.signal();
        signal.signal();
        assert_eq!(signal.drain(), 2);
        assert_eq!(signal.count(), 0);
        assert_eq!(signal.drain(), 0);
    }
}
