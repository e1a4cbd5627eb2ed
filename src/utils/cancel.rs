use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Cooperative cancellation token shared between the controller, the
/// sequence engine and blocking driver waits.
///
/// Cancellation is advisory: nothing is killed mid-transaction. Waiters
/// either observe the flag between polls or wake early from
/// [`CancelToken::sleep`].
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop flag and wake every interruptible sleeper.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Lower the flag before starting a fresh operation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking immediately on cancellation.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the sleep
    /// was cut short by [`CancelToken::cancel`].
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // Re-check after registering interest so a cancel() racing with the
        // setup above cannot be missed.
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = &mut notified => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
