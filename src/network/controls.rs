//! Process-wide shutdown and suspend controls
//!
//! Every loop in the networking core observes these. Shutdown is a
//! [`CancellationToken`] so blocking calls can select on it; the suspended
//! flag is a plain atomic with a [`Notify`] for waking parked tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shared shutdown / suspend state, cheap to clone
#[derive(Clone, Debug, Default)]
pub struct Controls {
    inner: Arc<ControlsInner>,
}

#[derive(Debug, Default)]
struct ControlsInner {
    shutdown: CancellationToken,
    suspended: AtomicBool,
    wake: Notify,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown is requested
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Child token that is cancelled on shutdown or when cancelled itself
    pub fn child_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Request cooperative shutdown of everything observing these controls
    pub fn request_shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// Enter the suspended state: no new accepts, dials or dispatch work
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Leave the suspended state and wake anything parked on it
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Wake every task parked in [`Controls::wait_resumed`] so it re-checks flags
    pub fn release(&self) {
        self.inner.wake.notify_waiters();
    }

    /// Resolves on the next release, suspend or resume
    pub async fn changed(&self) {
        self.inner.wake.notified().await
    }

    /// Wait until the suspended flag clears.
    ///
    /// Returns `false` if shutdown was requested first.
    pub async fn wait_resumed(&self) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }

            // Register interest before re-checking to avoid a lost wakeup
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_suspended() {
                return !self.is_shutdown();
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }
}
