//! Lock tokens: the RAII result of an acquire, and its deferred counterpart.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::task::JoinHandle;

use super::mutex::{MutexInner, WaiterSlot};
use super::state::LockOutcome;

/// Raised to an awaiting caller whose acquire was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lock acquisition canceled")]
pub struct LockCanceled;

/// Result of an acquire attempt.
///
/// A successful token holds the lock until it is released, either explicitly
/// with `release` or by dropping it. Releasing more than once is a no-op, as is
/// releasing an unsuccessful token.
#[must_use = "dropping a successful token releases the lock immediately"]
pub struct LockToken {
    success: bool,
    owner: Option<(Arc<MutexInner>, u64)>,
}

impl LockToken {
    pub(crate) fn acquired(mutex: Arc<MutexInner>, generation: u64) -> Self {
        LockToken {
            success: true,
            owner: Some((mutex, generation)),
        }
    }

    pub(crate) fn unacquired() -> Self {
        LockToken {
            success: false,
            owner: None,
        }
    }

    /// Whether the acquire won the lock. Unchanged by `release`.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Releases the lock if this token still holds it.
    pub fn release(&mut self) {
        if let Some((mutex, generation)) = self.owner.take() {
            mutex.release(generation);
        }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("success", &self.success)
            .field("held", &self.owner.is_some())
            .finish()
    }
}

struct Waiting {
    mutex: Arc<MutexInner>,
    slot: Arc<WaiterSlot>,
    generation: u64,
    watcher: JoinHandle<()>,
}

/// Deferred `LockToken`.
///
/// Resolves to `Ok(token)` on success or timeout (check `success()`), or to
/// `Err(LockCanceled)` when the wait was canceled.
#[must_use = "an awaitable does nothing unless polled, and dropping it abandons the wait"]
pub struct AwaitableLockToken {
    waiting: Option<Waiting>,
    outcome: Option<LockOutcome>,
    token: Option<LockToken>,
    synchronous: bool,
}

impl AwaitableLockToken {
    pub(crate) fn completed(outcome: LockOutcome, token: LockToken) -> Self {
        AwaitableLockToken {
            waiting: None,
            outcome: Some(outcome),
            token: Some(token),
            synchronous: true,
        }
    }

    pub(crate) fn pending(
        mutex: Arc<MutexInner>,
        slot: Arc<WaiterSlot>,
        generation: u64,
        watcher: JoinHandle<()>,
    ) -> Self {
        AwaitableLockToken {
            waiting: Some(Waiting {
                mutex,
                slot,
                generation,
                watcher,
            }),
            outcome: None,
            token: None,
            synchronous: false,
        }
    }

    /// True once the acquire is decided, whether or not it was polled.
    pub fn is_completed(&self) -> bool {
        match &self.waiting {
            Some(waiting) => waiting.slot.peek(waiting.generation) != LockOutcome::Pending,
            None => true,
        }
    }

    /// True when the acquire was decided before it was returned, i.e. awaiting
    /// it never suspends.
    pub fn is_completed_synchronously(&self) -> bool {
        self.synchronous
    }

    /// Attempts to cancel a pending acquire.
    ///
    /// Returns true when the final disposition is canceled, whether by this
    /// call, an earlier one, or a pre-canceled signal. Returns false once the
    /// acquire succeeded (or timed out); success is never revoked.
    pub fn try_cancel(&mut self) -> bool {
        if let Some(waiting) = &self.waiting {
            if waiting
                .mutex
                .abandon(&waiting.slot, waiting.generation, LockOutcome::Canceled)
            {
                self.settle(LockOutcome::Canceled);
                return true;
            }
            let decided = waiting.slot.peek(waiting.generation);
            return decided == LockOutcome::Canceled;
        }
        self.outcome == Some(LockOutcome::Canceled)
    }

    /// Records the decided outcome and returns the slot to its mutex.
    fn settle(&mut self, outcome: LockOutcome) {
        if let Some(waiting) = self.waiting.take() {
            waiting.watcher.abort();
            if outcome == LockOutcome::Success {
                self.token = Some(LockToken::acquired(
                    Arc::clone(&waiting.mutex),
                    waiting.slot.granted(),
                ));
            }
            waiting.mutex.recycle(waiting.slot);
        }
        self.outcome = Some(outcome);
    }

    fn take_result(&mut self) -> Result<LockToken, LockCanceled> {
        match self.outcome {
            Some(LockOutcome::Canceled) => Err(LockCanceled),
            _ => Ok(self.token.take().unwrap_or_else(LockToken::unacquired)),
        }
    }
}

impl Future for AwaitableLockToken {
    type Output = Result<LockToken, LockCanceled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(waiting) = &this.waiting {
            match waiting.slot.poll_outcome(waiting.generation, cx.waker()) {
                Some(outcome) => this.settle(outcome),
                None => return Poll::Pending,
            }
        }
        Poll::Ready(this.take_result())
    }
}

impl Drop for AwaitableLockToken {
    fn drop(&mut self) {
        let waiting = match &self.waiting {
            Some(waiting) => waiting,
            None => return,
        };
        if waiting
            .mutex
            .abandon(&waiting.slot, waiting.generation, LockOutcome::Canceled)
        {
            self.settle(LockOutcome::Canceled);
            return;
        }
        // Decided before anyone looked; a won lock is released by the token
        // that `settle` stores and the field drop that follows.
        let outcome = waiting.slot.peek(waiting.generation);
        self.settle(outcome);
    }
}

impl fmt::Debug for AwaitableLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitableLockToken")
            .field("completed", &self.is_completed())
            .field("synchronous", &self.synchronous)
            .field("outcome", &self.outcome)
            .finish()
    }
}
