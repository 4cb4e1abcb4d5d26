//! Exclusive mutex with blocking and asynchronous acquisition.
//!
//! The mutex word reuses the outcome bits of `LockState`: `Success` means the
//! current generation holds the resource, any other outcome means available.
//! Waiters each own a pooled `WaiterSlot` whose own word decides the race
//! between hand-off, deadline and cancellation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::state::{LockOutcome, LockState};
use super::token::{AwaitableLockToken, LockToken};

/// Outcome stored in the mutex word while nobody holds it.
const AVAILABLE: LockOutcome = LockOutcome::Timeout;

/// Upper bound on recycled waiter slots kept per mutex.
const MAX_POOLED_SLOTS: usize = 16;

/// Per-waiter rendezvous point.
///
/// `state` is the waiter's own `LockState`; a slot is re-issued with
/// `next_generation` on every checkout, so callbacks holding an older
/// generation can never touch the current wait.
pub(crate) struct WaiterSlot {
    state: AtomicU64,
    // Mutex generation handed over on success; written before `state` flips.
    granted: AtomicU64,
    signal: Mutex<Option<Waker>>,
    wakeup: Condvar,
}

impl WaiterSlot {
    fn new() -> Self {
        WaiterSlot {
            state: AtomicU64::new(LockState::INITIAL.bits()),
            granted: AtomicU64::new(0),
            signal: Mutex::new(None),
            wakeup: Condvar::new(),
        }
    }

    /// Starts a new wait on this slot and returns its generation.
    fn issue(&self) -> u64 {
        *self.signal.lock() = None;
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(LockState::from_bits(bits).next_generation().bits())
            })
            .unwrap_or_else(|bits| bits);
        LockState::from_bits(previous).next_generation().generation()
    }

    /// Moves `generation` from `Pending` to `outcome`. Fails silently when the
    /// generation is stale or already decided.
    pub(crate) fn transition(&self, generation: u64, outcome: LockOutcome) -> bool {
        let pending = LockState::new(generation, LockOutcome::Pending);
        self.state
            .compare_exchange(
                pending.bits(),
                pending.with_outcome(outcome).bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current outcome of `generation`, without side effects.
    pub(crate) fn peek(&self, generation: u64) -> LockOutcome {
        let state = LockState::from_bits(self.state.load(Ordering::Acquire));
        if state.generation() == generation {
            state.outcome()
        } else {
            // Only the owner asks, and the owner's generation is always current.
            LockOutcome::Timeout
        }
    }

    pub(crate) fn granted(&self) -> u64 {
        self.granted.load(Ordering::Acquire)
    }

    /// Registers `waker` unless the wait is already decided.
    pub(crate) fn poll_outcome(&self, generation: u64, waker: &Waker) -> Option<LockOutcome> {
        let mut signal = self.signal.lock();
        match self.peek(generation) {
            LockOutcome::Pending => {
                match signal.as_ref() {
                    Some(existing) if existing.will_wake(waker) => {}
                    _ => *signal = Some(waker.clone()),
                }
                None
            }
            outcome => Some(outcome),
        }
    }

    /// Blocks the calling thread until `generation` is decided or `deadline`
    /// passes, in which case the slot times itself out.
    fn wait_until(&self, generation: u64, deadline: Instant) -> LockOutcome {
        let mut signal = self.signal.lock();
        loop {
            match self.peek(generation) {
                LockOutcome::Pending => {}
                outcome => return outcome,
            }
            if self.wakeup.wait_until(&mut signal, deadline).timed_out()
                && self.transition(generation, LockOutcome::Timeout)
            {
                return LockOutcome::Timeout;
            }
        }
    }

    /// Wakes whichever adapter is waiting on this slot.
    pub(crate) fn notify(&self) {
        let waker = {
            let mut signal = self.signal.lock();
            self.wakeup.notify_all();
            signal.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct QueuedWaiter {
    slot: Arc<WaiterSlot>,
    generation: u64,
}

pub(crate) struct MutexInner {
    state: AtomicU64,
    timeout: Duration,
    // Queued waiters; updated only while `queue` is locked.
    waiters: AtomicUsize,
    queue: Mutex<VecDeque<QueuedWaiter>>,
    slots: Mutex<Vec<Arc<WaiterSlot>>>,
}

impl MutexInner {
    /// One attempt to take an available mutex. Retries only while the word
    /// keeps changing between available states.
    fn try_grab(&self) -> Option<u64> {
        let mut current = LockState::from_bits(self.state.load(Ordering::SeqCst));
        loop {
            if current.outcome() == LockOutcome::Success {
                return None;
            }
            let held = current.next_generation().with_outcome(LockOutcome::Success);
            match self.state.compare_exchange(
                current.bits(),
                held.bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(held.generation()),
                Err(actual) => current = LockState::from_bits(actual),
            }
        }
    }

    /// Releases the holder of `generation`.
    ///
    /// **Logic**:
    /// 1. No waiters: flip the word to available with one CAS, then re-check the
    ///    waiter count to catch a registration that raced the flip.
    /// 2. Waiters: keep ownership and hand the mutex straight to the oldest
    ///    live waiter, so a newcomer cannot slip in between.
    pub(crate) fn release(&self, generation: u64) {
        let held = LockState::new(generation, LockOutcome::Success);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            if self
                .state
                .compare_exchange(
                    held.bits(),
                    held.with_outcome(AVAILABLE).bits(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                warn!(generation, "ignoring release of a stale lock generation");
                return;
            }
            if self.waiters.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.hand_off(None);
        } else {
            if self.state.load(Ordering::SeqCst) != held.bits() {
                warn!(generation, "ignoring release of a stale lock generation");
                return;
            }
            self.hand_off(Some(generation));
        }
    }

    /// Passes the mutex to the first queued waiter that is still pending.
    ///
    /// `owned` is the generation the caller currently holds, or `None` when
    /// the mutex must first be grabbed from the available state. A waiter
    /// stays queued and counted until the word has moved to its generation,
    /// so a holder releasing meanwhile still takes the hand-off path.
    fn hand_off(&self, mut owned: Option<u64>) {
        let mut woken = None;
        {
            let mut queue = self.queue.lock();
            while !queue.is_empty() {
                // Held by someone else now; their release serves the queue.
                let Some(current) = owned.or_else(|| self.try_grab()) else {
                    break;
                };
                let from = LockState::new(current, LockOutcome::Success);
                let next = from.next_generation().with_outcome(LockOutcome::Success);
                if self
                    .state
                    .compare_exchange(from.bits(), next.bits(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    owned = None;
                    break;
                }
                let Some(waiter) = queue.pop_front() else {
                    owned = Some(next.generation());
                    break;
                };
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                waiter.slot.granted.store(next.generation(), Ordering::Release);
                if waiter.slot.transition(waiter.generation, LockOutcome::Success) {
                    debug!(
                        generation = next.generation(),
                        waiter = waiter.generation,
                        "write lock handed to waiter"
                    );
                    woken = Some(waiter.slot);
                    owned = None;
                    break;
                }
                // The waiter timed out or was canceled meanwhile; keep the lock
                // and try the next one.
                trace!(waiter = waiter.generation, "skipping decided waiter");
                owned = Some(next.generation());
            }

            if let Some(current) = owned {
                let held = LockState::new(current, LockOutcome::Success);
                let _ = self.state.compare_exchange(
                    held.bits(),
                    held.with_outcome(AVAILABLE).bits(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }

        if let Some(slot) = woken {
            slot.notify();
        }
    }

    /// Queues a waiter, unless the mutex can be grabbed right away.
    ///
    /// The count is raised before the grab so a concurrent fast-path release
    /// either sees the waiter or leaves the word available for the grab.
    fn register(&self, slot: &Arc<WaiterSlot>, generation: u64) -> Option<u64> {
        let mut queue = self.queue.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        if let Some(current) = self.try_grab() {
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            return Some(current);
        }
        queue.push_back(QueuedWaiter {
            slot: Arc::clone(slot),
            generation,
        });
        None
    }

    fn unregister(&self, slot: &Arc<WaiterSlot>, generation: u64) {
        let mut queue = self.queue.lock();
        if let Some(idx) = queue
            .iter()
            .position(|w| w.generation == generation && Arc::ptr_eq(&w.slot, slot))
        {
            queue.remove(idx);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Ends a pending wait with `outcome` (timeout or cancellation).
    ///
    /// Returns false when the generation was already decided, e.g. the lock
    /// was handed over first.
    pub(crate) fn abandon(
        &self,
        slot: &Arc<WaiterSlot>,
        generation: u64,
        outcome: LockOutcome,
    ) -> bool {
        if !slot.transition(generation, outcome) {
            return false;
        }
        self.unregister(slot, generation);
        slot.notify();
        true
    }

    fn checkout_slot(&self) -> (Arc<WaiterSlot>, u64) {
        let slot = self
            .slots
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(WaiterSlot::new()));
        let generation = slot.issue();
        (slot, generation)
    }

    pub(crate) fn recycle(&self, slot: Arc<WaiterSlot>) {
        let mut slots = self.slots.lock();
        if slots.len() < MAX_POOLED_SLOTS {
            slots.push(slot);
        }
    }
}

/// Exclusive lock guarding one connection's write path.
///
/// Cloning is cheap and every clone refers to the same lock.
#[derive(Clone)]
pub struct ExclusiveMutex {
    inner: Arc<MutexInner>,
}

impl ExclusiveMutex {
    /// Creates a mutex whose waits are bounded by `timeout`; zero means an
    /// acquire never waits.
    pub fn new(timeout: Duration) -> Self {
        ExclusiveMutex {
            inner: Arc::new(MutexInner {
                state: AtomicU64::new(LockState::INITIAL.bits()),
                timeout,
                waiters: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// True while some token holds the lock.
    pub fn is_held(&self) -> bool {
        LockState::from_bits(self.inner.state.load(Ordering::Acquire)).outcome()
            == LockOutcome::Success
    }

    /// True while at least one caller is queued for the lock.
    pub fn has_waiters(&self) -> bool {
        self.inner.waiters.load(Ordering::Acquire) > 0
    }

    /// Acquires the lock, blocking the calling thread for at most the
    /// effective timeout (`timeout`, or the configured one when `None`).
    ///
    /// Never blocks when the effective timeout is zero. Check
    /// `LockToken::success` for the outcome.
    pub fn try_acquire_sync(&self, timeout: Option<Duration>) -> LockToken {
        if let Some(generation) = self.inner.try_grab() {
            return LockToken::acquired(Arc::clone(&self.inner), generation);
        }
        let timeout = timeout.unwrap_or(self.inner.timeout);
        if timeout.is_zero() {
            return LockToken::unacquired();
        }

        let deadline = Instant::now() + timeout;
        let (slot, generation) = self.inner.checkout_slot();
        if let Some(held) = self.inner.register(&slot, generation) {
            self.inner.recycle(slot);
            return LockToken::acquired(Arc::clone(&self.inner), held);
        }

        let token = match slot.wait_until(generation, deadline) {
            LockOutcome::Success => LockToken::acquired(Arc::clone(&self.inner), slot.granted()),
            outcome => {
                self.inner.unregister(&slot, generation);
                debug!(
                    ?outcome,
                    waited_ms = timeout.as_millis() as u64,
                    "blocking lock wait failed"
                );
                LockToken::unacquired()
            }
        };
        self.inner.recycle(slot);
        token
    }

    /// Acquires the lock without blocking a thread.
    ///
    /// The returned awaitable is already completed when the lock was free, the
    /// timeout is zero, or `cancel` is already canceled; otherwise a deadline
    /// watcher is spawned on the current Tokio runtime. Outside a runtime a
    /// contended acquire completes immediately as timed out.
    pub fn try_acquire_async(&self, cancel: Option<&CancellationToken>) -> AwaitableLockToken {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return AwaitableLockToken::completed(LockOutcome::Canceled, LockToken::unacquired());
        }
        if let Some(generation) = self.inner.try_grab() {
            return AwaitableLockToken::completed(
                LockOutcome::Success,
                LockToken::acquired(Arc::clone(&self.inner), generation),
            );
        }
        let timeout = self.inner.timeout;
        if timeout.is_zero() {
            return AwaitableLockToken::completed(LockOutcome::Timeout, LockToken::unacquired());
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("contended async lock acquire outside a Tokio runtime");
                return AwaitableLockToken::completed(LockOutcome::Timeout, LockToken::unacquired());
            }
        };

        let (slot, generation) = self.inner.checkout_slot();
        if let Some(held) = self.inner.register(&slot, generation) {
            self.inner.recycle(slot);
            return AwaitableLockToken::completed(
                LockOutcome::Success,
                LockToken::acquired(Arc::clone(&self.inner), held),
            );
        }

        let watcher = runtime.spawn(watch_deadline(
            Arc::clone(&self.inner),
            Arc::clone(&slot),
            generation,
            timeout,
            cancel.cloned(),
        ));
        AwaitableLockToken::pending(Arc::clone(&self.inner), slot, generation, watcher)
    }
}

/// Times out (or cancels) one pending async wait. Stale firings are no-ops.
async fn watch_deadline(
    mutex: Arc<MutexInner>,
    slot: Arc<WaiterSlot>,
    generation: u64,
    timeout: Duration,
    cancel: Option<CancellationToken>,
) {
    let outcome = match cancel {
        Some(signal) => tokio::select! {
            _ = tokio::time::sleep(timeout) => LockOutcome::Timeout,
            _ = signal.cancelled() => LockOutcome::Canceled,
        },
        None => {
            tokio::time::sleep(timeout).await;
            LockOutcome::Timeout
        }
    };
    if mutex.abandon(&slot, generation, outcome) {
        debug!(generation, ?outcome, "async lock wait abandoned");
    }
}

impl fmt::Debug for ExclusiveMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveMutex")
            .field("state", &LockState::from_bits(self.inner.state.load(Ordering::Relaxed)))
            .field("waiters", &self.inner.waiters.load(Ordering::Relaxed))
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}
