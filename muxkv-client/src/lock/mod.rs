//! # Exclusive Write Lock
//!
//! Purpose: Decide, per physical connection, who may write next.
//!
//! ## Design Principles
//! 1. **One State Machine**: A single `AtomicU64` word (see `state`) carries
//!    generation + outcome; the blocking and the async surfaces are thin
//!    adapters over the same transitions.
//! 2. **Lock-Free Fast Path**: An uncontended acquire is one CAS with no
//!    allocation and no OS synchronization.
//! 3. **Generation Guards**: Release, timeout and cancellation race through
//!    CAS on the waiter's generation; exactly one wins, the rest are no-ops.
//!
//! ## Structure Overview
//!
//! ```text
//! ExclusiveMutex ── Arc<MutexInner>
//!   ├── state: AtomicU64          (LockState; Success = held)
//!   ├── waiters: AtomicUsize      (queued, undecided waiters)
//!   ├── queue: Mutex<VecDeque<QueuedWaiter>>
//!   └── slots: Mutex<Vec<Arc<WaiterSlot>>>   (recycled waiter slots)
//!         └── WaiterSlot { state, granted, signal: Mutex<Option<Waker>>, wakeup: Condvar }
//! ```

mod mutex;
mod state;
mod token;

pub use mutex::ExclusiveMutex;
pub use state::{LockOutcome, LockState};
pub use token::{AwaitableLockToken, LockCanceled, LockToken};
