//! # Lock State Word
//!
//! A `u64` packing a generation counter (upper 62 bits) and a 2-bit outcome
//! (lower bits). Words are plain values; all mutation happens through CAS on an
//! `AtomicU64` that stores `LockState::bits()`.
//!
//! ```text
//! 63                                   2 1   0
//! +-------------------------------------+-----+
//! |             generation              | out |
//! +-------------------------------------+-----+
//! ```

use std::fmt;

const OUTCOME_BITS: u32 = 2;
const OUTCOME_MASK: u64 = (1 << OUTCOME_BITS) - 1;

/// Disposition of one generation of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOutcome {
    /// The wait ended without the resource.
    Timeout = 0,
    /// Freshly issued; still contending.
    Pending = 1,
    /// The resource was granted.
    Success = 2,
    /// The waiter gave up via cancellation.
    Canceled = 3,
}

impl LockOutcome {
    fn from_bits(bits: u64) -> Self {
        match bits & OUTCOME_MASK {
            0 => LockOutcome::Timeout,
            1 => LockOutcome::Pending,
            2 => LockOutcome::Success,
            _ => LockOutcome::Canceled,
        }
    }
}

/// Packed generation + outcome.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockState(u64);

impl LockState {
    /// Generation zero, no holder.
    pub const INITIAL: LockState = LockState(LockOutcome::Timeout as u64);

    pub const fn from_bits(bits: u64) -> Self {
        LockState(bits)
    }

    pub const fn new(generation: u64, outcome: LockOutcome) -> Self {
        LockState((generation << OUTCOME_BITS) | outcome as u64)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn generation(self) -> u64 {
        self.0 >> OUTCOME_BITS
    }

    #[inline]
    pub fn outcome(self) -> LockOutcome {
        LockOutcome::from_bits(self.0)
    }

    /// Same generation, different outcome.
    #[inline]
    pub fn with_outcome(self, outcome: LockOutcome) -> Self {
        LockState((self.0 & !OUTCOME_MASK) | outcome as u64)
    }

    /// Next generation in the freshly issued (`Pending`) state, whatever the
    /// current outcome. Wraps after 2^62 attempts.
    #[inline]
    pub fn next_generation(self) -> Self {
        let generation = self.generation().wrapping_add(1) & (u64::MAX >> OUTCOME_BITS);
        LockState::new(generation, LockOutcome::Pending)
    }
}

impl fmt::Debug for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockState")
            .field("generation", &self.generation())
            .field("outcome", &self.outcome())
            .finish()
    }
}
