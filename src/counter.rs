//! Active-process accounting for the execution service.
//!
//! A single shared gauge counts in-flight supervisions. The supervisor
//! increments before any child I/O and holds a guard whose Drop decrements,
//! so every exit path (success, error, panic unwind) balances the count.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic gauge of in-flight child supervisions.
///
/// Cheap to clone; all clones share the same underlying count.
#[derive(Clone, Default)]
pub struct ActiveProcessCounter {
    count: Arc<AtomicI64>,
}

impl ActiveProcessCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the gauge and return a guard that decrements on drop.
    pub fn acquire(&self) -> ActiveProcessGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveProcessGuard {
            counter: self.clone(),
        }
    }

    /// Current number of in-flight supervisions.
    pub fn current(&self) -> u64 {
        // The invariant keeps this non-negative; clamp defensively anyway so
        // a stray decrement can never surface as a huge unsigned number.
        self.count.load(Ordering::SeqCst).max(0) as u64
    }

    fn decrement(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            // Unpaired decrement — restore and flag it rather than underflow.
            self.count.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                count = prev,
                "active-process counter decrement without matching increment, clamping at zero"
            );
        }
    }
}

/// Guard returned by [`ActiveProcessCounter::acquire`].
pub struct ActiveProcessGuard {
    counter: ActiveProcessCounter,
}

impl Drop for ActiveProcessGuard {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
