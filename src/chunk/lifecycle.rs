//! Chunk lifecycle
//!
//! A chunk is `Active` or destructing (disposed, or marked for deletion) and
//! carries a count of outstanding reader locks. Both live in one atomic word.
//! Destruction runs exactly once, on the transition to zero locks while
//! destructing, and completion is announced through a one-shot latch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

const LOCK_MASK: u64 = 0xFFFF_FFFF;
const DESTRUCTING: u64 = 1 << 32;
const DELETE_FILE: u64 = 1 << 33;
const DESTROY_CLAIMED: u64 = 1 << 34;

/// What the caller must do after requesting destruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestructAction {
    /// Readers still hold locks; the last release destroys
    Deferred,
    /// No locks were held; destroy now
    Destroy,
    /// Destruction already ran without deleting; the file must be removed now
    DeleteOnly,
}

/// One-shot completion signal
#[derive(Default)]
pub(crate) struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn set(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.done.lock()
    }

    /// Wait until set, returning false on timeout
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if *done {
            return true;
        }
        let _ = self.cond.wait_while_for(&mut done, |done| !*done, timeout);
        *done
    }
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    state: AtomicU64,
    destroyed: Latch,
}

impl Lifecycle {
    /// Take a reader lock, failing once destruction has begun
    pub(crate) fn try_lock(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & DESTRUCTING != 0 {
                return Err(Error::FileBeingDeleted);
            }
            if current & LOCK_MASK == LOCK_MASK {
                return Err(Error::InvariantViolation("chunk lock count overflow".into()));
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reader lock. Returns true when the caller must destroy.
    pub(crate) fn unlock(&self) -> bool {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & LOCK_MASK > 0, "unbalanced chunk unlock");
        previous & LOCK_MASK == 1 && previous & DESTRUCTING != 0 && self.claim_destroy()
    }

    /// Stop handing out locks, optionally scheduling the file for deletion
    pub(crate) fn begin_destruct(&self, delete_file: bool) -> DestructAction {
        let bits = DESTRUCTING | if delete_file { DELETE_FILE } else { 0 };
        let previous = self.state.fetch_or(bits, Ordering::AcqRel);

        if previous & DESTROY_CLAIMED != 0 {
            if delete_file && previous & DELETE_FILE == 0 && self.destroyed.is_set() {
                return DestructAction::DeleteOnly;
            }
            return DestructAction::Deferred;
        }

        if previous & LOCK_MASK == 0 && self.claim_destroy() {
            DestructAction::Destroy
        } else {
            DestructAction::Deferred
        }
    }

    fn claim_destroy(&self) -> bool {
        let previous = self.state.fetch_or(DESTROY_CLAIMED, Ordering::AcqRel);
        previous & DESTROY_CLAIMED == 0
    }

    /// Announce that destruction ran. Returns true when a deletion request
    /// arrived after the destroy decided not to delete the file.
    pub(crate) fn finish_destroy(&self, deleted: bool) -> bool {
        self.destroyed.set();
        !deleted && self.is_marked_for_deletion()
    }

    pub(crate) fn is_destructing(&self) -> bool {
        self.state.load(Ordering::Acquire) & DESTRUCTING != 0
    }

    pub(crate) fn is_marked_for_deletion(&self) -> bool {
        self.state.load(Ordering::Acquire) & DELETE_FILE != 0
    }

    pub(crate) fn lock_count(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & LOCK_MASK) as u32
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.is_set()
    }

    pub(crate) fn wait_for_destroy(&self, timeout: Duration) -> bool {
        self.destroyed.wait(timeout)
    }
}
