use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Outcome of acquiring a store lock.
///
/// `recovered` is set when the lock was poisoned by a panic in another task;
/// callers treat the guarded state as untrustworthy and reset it.
pub(crate) struct Acquired<G> {
    pub guard: G,
    pub recovered: bool,
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> Acquired<RwLockReadGuard<'a, T>> {
    match lock.read() {
        Ok(guard) => Acquired {
            guard,
            recovered: false,
        },
        Err(poisoned) => {
            report_poisoned(target, op, "rwlock.read");
            Acquired {
                guard: poisoned.into_inner(),
                recovered: true,
            }
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> Acquired<RwLockWriteGuard<'a, T>> {
    match lock.write() {
        Ok(guard) => Acquired {
            guard,
            recovered: false,
        },
        Err(poisoned) => {
            report_poisoned(target, op, "rwlock.write");
            lock.clear_poison();
            Acquired {
                guard: poisoned.into_inner(),
                recovered: true,
            }
        }
    }
}

fn report_poisoned(target: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        hint = "cached state dropped after panic in another task",
        "Recovered from poisoned cache lock"
    );
}
