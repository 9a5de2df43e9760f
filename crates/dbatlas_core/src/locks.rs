use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Guarded state is plain data; a poisoned lock is recovered, not propagated.

pub(crate) fn read_or_recover<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison_err) => {
            log::warn!("{} RwLock poisoned, recovering...", what);
            poison_err.into_inner()
        }
    }
}

pub(crate) fn write_or_recover<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison_err) => {
            log::warn!("{} RwLock poisoned, recovering...", what);
            poison_err.into_inner()
        }
    }
}

pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_err) => {
            log::warn!("{} Mutex poisoned, recovering...", what);
            poison_err.into_inner()
        }
    }
}
