use std::sync::{Mutex, MutexGuard};

/// Poisoning only means another thread panicked mid-append; the logs it guards are
/// append-only, so the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
