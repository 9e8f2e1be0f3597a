use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the guard if a panicking holder poisoned it.
///
/// The pending-reply table must stay usable after a panic elsewhere, otherwise
/// every in-flight command would hang until its timeout.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
                target: "nightjar.cdp",
                context,
                file = loc.file(),
                line = loc.line(),
                column = loc.column(),
                error = %err,
                "mutex poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}
