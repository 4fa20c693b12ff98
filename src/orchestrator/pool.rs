//! Bounded fan-out for bulk instance operations.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use parking_lot::Mutex;
use tracing::{error, warn};

/// Run `task` for every item on at most `workers` threads and collect the
/// outcome per id. A panicking task counts as `false` for its id only.
///
/// Returns once every task has returned.
pub(crate) fn fan_out<T, F>(workers: usize, items: Vec<(String, T)>, task: F) -> HashMap<String, bool>
where
    T: Send,
    F: Fn(&T) -> bool + Sync,
{
    let total = items.len();
    if total == 0 {
        return HashMap::new();
    }

    let queue = Mutex::new(items.into_iter());
    let results = Mutex::new(HashMap::with_capacity(total));
    let drain = || {
        loop {
            let Some((id, item)) = queue.lock().next() else {
                break;
            };
            let ok = panic::catch_unwind(AssertUnwindSafe(|| task(&item))).unwrap_or_else(|_| {
                error!(instance_id = %id, "bulk task panicked");
                false
            });
            results.lock().insert(id, ok);
        }
    };

    thread::scope(|scope| {
        for n in 0..workers.clamp(1, total) {
            if let Err(e) = thread::Builder::new()
                .name(format!("fleet-worker-{n}"))
                .spawn_scoped(scope, drain)
            {
                warn!(worker = n, error = %e, "cannot spawn worker; continuing with fewer");
            }
        }
    });

    // Only reached with work left if no worker could be spawned.
    drain();
    results.into_inner()
}
