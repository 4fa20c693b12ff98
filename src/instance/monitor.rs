//! Exit monitoring for a started engine process.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use super::ProcessSlot;

/// Watch generation `generation` of `slot` until it exits, is stopped, or is replaced.
pub(super) fn spawn(
    instance_id: String,
    slot: Arc<ProcessSlot>,
    generation: u64,
    interval: Duration,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("monitor-{instance_id}"))
        .spawn(move || {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| watch(&instance_id, &slot, generation, interval)));
            if outcome.is_err() {
                error!(instance_id = %instance_id, "monitor panicked; marking instance stopped");
                slot.running.store(false, Ordering::SeqCst);
            }
        })
}

fn watch(instance_id: &str, slot: &ProcessSlot, generation: u64, interval: Duration) {
    loop {
        thread::sleep(interval);

        if !slot.running.load(Ordering::SeqCst) {
            return;
        }
        let mut state = slot.state.lock();
        if state.generation != generation {
            return;
        }
        let Some(process) = state.process.as_mut() else {
            return;
        };

        match process.try_wait() {
            Ok(None) => {}
            Ok(Some(exit)) => {
                let pid = process.id();
                let output = process.output();
                state.last_exit = Some(exit);
                slot.running.store(false, Ordering::SeqCst);
                drop(state);

                if exit.code == Some(0) {
                    info!(instance_id, pid, "engine exited cleanly");
                } else {
                    warn!(instance_id, pid, exit = %exit, "engine exited unexpectedly");
                }
                for line in &output.stdout {
                    info!(instance_id, stream = "stdout", "{line}");
                }
                for line in &output.stderr {
                    warn!(instance_id, stream = "stderr", "{line}");
                }
                return;
            }
            Err(e) => {
                slot.running.store(false, Ordering::SeqCst);
                drop(state);
                error!(instance_id, error = %e, "cannot poll engine process; marking instance stopped");
                return;
            }
        }
    }
}
