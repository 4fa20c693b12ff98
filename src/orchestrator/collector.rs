//! Data Collection
//!
//! Per-cycle reports over all live instances and the background loop that
//! produces them on a timer.

use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::instance::{Instance, InstanceStatus};

/// Pause after a failed cycle before trying again.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub timestamp: DateTime<Utc>,
    pub instances: BTreeMap<String, InstanceReport>,
    pub summary: CollectionSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub status: InstanceStatus,
    pub snapshot: Option<Value>,
    pub recent_logs: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstanceReport {
    /// Read everything observable about `instance`. Read failures land in `error`.
    pub fn read(instance: &Instance, log_limit: usize) -> Self {
        let mut errors = Vec::new();
        let snapshot = instance.try_latest_snapshot().unwrap_or_else(|e| {
            errors.push(e.to_string());
            None
        });
        let recent_logs = instance
            .try_structured_logs(Some(log_limit))
            .unwrap_or_else(|e| {
                errors.push(e.to_string());
                Vec::new()
            });
        Self {
            status: instance.status(),
            snapshot,
            recent_logs,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }
}

/// Aggregates over the instances of one cycle.
///
/// Everything but `live_instances` only counts instances that had a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub live_instances: usize,
    pub active_instances: usize,
    pub avg_uptime_secs: f64,
    /// Mean of each numeric entry of the snapshots' `vitals` object.
    pub avg_vitals: BTreeMap<String, f64>,
    pub total_ticks: u64,
}

pub fn summarize(instances: &BTreeMap<String, InstanceReport>) -> CollectionSummary {
    let mut summary = CollectionSummary {
        live_instances: instances.len(),
        ..Default::default()
    };
    let mut uptime = 0.0;
    let mut vitals: BTreeMap<String, (f64, usize)> = BTreeMap::new();

    for report in instances.values() {
        let Some(snapshot) = &report.snapshot else {
            continue;
        };
        summary.active_instances += 1;
        uptime += report.status.uptime_secs;
        summary.total_ticks += snapshot.get("tick").and_then(Value::as_u64).unwrap_or(0);

        if let Some(values) = snapshot.get("vitals").and_then(Value::as_object) {
            for (name, value) in values {
                if let Some(value) = value.as_f64() {
                    let (sum, count) = vitals.entry(name.clone()).or_default();
                    *sum += value;
                    *count += 1;
                }
            }
        }
    }

    if summary.active_instances > 0 {
        summary.avg_uptime_secs = uptime / summary.active_instances as f64;
    }
    summary.avg_vitals = vitals
        .into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect();
    summary
}

/// Handle to a running collection thread.
pub(crate) struct CollectionLoop {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl CollectionLoop {
    pub(crate) fn spawn<C, F>(interval: Duration, collect: C, callback: F) -> io::Result<Self>
    where
        C: Fn() -> CollectionReport + Send + 'static,
        F: Fn(&CollectionReport) + Send + 'static,
    {
        let (stop, signal) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("data-collection".to_string())
            .spawn(move || run(interval, &signal, collect, callback))?;
        Ok(Self { stop, handle })
    }

    /// Signal cancellation and give the in-flight cycle up to `grace` to notice.
    ///
    /// Returns whether the thread finished within `grace`; it is never killed.
    pub(crate) fn cancel(self, grace: Duration) -> bool {
        drop(self.stop);
        let deadline = Instant::now() + grace;
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
            true
        } else {
            false
        }
    }
}

fn cancelled(signal: &Receiver<()>) -> bool {
    !matches!(signal.try_recv(), Err(TryRecvError::Empty))
}

fn run<C, F>(interval: Duration, signal: &Receiver<()>, collect: C, callback: F)
where
    C: Fn() -> CollectionReport,
    F: Fn(&CollectionReport),
{
    info!(interval_secs = interval.as_secs_f64(), "data collection started");
    loop {
        if cancelled(signal) {
            break;
        }

        let cycle = panic::catch_unwind(AssertUnwindSafe(|| {
            let report = collect();
            debug!(live = report.summary.live_instances, "collection cycle complete");
            if !cancelled(signal) {
                callback(&report);
            }
        }));
        let pause = match cycle {
            Ok(()) => interval,
            Err(_) => {
                error!(backoff_secs = ERROR_BACKOFF.as_secs_f64(), "collection cycle failed");
                ERROR_BACKOFF
            }
        };

        if cancelled(signal) {
            break;
        }
        match signal.recv_timeout(pause) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("data collection stopped");
}
