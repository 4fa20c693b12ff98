//! Orchestrator
//!
//! Registry of named instances, bulk lifecycle operations, and the background
//! data-collection loop.
//!
//! The registry lock only guards bookkeeping. Spawning, signalling and
//! waiting on processes always happen after it is released, so a slow stop
//! never blocks unrelated registry reads.

mod collector;
mod pool;

pub use collector::{CollectionReport, CollectionSummary, ERROR_BACKOFF, InstanceReport, summarize};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::CreateError;
use crate::instance::{
    Instance, InstanceConfig, InstanceFlags, InstanceStatus, LaunchSettings, Launcher,
    ProcessLauncher, RESTART_PAUSE, StartOutcome,
};
use collector::CollectionLoop;

/// How long `stop_data_collection` waits for the in-flight cycle to notice.
pub const COLLECTION_STOP_GRACE: Duration = Duration::from_secs(1);

/// Per-instance settings layered over the orchestrator defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceOverrides {
    pub tick_interval: Option<f64>,
    pub snapshot_period: Option<u32>,
    pub data_dir: Option<PathBuf>,
    pub flags: InstanceFlags,
}

impl InstanceOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick_interval(mut self, seconds: f64) -> Self {
        self.tick_interval = Some(seconds);
        self
    }

    pub fn snapshot_period(mut self, ticks: u32) -> Self {
        self.snapshot_period = Some(ticks);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn dev_mode(mut self) -> Self {
        self.flags.dev_mode = true;
        self
    }

    pub fn profiling(mut self) -> Self {
        self.flags.profiling = true;
        self
    }

    pub fn disable(mut self, subsystem: impl Into<String>) -> Self {
        self.flags.disabled_subsystems.push(subsystem.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub total_created: u64,
    /// Incrementally maintained; see [`ComparisonStats::live_active`] for the recount.
    pub active_count: usize,
    pub failed_starts: u64,
    pub collection_cycles: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonStats {
    #[serde(flatten)]
    pub counters: FleetStats,
    /// Instances that are running and alive right now.
    pub live_active: usize,
    pub total_instances: usize,
    pub is_collecting: bool,
    pub config: OrchestratorConfig,
}

#[derive(Default)]
struct Registry {
    instances: HashMap<String, Arc<Instance>>,
    stats: FleetStats,
}

/// State shared with the collection thread.
struct Fleet {
    config: OrchestratorConfig,
    settings: LaunchSettings,
    registry: Mutex<Registry>,
}

impl Fleet {
    fn instances(&self) -> Vec<Arc<Instance>> {
        self.registry.lock().instances.values().cloned().collect()
    }

    /// Counts a spawned engine as active and a failed launch as a failed start.
    /// A start refused because the engine is still up counts as neither.
    fn record_start(&self, outcome: &crate::Result<StartOutcome>) -> bool {
        let mut registry = self.registry.lock();
        match outcome {
            Ok(StartOutcome::Started) => {
                registry.stats.active_count += 1;
                true
            }
            Ok(StartOutcome::AlreadyRunning) => false,
            Err(_) => {
                registry.stats.failed_starts += 1;
                false
            }
        }
    }

    fn record_stop(&self, was_running: bool, ok: bool) {
        if ok && was_running {
            let mut registry = self.registry.lock();
            registry.stats.active_count = registry.stats.active_count.saturating_sub(1);
        }
    }

    fn collect_snapshot(&self) -> CollectionReport {
        let instances: BTreeMap<String, InstanceReport> = self
            .instances()
            .into_iter()
            .filter(|instance| instance.is_running() && instance.is_alive())
            .map(|instance| {
                let report = InstanceReport::read(&instance, self.config.collection_log_limit);
                if let Some(error) = &report.error {
                    warn!(instance_id = instance.id(), error = %error, "partial data collected");
                }
                (instance.id().to_string(), report)
            })
            .collect();
        let summary = collector::summarize(&instances);

        self.registry.lock().stats.collection_cycles += 1;
        CollectionReport {
            timestamp: Utc::now(),
            instances,
            summary,
        }
    }
}

pub struct Orchestrator {
    fleet: Arc<Fleet>,
    collection: Mutex<Option<CollectionLoop>>,
}

impl Orchestrator {
    /// An orchestrator spawning real engine processes.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_launcher(config, Arc::new(ProcessLauncher::new()))
    }

    pub fn with_launcher(config: OrchestratorConfig, launcher: Arc<dyn Launcher>) -> Self {
        let settings = LaunchSettings {
            launcher,
            program: config.engine_program.clone(),
            base_args: config.engine_args.clone(),
            monitor_interval: config.monitor_interval,
            stop_timeout: config.stop_timeout,
        };
        Self {
            fleet: Arc::new(Fleet {
                config,
                settings,
                registry: Mutex::new(Registry::default()),
            }),
            collection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.fleet.config
    }

    /// Register a new, not yet started instance.
    pub fn create_instance(
        &self,
        instance_id: &str,
        overrides: InstanceOverrides,
    ) -> Result<Arc<Instance>, CreateError> {
        validate_id(instance_id)?;
        let config = &self.fleet.config;

        let mut registry = self.fleet.registry.lock();
        if registry.instances.contains_key(instance_id) {
            return Err(CreateError::AlreadyExists(instance_id.to_string()));
        }
        if registry.instances.len() >= config.max_instances {
            return Err(CreateError::LimitReached {
                max: config.max_instances,
            });
        }
        let port = next_free_port(&registry, config.port_range_start)?;

        let instance_config = InstanceConfig {
            instance_id: instance_id.to_string(),
            tick_interval: overrides.tick_interval.unwrap_or(config.default_tick_interval),
            snapshot_period: overrides
                .snapshot_period
                .unwrap_or(config.default_snapshot_period),
            port,
            data_dir: overrides
                .data_dir
                .unwrap_or_else(|| config.base_data_dir.join(instance_id)),
            flags: overrides.flags,
        };
        let instance = Arc::new(Instance::new(instance_config, self.fleet.settings.clone()));
        registry
            .instances
            .insert(instance_id.to_string(), Arc::clone(&instance));
        registry.stats.total_created += 1;

        info!(instance_id, port, data_dir = %instance.data_dir().display(), "instance created");
        Ok(instance)
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.fleet.registry.lock().instances.get(instance_id).cloned()
    }

    fn lookup(&self, instance_id: &str) -> Option<Arc<Instance>> {
        let instance = self.get_instance(instance_id);
        if instance.is_none() {
            warn!(instance_id, "unknown instance");
        }
        instance
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.fleet.registry.lock().instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.fleet.registry.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start_instance(&self, instance_id: &str) -> bool {
        let Some(instance) = self.lookup(instance_id) else {
            return false;
        };
        self.fleet.record_start(&instance.try_start())
    }

    pub fn stop_instance(&self, instance_id: &str, timeout: Duration) -> bool {
        let Some(instance) = self.lookup(instance_id) else {
            return false;
        };
        let was_running = instance.is_running();
        let ok = instance.stop(timeout);
        self.fleet.record_stop(was_running, ok);
        ok
    }

    /// Stop, pause, start. A failed stop aborts without attempting the start.
    pub fn restart_instance(&self, instance_id: &str) -> bool {
        let Some(instance) = self.lookup(instance_id) else {
            return false;
        };
        let was_running = instance.is_running();
        let stopped = instance.stop(self.fleet.config.stop_timeout);
        self.fleet.record_stop(was_running, stopped);
        if !stopped {
            warn!(instance_id, "restart aborted: stop failed");
            return false;
        }
        thread::sleep(RESTART_PAUSE);
        self.fleet.record_start(&instance.try_start())
    }

    /// Stop the instance and delete it from the registry.
    ///
    /// Returns false for unknown ids, or if the engine could not be stopped.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let Some(instance) = self.lookup(instance_id) else {
            return false;
        };
        let was_running = instance.is_running();
        let stopped = instance.stop(self.fleet.config.stop_timeout);
        self.fleet.record_stop(was_running, stopped);
        if !stopped {
            return false;
        }

        let mut registry = self.fleet.registry.lock();
        let same = registry
            .instances
            .get(instance_id)
            .is_some_and(|current| Arc::ptr_eq(current, &instance));
        if same {
            registry.instances.remove(instance_id);
            info!(instance_id, "instance removed");
        }
        same
    }

    pub fn get_instance_status(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.get_instance(instance_id).map(|instance| instance.status())
    }

    pub fn get_all_instances_status(&self) -> BTreeMap<String, InstanceStatus> {
        self.fleet
            .instances()
            .into_iter()
            .map(|instance| (instance.id().to_string(), instance.status()))
            .collect()
    }

    /// Start every instance concurrently. One result per id.
    pub fn start_all(&self) -> HashMap<String, bool> {
        let fleet = &self.fleet;
        let items = self.keyed_instances();
        pool::fan_out(fleet.config.max_instances, items, |instance| {
            fleet.record_start(&instance.try_start())
        })
    }

    /// Stop every instance concurrently. One result per id.
    pub fn stop_all(&self, timeout: Duration) -> HashMap<String, bool> {
        let fleet = &self.fleet;
        let items = self.keyed_instances();
        pool::fan_out(fleet.config.max_instances, items, |instance| {
            let was_running = instance.is_running();
            let ok = instance.stop(timeout);
            fleet.record_stop(was_running, ok);
            ok
        })
    }

    fn keyed_instances(&self) -> Vec<(String, Arc<Instance>)> {
        self.fleet
            .instances()
            .into_iter()
            .map(|instance| (instance.id().to_string(), instance))
            .collect()
    }

    /// Status, latest snapshot and recent logs of every live instance, plus a summary.
    pub fn collect_snapshot(&self) -> CollectionReport {
        self.fleet.collect_snapshot()
    }

    /// Start the background loop. Returns false (and does nothing) if it is already running.
    pub fn start_data_collection<F>(&self, callback: F) -> bool
    where
        F: Fn(&CollectionReport) + Send + 'static,
    {
        let mut collection = self.collection.lock();
        if collection.is_some() {
            warn!("data collection already running");
            return false;
        }

        let fleet = Arc::clone(&self.fleet);
        match CollectionLoop::spawn(
            self.fleet.config.data_collection_interval,
            move || fleet.collect_snapshot(),
            callback,
        ) {
            Ok(handle) => {
                *collection = Some(handle);
                true
            }
            Err(e) => {
                warn!(error = %e, "cannot start data collection thread");
                false
            }
        }
    }

    pub fn stop_data_collection(&self) {
        let Some(handle) = self.collection.lock().take() else {
            return;
        };
        if !handle.cancel(COLLECTION_STOP_GRACE) {
            warn!("collection cycle still in flight; it will exit without reporting");
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collection.lock().is_some()
    }

    /// Remove instances that are neither running nor alive. With `force`, stop
    /// every other instance first and remove it too.
    ///
    /// Returns, per considered id, whether it was removed.
    pub fn cleanup_instances(&self, force: bool) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        if force {
            for instance in self.fleet.instances() {
                if !instance.is_running() && !instance.is_alive() {
                    continue;
                }
                let was_running = instance.is_running();
                let stopped = instance.stop(self.fleet.config.stop_timeout);
                self.fleet.record_stop(was_running, stopped);
                if !stopped {
                    results.insert(instance.id().to_string(), false);
                }
            }
        }

        let mut registry = self.fleet.registry.lock();
        let idle: Vec<String> = registry
            .instances
            .iter()
            .filter(|(_, instance)| instance.is_idle())
            .map(|(id, _)| id.clone())
            .collect();
        for id in idle {
            registry.instances.remove(&id);
            results.insert(id, true);
        }
        drop(registry);

        let removed = results.values().filter(|removed| **removed).count();
        if removed > 0 {
            info!(removed, force, "instances cleaned up");
        }
        results
    }

    pub fn get_comparison_stats(&self) -> ComparisonStats {
        let instances = self.fleet.instances();
        let live_active = instances
            .iter()
            .filter(|instance| instance.is_running() && instance.is_alive())
            .count();
        let counters = self.fleet.registry.lock().stats;
        ComparisonStats {
            counters,
            live_active,
            total_instances: instances.len(),
            is_collecting: self.is_collecting(),
            config: self.fleet.config.clone(),
        }
    }

    /// Stop data collection and every instance.
    pub fn shutdown(&self) -> HashMap<String, bool> {
        self.stop_data_collection();
        self.stop_all(self.fleet.config.stop_timeout)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_data_collection();
        let any_live = self
            .fleet
            .instances()
            .iter()
            .any(|instance| instance.is_running() || instance.is_alive());
        if any_live {
            warn!("orchestrator dropped with live instances; stopping them");
            self.stop_all(self.fleet.config.stop_timeout);
        }
    }
}

/// Ids name a data directory, so they must be a single plain path component.
fn validate_id(instance_id: &str) -> Result<(), CreateError> {
    let valid = !instance_id.is_empty()
        && instance_id != "."
        && instance_id != ".."
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CreateError::InvalidId(instance_id.to_string()))
    }
}

/// Lowest port at or above `start` not held by a registered instance.
fn next_free_port(registry: &Registry, start: u16) -> Result<u16, CreateError> {
    let used: HashSet<u16> = registry
        .instances
        .values()
        .map(|instance| instance.config().port)
        .collect();
    (start..=u16::MAX)
        .find(|port| !used.contains(port))
        .ok_or(CreateError::PortsExhausted { start })
}
