//! Instances
//!
//! One supervised engine process: its configuration, its process handle and
//! its lifecycle flags.

mod monitor;
pub mod output;
pub mod process;

pub use process::{
    CapturedOutput, ChildProcess, CommandSpec, EngineProcess, ExitInfo, Launcher, ProcessLauncher,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub const ENV_INSTANCE_ID: &str = "SIMFLEET_INSTANCE_ID";
pub const ENV_DATA_DIR: &str = "SIMFLEET_DATA_DIR";
pub const ENV_PORT: &str = "SIMFLEET_PORT";

/// Wait after a forced kill before giving up on the process.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Pause between the stop and start halves of a restart.
pub const RESTART_PAUSE: Duration = Duration::from_millis(500);

const STOP_POLL: Duration = Duration::from_millis(50);

/// How long dropping a live instance waits to reap its killed engine.
const DROP_REAP_GRACE: Duration = Duration::from_millis(500);

/// Boolean switches forwarded to the engine as command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceFlags {
    pub dev_mode: bool,
    pub profiling: bool,
    /// Each entry becomes `--no-<name>`.
    pub disabled_subsystems: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub tick_interval: f64,
    pub snapshot_period: u32,
    pub port: u16,
    pub data_dir: PathBuf,
    pub flags: InstanceFlags,
}

impl InstanceConfig {
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(output::SNAPSHOT_DIR)
    }

    pub fn structured_log_path(&self) -> PathBuf {
        self.data_dir.join(output::STRUCTURED_LOG_FILE)
    }

    /// Engine flags derived from this configuration.
    pub fn engine_args(&self) -> Vec<String> {
        let mut args = vec![
            "--tick-interval".to_string(),
            self.tick_interval.to_string(),
            "--snapshot-period".to_string(),
            self.snapshot_period.to_string(),
        ];
        if self.flags.dev_mode {
            args.push("--dev".to_string());
        }
        if self.flags.profiling {
            args.push("--profile".to_string());
        }
        args.extend(
            self.flags
                .disabled_subsystems
                .iter()
                .map(|name| format!("--no-{name}")),
        );
        args
    }

    pub fn engine_env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_INSTANCE_ID.to_string(), self.instance_id.clone()),
            (ENV_DATA_DIR.to_string(), self.data_dir.display().to_string()),
            (ENV_PORT.to_string(), self.port.to_string()),
        ]
    }
}

/// How instances launch and supervise their engine. Shared by every instance
/// of one orchestrator.
#[derive(Clone)]
pub struct LaunchSettings {
    pub launcher: Arc<dyn Launcher>,
    pub program: String,
    pub base_args: Vec<String>,
    pub monitor_interval: Duration,
    pub stop_timeout: Duration,
}

impl std::fmt::Debug for LaunchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSettings")
            .field("program", &self.program)
            .field("base_args", &self.base_args)
            .field("monitor_interval", &self.monitor_interval)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

/// Result of a start attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The previous engine is still running or alive; nothing was spawned.
    AlreadyRunning,
}

/// Point-in-time view of an instance for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub is_running: bool,
    pub is_alive: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub pid: Option<u32>,
    pub last_exit_code: Option<i32>,
    pub port: u16,
    pub data_dir: PathBuf,
    pub tick_interval: f64,
    pub snapshot_period: u32,
    pub dev_mode: bool,
    pub profiling: bool,
}

/// Process bookkeeping shared with the monitor thread.
pub(crate) struct ProcessSlot {
    state: Mutex<ProcessState>,
    /// True from a successful spawn until a clean stop or an observed exit.
    running: AtomicBool,
}

#[derive(Default)]
struct ProcessState {
    process: Option<Box<dyn EngineProcess>>,
    /// Bumped on every spawn so a monitor can tell its process was replaced.
    generation: u64,
    start_time: Option<DateTime<Utc>>,
    last_exit: Option<ExitInfo>,
}

pub struct Instance {
    config: InstanceConfig,
    settings: LaunchSettings,
    /// Serializes start/stop/restart on this instance.
    lifecycle: Mutex<()>,
    slot: Arc<ProcessSlot>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("config", &self.config)
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(config: InstanceConfig, settings: LaunchSettings) -> Self {
        Self {
            config,
            settings,
            lifecycle: Mutex::new(()),
            slot: Arc::new(ProcessSlot {
                state: Mutex::new(ProcessState::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.slot.running.load(Ordering::SeqCst)
    }

    /// True iff a process handle exists and the OS reports it has not exited. Never blocks
    /// on the process.
    pub fn is_alive(&self) -> bool {
        let mut state = self.slot.state.lock();
        process_alive(&mut state)
    }

    /// Neither running nor alive, with no start or stop in progress.
    pub fn is_idle(&self) -> bool {
        let Some(_lifecycle) = self.lifecycle.try_lock() else {
            return false;
        };
        !self.is_running() && !self.is_alive()
    }

    pub fn command_spec(&self) -> CommandSpec {
        let mut args = self.settings.base_args.clone();
        args.extend(self.config.engine_args());
        CommandSpec {
            instance_id: self.config.instance_id.clone(),
            program: self.settings.program.clone(),
            args,
            env: self.config.engine_env(),
        }
    }

    /// Spawn the engine. Returns false if already running or the spawn fails.
    pub fn start(&self) -> bool {
        matches!(self.try_start(), Ok(StartOutcome::Started))
    }

    /// Like [`Instance::start`], telling a refused start apart from a failed one.
    ///
    /// Failures are logged before they are returned.
    pub fn try_start(&self) -> Result<StartOutcome> {
        let _lifecycle = self.lifecycle.lock();
        let instance_id = self.id();

        if self.is_running() {
            warn!(instance_id, "instance already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        if self.is_alive() {
            warn!(instance_id, "previous engine process is still alive; stop it first");
            return Ok(StartOutcome::AlreadyRunning);
        }
        if let Err(err) = self.prepare_data_dir() {
            error!(instance_id, error = %err, "cannot prepare data directory");
            return Err(err);
        }

        let spec = self.command_spec();
        debug!(instance_id, program = %spec.program, args = ?spec.args, "spawning engine");
        let process = match self.settings.launcher.launch(&spec) {
            Ok(process) => process,
            Err(source) => {
                let err = Error::Spawn {
                    instance: instance_id.to_string(),
                    source,
                };
                error!(instance_id, error = %err, "engine failed to start");
                return Err(err);
            }
        };
        let pid = process.id();

        let generation = {
            let mut state = self.slot.state.lock();
            state.process = Some(process);
            state.generation += 1;
            state.start_time = Some(Utc::now());
            state.last_exit = None;
            self.slot.running.store(true, Ordering::SeqCst);
            state.generation
        };

        if let Err(e) = monitor::spawn(
            instance_id.to_string(),
            Arc::clone(&self.slot),
            generation,
            self.settings.monitor_interval,
        ) {
            warn!(instance_id, error = %e, "cannot start exit monitor; exits will only be seen on stop");
        }

        info!(instance_id, pid, port = self.config.port, "instance started");
        Ok(StartOutcome::Started)
    }

    /// Graceful termination, bounded wait, forced kill, bounded wait.
    ///
    /// Returns true once the process is confirmed gone, including when there
    /// was nothing to stop.
    pub fn stop(&self, timeout: Duration) -> bool {
        let _lifecycle = self.lifecycle.lock();
        let instance_id = self.id();

        let (pid, graceful) = {
            let mut state = self.slot.state.lock();
            let Some(process) = state.process.as_mut() else {
                self.slot.running.store(false, Ordering::SeqCst);
                return true;
            };
            if let Ok(Some(exit)) = process.try_wait() {
                state.last_exit = Some(exit);
                state.process = None;
                self.slot.running.store(false, Ordering::SeqCst);
                debug!(instance_id, exit = %exit, "engine already exited");
                return true;
            }

            let pid = process.id();
            info!(instance_id, pid, "requesting graceful shutdown");
            let graceful = match process.terminate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(instance_id, pid, error = %e, "graceful termination failed");
                    false
                }
            };
            (pid, graceful)
        };

        let mut exit = if graceful {
            self.wait_for_exit(timeout)
        } else {
            None
        };

        if exit.is_none() {
            warn!(instance_id, pid, timeout_secs = timeout.as_secs_f64(), "engine did not exit; killing");
            {
                let mut state = self.slot.state.lock();
                if let Some(process) = state.process.as_mut() {
                    if let Err(e) = process.kill() {
                        error!(instance_id, pid, error = %e, "kill failed");
                    }
                }
            }
            exit = self.wait_for_exit(KILL_GRACE);
        }

        match exit {
            Some(exit) => {
                let mut state = self.slot.state.lock();
                state.process = None;
                self.slot.running.store(false, Ordering::SeqCst);
                info!(instance_id, pid, exit = %exit, "instance stopped");
                true
            }
            None => {
                error!(instance_id, pid, "engine survived kill");
                false
            }
        }
    }

    /// `stop` then `start`. A failed stop aborts without attempting the start.
    pub fn restart(&self) -> bool {
        if !self.stop(self.settings.stop_timeout) {
            warn!(instance_id = self.id(), "restart aborted: stop failed");
            return false;
        }
        thread::sleep(RESTART_PAUSE);
        self.start()
    }

    fn wait_for_exit(&self, limit: Duration) -> Option<ExitInfo> {
        let deadline = Instant::now() + limit;
        loop {
            {
                let mut state = self.slot.state.lock();
                let polled = match state.process.as_mut() {
                    Some(process) => process.try_wait(),
                    None => return Some(ExitInfo { code: None, signal: None }),
                };
                match polled {
                    Ok(Some(exit)) => {
                        state.last_exit = Some(exit);
                        return Some(exit);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(instance_id = self.id(), error = %e, "exit poll failed"),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }

    fn prepare_data_dir(&self) -> Result<()> {
        let dir = self.config.snapshot_dir();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))
    }

    pub fn status(&self) -> InstanceStatus {
        let mut state = self.slot.state.lock();
        let is_alive = process_alive(&mut state);
        let is_running = self.is_running();
        let uptime_secs = match (is_running, state.start_time) {
            (true, Some(start)) => {
                (Utc::now() - start).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };
        InstanceStatus {
            instance_id: self.config.instance_id.clone(),
            is_running,
            is_alive,
            start_time: state.start_time,
            uptime_secs,
            pid: state.process.as_ref().map(|p| p.id()),
            last_exit_code: state.last_exit.and_then(|exit| exit.code),
            port: self.config.port,
            data_dir: self.config.data_dir.clone(),
            tick_interval: self.config.tick_interval,
            snapshot_period: self.config.snapshot_period,
            dev_mode: self.config.flags.dev_mode,
            profiling: self.config.flags.profiling,
        }
    }

    pub fn try_latest_snapshot(&self) -> Result<Option<Value>> {
        match output::latest_snapshot_path(&self.config.snapshot_dir())? {
            Some(path) => output::read_snapshot(&path).map(Some),
            None => Ok(None),
        }
    }

    /// The newest snapshot, or `None` when there is none or it cannot be read.
    pub fn latest_snapshot(&self) -> Option<Value> {
        self.try_latest_snapshot().unwrap_or_else(|err| {
            warn!(instance_id = self.id(), error = %err, "cannot read latest snapshot");
            None
        })
    }

    pub fn try_structured_logs(&self, limit: Option<usize>) -> Result<Vec<Value>> {
        output::read_structured_logs(&self.config.structured_log_path(), limit)
    }

    /// Up to `limit` most recent structured log entries (all when `None`).
    pub fn structured_logs(&self, limit: Option<usize>) -> Vec<Value> {
        self.try_structured_logs(limit).unwrap_or_else(|err| {
            warn!(instance_id = self.id(), error = %err, "cannot read structured logs");
            Vec::new()
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        let Some(process) = state.process.as_mut() else {
            return;
        };
        if !matches!(process.try_wait(), Ok(None)) {
            return;
        }
        warn!(instance_id = %self.config.instance_id, pid = process.id(), "instance dropped while alive; killing engine");
        let _ = process.kill();
        // Reap it so no zombie outlives the instance.
        let deadline = Instant::now() + DROP_REAP_GRACE;
        while matches!(process.try_wait(), Ok(None)) && Instant::now() < deadline {
            thread::sleep(STOP_POLL);
        }
    }
}

fn process_alive(state: &mut ProcessState) -> bool {
    state
        .process
        .as_mut()
        .is_some_and(|process| matches!(process.try_wait(), Ok(None)))
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeLauncher, config, settings};
    use super::*;
    use serde_json::json;

    fn fake_instance(dir: &Path) -> (Instance, Arc<FakeLauncher>) {
        let launcher = FakeLauncher::new();
        let instance = Instance::new(config("alpha", dir), settings(launcher.clone()));
        (instance, launcher)
    }

    fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn test_command_line_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("alpha", dir.path());
        cfg.flags = InstanceFlags {
            dev_mode: true,
            profiling: true,
            disabled_subsystems: vec!["llm".to_string()],
        };
        let instance = Instance::new(cfg, settings(FakeLauncher::new()));

        let spec = instance.command_spec();
        assert_eq!(spec.program, "simulation-engine");
        assert_eq!(
            spec.args,
            vec![
                "run",
                "--tick-interval",
                "0.5",
                "--snapshot-period",
                "5",
                "--dev",
                "--profile",
                "--no-llm"
            ]
        );
        assert!(spec.env.contains(&(ENV_INSTANCE_ID.to_string(), "alpha".to_string())));
        assert!(spec.env.contains(&(ENV_PORT.to_string(), "9000".to_string())));
    }

    #[test]
    fn test_new_instance_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, _) = fake_instance(dir.path());
        let status = instance.status();
        assert!(!status.is_running);
        assert!(!status.is_alive);
        assert_eq!(status.uptime_secs, 0.0);
        assert_eq!(status.pid, None);
    }

    #[test]
    fn test_start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());

        assert!(instance.start());
        assert!(instance.is_running());
        assert!(instance.is_alive());
        assert!(instance.config().snapshot_dir().is_dir());
        assert!(!instance.start(), "second start must be rejected");

        assert!(instance.stop(Duration::from_secs(1)));
        assert!(!instance.is_running());
        assert!(!instance.is_alive());
        let control = launcher.control("alpha").unwrap();
        assert_eq!(control.terminate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(control.kill_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());
        assert!(instance.stop(Duration::from_millis(10)));
        assert!(launcher.launches.lock().is_empty());
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());
        launcher.stubborn("alpha");
        assert!(instance.start());

        let started = Instant::now();
        assert!(instance.stop(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_millis(200) + KILL_GRACE);
        assert!(!instance.is_running());

        let control = launcher.control("alpha").unwrap();
        assert_eq!(control.kill_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_failure_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());
        launcher.fail_for("alpha");

        assert!(!instance.start());
        assert!(!instance.is_running());
        assert_eq!(instance.status().start_time, None);
    }

    #[test]
    fn test_monitor_observes_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());
        assert!(instance.start());

        launcher.control("alpha").unwrap().crash(7);
        assert!(wait_until(Duration::from_secs(2), || !instance.is_running()));

        let status = instance.status();
        assert!(!status.is_alive);
        assert_eq!(status.last_exit_code, Some(7));
        // Handle is kept for cleanup until an explicit stop.
        assert!(status.pid.is_some());
        assert!(instance.stop(Duration::from_millis(10)));
        assert_eq!(instance.status().pid, None);
    }

    #[test]
    fn test_restart_spawns_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());
        assert!(instance.start());
        let first_pid = instance.status().pid;

        assert!(instance.restart());
        assert!(instance.is_running());
        assert_ne!(instance.status().pid, first_pid);
        assert_eq!(launcher.launches.lock().len(), 2);
    }

    #[test]
    fn test_try_start_tells_refusal_from_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());

        assert_eq!(instance.try_start().unwrap(), StartOutcome::Started);
        assert_eq!(instance.try_start().unwrap(), StartOutcome::AlreadyRunning);
        assert!(instance.stop(Duration::from_secs(1)));

        launcher.fail_for("alpha");
        assert!(matches!(instance.try_start(), Err(Error::Spawn { .. })));
    }

    #[test]
    fn test_restart_aborts_when_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, launcher) = fake_instance(dir.path());
        assert!(instance.start());
        launcher.fail_for("alpha");

        assert!(!instance.restart());
        assert!(!instance.is_running());
        assert!(!instance.is_alive());
    }

    #[test]
    fn test_snapshot_and_log_reads_never_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (instance, _) = fake_instance(dir.path());
        assert_eq!(instance.latest_snapshot(), None);
        assert!(instance.structured_logs(Some(3)).is_empty());

        std::fs::create_dir_all(instance.config().snapshot_dir()).unwrap();
        std::fs::write(instance.config().snapshot_dir().join("snapshot_1.json"), "{broken").unwrap();
        assert_eq!(instance.latest_snapshot(), None);
        assert!(instance.try_latest_snapshot().is_err());

        std::fs::write(instance.config().snapshot_dir().join("snapshot_1.json"), r#"{"tick":1}"#).unwrap();
        assert_eq!(instance.latest_snapshot(), Some(json!({"tick": 1})));

        std::fs::write(
            instance.config().structured_log_path(),
            "{\"event\":\"a\"}\n{\"event\":\"b\"}\n{\"event\":",
        )
        .unwrap();
        assert_eq!(instance.structured_logs(Some(1)), vec![json!({"event": "b"})]);
        assert_eq!(instance.structured_logs(None).len(), 2);
    }

    #[cfg(unix)]
    mod real_process {
        use super::*;

        fn sh_instance(dir: &Path, script: &str) -> Instance {
            let settings = LaunchSettings {
                launcher: Arc::new(ProcessLauncher::new()),
                program: "sh".to_string(),
                base_args: vec!["-c".to_string(), script.to_string(), "engine".to_string()],
                monitor_interval: Duration::from_millis(50),
                stop_timeout: Duration::from_secs(2),
            };
            Instance::new(config("real", dir), settings)
        }

        #[test]
        fn test_graceful_stop_of_real_engine() {
            let dir = tempfile::tempdir().unwrap();
            let instance = sh_instance(dir.path(), "exec sleep 30");
            assert!(instance.start());
            thread::sleep(Duration::from_millis(100));
            assert!(instance.status().is_alive);

            let started = Instant::now();
            assert!(instance.stop(Duration::from_secs(2)));
            assert!(started.elapsed() <= Duration::from_millis(2500));
            assert!(!instance.is_alive());
        }

        #[test]
        fn test_engine_ignoring_sigterm_is_killed() {
            let dir = tempfile::tempdir().unwrap();
            let instance = sh_instance(dir.path(), "trap '' TERM; exec sleep 30");
            assert!(instance.start());
            thread::sleep(Duration::from_millis(100));

            let timeout = Duration::from_millis(300);
            let started = Instant::now();
            assert!(instance.stop(timeout));
            assert!(started.elapsed() <= timeout + KILL_GRACE);
            assert!(!instance.is_running());
            assert!(!instance.is_alive());
        }

        #[test]
        fn test_engine_sees_environment_overlay() {
            let dir = tempfile::tempdir().unwrap();
            let instance = sh_instance(
                dir.path(),
                "printf '{\"id\":\"%s\",\"port\":%s}\\n' \"$SIMFLEET_INSTANCE_ID\" \"$SIMFLEET_PORT\" > \"$SIMFLEET_DATA_DIR/events.jsonl\"",
            );
            assert!(instance.start());
            assert!(wait_until(Duration::from_secs(3), || !instance.is_running()));

            assert_eq!(
                instance.structured_logs(None),
                vec![json!({"id": "real", "port": 9000})]
            );
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn test_dropping_live_instance_reaps_engine() {
            let dir = tempfile::tempdir().unwrap();
            let instance = sh_instance(dir.path(), "exec sleep 30");
            assert!(instance.start());
            let pid = instance.status().pid.unwrap();
            let proc_entry = PathBuf::from(format!("/proc/{pid}"));
            assert!(proc_entry.exists());

            drop(instance);
            // A zombie keeps its /proc entry until it is reaped.
            assert!(!proc_entry.exists());
        }
    }
}
