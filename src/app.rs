use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::cli::{Command, Invocation, RunSpec};
use crate::config::OrchestratorConfig;
use crate::orchestrator::{CollectionReport, InstanceOverrides, Orchestrator};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

pub fn run(invocation: Invocation) -> Result<i32> {
    let config = OrchestratorConfig::load(invocation.config_path.as_deref())
        .context("failed to load configuration")?;

    match invocation.command {
        Command::ShowConfig => {
            print!("{}", config.to_toml());
            Ok(0)
        }
        Command::Run(spec) => run_fleet(config, spec),
    }
}

fn run_fleet(mut config: OrchestratorConfig, spec: RunSpec) -> Result<i32> {
    if let Some((program, args)) = spec.engine_command.split_first() {
        config.engine_program = program.clone();
        config.engine_args = args.to_vec();
    }
    if spec.instances > config.max_instances {
        warn!(
            requested = spec.instances,
            max = config.max_instances,
            "more instances requested than the fleet allows"
        );
    }

    let orchestrator = Orchestrator::new(config);
    let mut failures = 0usize;

    for n in 1..=spec.instances {
        let id = format!("{}-{n}", spec.prefix);
        if let Err(e) = orchestrator.create_instance(&id, overrides_for(&spec)) {
            error!(instance_id = %id, error = %e, "cannot create instance");
            failures += 1;
        }
    }

    let started = orchestrator.start_all();
    let failed_starts = started.values().filter(|ok| !**ok).count();
    failures += failed_starts;
    info!(started = started.len() - failed_starts, failed = failed_starts, "fleet started");

    if spec.collect && !orchestrator.start_data_collection(print_report) {
        warn!("data collection unavailable for this run");
    }

    wait_while_live(&orchestrator, spec.duration);

    let stopped = orchestrator.shutdown();
    let stuck = stopped.values().filter(|ok| !**ok).count();
    if stuck > 0 {
        error!(stuck, "some engines could not be stopped");
    }

    let stats = orchestrator.get_comparison_stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("failed to encode fleet stats")?
    );
    orchestrator.cleanup_instances(true);

    Ok(if failures > 0 || stuck > 0 { 1 } else { 0 })
}

fn overrides_for(spec: &RunSpec) -> InstanceOverrides {
    let mut overrides = InstanceOverrides::new();
    if spec.dev_mode {
        overrides = overrides.dev_mode();
    }
    if spec.profiling {
        overrides = overrides.profiling();
    }
    for subsystem in &spec.disabled_subsystems {
        overrides = overrides.disable(subsystem.as_str());
    }
    overrides
}

/// Sleep for `duration`, returning early once no engine is left alive.
fn wait_while_live(orchestrator: &Orchestrator, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        if orchestrator.get_comparison_stats().live_active == 0 {
            info!("no engine left running");
            return;
        }
        thread::sleep(LIVENESS_POLL.min(deadline - now));
    }
}

fn print_report(report: &CollectionReport) {
    let line = match serde_json::to_string(report) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "cannot encode collection report");
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{line}").and_then(|()| handle.flush()) {
        warn!(error = %e, "cannot write collection report");
    }
}
