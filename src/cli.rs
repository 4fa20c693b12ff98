use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use clap::{ArgAction, Parser, Subcommand, ValueHint, builder::NonEmptyStringValueParser};

/// Everything the binary needs from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub config_path: Option<PathBuf>,
    pub verbosity: u8,
    pub command: Command,
}

/// The top-level command requested by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunSpec),
    ShowConfig,
}

/// A fleet run: how many engines, for how long, with which flags.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub instances: usize,
    pub prefix: String,
    pub duration: Duration,
    pub collect: bool,
    pub dev_mode: bool,
    pub profiling: bool,
    pub disabled_subsystems: Vec<String>,
    /// Replaces the configured engine command when non-empty.
    pub engine_command: Vec<String>,
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Invocation> {
    from_cli(Cli::parse())
}

pub fn parse_from<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    from_cli(Cli::try_parse_from(args)?)
}

fn from_cli(cli: Cli) -> Result<Invocation> {
    let command = match cli.command {
        CliCommand::ShowConfig => Command::ShowConfig,
        CliCommand::Run {
            instances,
            prefix,
            duration,
            no_collect,
            dev,
            profile,
            disable,
            engine,
        } => {
            ensure!(instances > 0, "--instances must be at least 1");
            ensure!(
                duration.is_finite() && duration >= 0.0,
                "--duration must be a non-negative number of seconds"
            );
            Command::Run(RunSpec {
                instances,
                prefix,
                duration: Duration::from_secs_f64(duration),
                collect: !no_collect,
                dev_mode: dev,
                profiling: profile,
                disabled_subsystems: disable,
                engine_command: engine,
            })
        }
    };

    Ok(Invocation {
        config_path: cli.config,
        verbosity: cli.verbose,
        command,
    })
}

#[derive(Parser, Debug)]
#[command(
    name = "simfleet",
    version,
    about = "Run and supervise a fleet of simulation engine processes",
    disable_help_subcommand = true
)]
struct Cli {
    /// Read settings from this file instead of discovering simfleet.toml.
    #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace). RUST_LOG overrides this.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start a fleet, report on it, then shut it down.
    Run {
        /// Number of engine instances to start.
        #[arg(short = 'n', long, default_value_t = 1)]
        instances: usize,

        /// Instance ids are `<prefix>-<n>`.
        #[arg(long, default_value = "sim", value_parser = NonEmptyStringValueParser::new())]
        prefix: String,

        /// Seconds to keep the fleet running.
        #[arg(short, long, value_name = "SECS", default_value_t = 10.0)]
        duration: f64,

        /// Skip periodic data collection.
        #[arg(long = "no-collect", action = ArgAction::SetTrue)]
        no_collect: bool,

        /// Start engines in development mode.
        #[arg(long, action = ArgAction::SetTrue)]
        dev: bool,

        /// Start engines with profiling enabled.
        #[arg(long, action = ArgAction::SetTrue)]
        profile: bool,

        /// Engine subsystem to turn off; repeatable.
        #[arg(long, value_name = "SUBSYSTEM", value_parser = NonEmptyStringValueParser::new())]
        disable: Vec<String>,

        /// Engine command overriding the configured one.
        #[arg(value_name = "ENGINE", last = true)]
        engine: Vec<String>,
    },
    /// Print the effective configuration as TOML.
    ShowConfig,
}
