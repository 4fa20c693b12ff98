use anyhow::Result;
use simfleet::{app, cli, logging};

fn main() -> Result<()> {
    let invocation = cli::parse()?;
    logging::init(invocation.verbosity);
    let exit_code = app::run(invocation)?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
