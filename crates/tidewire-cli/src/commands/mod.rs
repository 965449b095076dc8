mod serve;
mod simulate;
mod tail;
mod validate;

use std::process::ExitCode;
use std::time::Duration;

use tidewire_core::{Backoff, ClientConfig, StreamOutcome};

use crate::cli::{ClientArgs, Cli, Command};
use crate::error::CliError;

pub async fn run(cli: &Cli) -> Result<ExitCode, CliError> {
    match &cli.command {
        Command::Serve(args) => serve::run(args).await,
        Command::Tail(args) => tail::run(args).await,
        Command::Simulate(args) => simulate::run(args, cli.pretty).await,
        Command::Validate(args) => validate::run(args, cli.pretty),
    }
}

fn client_config(args: &ClientArgs) -> Result<ClientConfig, CliError> {
    let backoff = Backoff::new(
        Duration::from_millis(args.base_delay_ms),
        Duration::from_millis(args.max_delay_ms),
    );
    let config = ClientConfig::default()
        .with_backoff(backoff)
        .with_stall_window(
            Duration::from_millis(args.stall_window_ms),
            Duration::from_millis(args.stall_check_ms),
        )
        .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms));
    config.validate()?;
    Ok(config)
}

/// Exit status for how a followed stream ended.
fn outcome_result(outcome: &StreamOutcome) -> Result<(), CliError> {
    match outcome {
        StreamOutcome::Completed(_) => Ok(()),
        StreamOutcome::Failed(failure) => Err(CliError::StreamFailed(failure.clone())),
        StreamOutcome::Abandoned => Err(CliError::Abandoned),
    }
}
