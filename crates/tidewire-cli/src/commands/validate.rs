use std::process::ExitCode;

use tidewire_core::{validate_capture, CaptureSummary};

use crate::cli::ValidateArgs;
use crate::error::CliError;
use crate::output;

pub fn run(args: &ValidateArgs, pretty: bool) -> Result<ExitCode, CliError> {
    let summary = check_file(args)?;
    output::render_json(&summary, pretty)?;
    Ok(ExitCode::SUCCESS)
}

fn check_file(args: &ValidateArgs) -> Result<CaptureSummary, CliError> {
    let input = std::fs::read_to_string(&args.file)?;
    let summary = validate_capture(&input)?;
    tracing::info!(
        file = %args.file.display(),
        events = summary.events,
        terminal = ?summary.terminal,
        "capture validated"
    );
    Ok(summary)
}
