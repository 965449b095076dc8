use std::process::ExitCode;
use std::time::Duration;

use tidewire_core::{ConnectionState, HttpTransport, ResilientConnection, StreamId};

use crate::cli::TailArgs;
use crate::error::CliError;
use crate::output::ndjson::NdjsonSink;

pub async fn run(args: &TailArgs) -> Result<ExitCode, CliError> {
    let config = super::client_config(&args.client)?;
    let stream_id = StreamId::parse(&args.stream_id)?;
    let transport = HttpTransport::new(&args.url)
        .with_connect_timeout(Duration::from_millis(args.client.connect_timeout_ms));

    let mut connection = ResilientConnection::new(transport, config)?;
    if let Some(seed) = args.client.seed {
        connection = connection.with_seed(seed);
    }

    let mut sink = NdjsonSink::new(std::io::stdout());
    sink.start(&stream_id);
    let handle = connection.spawn(stream_id.clone(), sink);

    let mut states = handle.states();
    let watch_states = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Reconnecting | ConnectionState::Stalled => {
                    tracing::info!(state = ?state, "connection interrupted; resuming")
                }
                ConnectionState::Connected => tracing::info!("connected"),
                _ => {}
            }
            if state.is_final() {
                break;
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(stream_id = %stream_id, "interrupted; abandoning stream");
            handle.cancel();
        }
        _ = wait_final(&handle) => {}
    }

    let (report, sink) = handle
        .join()
        .await
        .map_err(|error| CliError::Command(format!("connection task failed: {error}")))?;
    watch_states.abort();
    sink.finish()?;

    tracing::info!(
        stream_id = %stream_id,
        delivered = report.delivered,
        reconnects = report.attempts.len(),
        duplicates_dropped = report.duplicates_dropped,
        "tail finished"
    );
    super::outcome_result(&report.outcome)?;
    Ok(ExitCode::SUCCESS)
}

async fn wait_final<S>(handle: &tidewire_core::ConnectionHandle<S>) {
    let mut states = handle.states();
    while !states.borrow_and_update().is_final() {
        if states.changed().await.is_err() {
            return;
        }
    }
}
