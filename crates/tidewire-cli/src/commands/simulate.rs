use std::process::ExitCode;
use std::time::Duration;

use serde::Serialize;
use tidewire_core::{
    CollectingSink, ConnectionAttempt, ConnectionFaults, Emitter, EmitterConfig, EmitterOutcome,
    MemoryTransport, ResilientConnection, ScriptedProducer, StreamId, StreamOutcome, StreamStore,
    Usage,
};

use crate::cli::SimulateArgs;
use crate::error::CliError;
use crate::output;

/// Result of one simulated run, printed as JSON.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub stream_id: StreamId,
    pub fragments: u64,
    pub delivered: u64,
    pub completion_rate: f64,
    /// Whether fragments arrived exactly in emission order.
    pub in_order: bool,
    pub duplicates_dropped: u64,
    pub liveness_seen: u64,
    pub malformed_blocks: u64,
    pub stalls: u64,
    pub connects: usize,
    pub attempts: Vec<ConnectionAttempt>,
    pub outcome: StreamOutcome,
    pub emitter: Option<EmitterOutcome>,
}

pub async fn run(args: &SimulateArgs, pretty: bool) -> Result<ExitCode, CliError> {
    let report = simulate(args).await?;
    output::render_json(&report, pretty)?;

    if report.completion_rate < 1.0 {
        return Ok(ExitCode::from(3));
    }
    Ok(ExitCode::SUCCESS)
}

fn fault_plan(args: &SimulateArgs) -> Vec<ConnectionFaults> {
    let mut faults = ConnectionFaults::clean();
    if let Some(events) = args.drop_after {
        faults = faults.disconnect_after(events);
    }
    if let Some(every) = args.discard_every.filter(|every| *every > 0) {
        faults = faults.discard((0..args.fragments).filter(|id| (id + 1) % every == 0));
    }
    if let Some(every) = args.duplicate_every {
        faults = faults.duplicate_every(every);
    }
    if args.swap {
        faults = faults.swap_adjacent();
    }
    if let Some(events) = args.hang_after {
        faults = faults.hang_after(events);
    }
    if let Some(size) = args.chunk_size {
        faults = faults.chunked(size);
    }

    let mut plan = vec![ConnectionFaults::refuse(); args.refuse];
    plan.extend(std::iter::repeat(faults).take(args.faulty_connections));
    plan
}

async fn simulate(args: &SimulateArgs) -> Result<SimulationReport, CliError> {
    let config = super::client_config(&args.client)?;
    let store = StreamStore::default();
    let stream_id = StreamId::generate();

    let mut producer = ScriptedProducer::numbered(args.fragments, Usage::new(16, args.fragments, 0.0));
    if args.fragment_interval_ms > 0 {
        producer = producer.with_pace(Duration::from_millis(args.fragment_interval_ms));
    }
    let emitter = Emitter::new(store.open(stream_id.clone())?, EmitterConfig::default());
    let emitting = emitter.spawn(producer);

    let transport = MemoryTransport::new(store).with_faults(fault_plan(args));
    let mut connection = ResilientConnection::new(transport.clone(), config)?;
    if let Some(seed) = args.client.seed {
        connection = connection.with_seed(seed);
    }

    tracing::info!(stream_id = %stream_id, fragments = args.fragments, "simulation started");
    let mut sink = CollectingSink::default();
    let report = connection.start(stream_id.clone(), &mut sink).await;

    let emitter_outcome = match emitting.await {
        Ok(Ok(summary)) => Some(summary.outcome),
        Ok(Err(error)) => return Err(error.into()),
        Err(error) => {
            tracing::warn!(error = %error, "emitter task did not finish");
            None
        }
    };

    let in_order = sink
        .payloads
        .iter()
        .enumerate()
        .all(|(index, payload)| payload["index"].as_u64() == Some(index as u64));

    Ok(SimulationReport {
        stream_id,
        fragments: args.fragments,
        delivered: report.delivered,
        completion_rate: report.completion_rate(args.fragments),
        in_order,
        duplicates_dropped: report.duplicates_dropped,
        liveness_seen: report.liveness_seen,
        malformed_blocks: report.malformed_blocks,
        stalls: report.stalls,
        connects: transport.connect_log().len(),
        attempts: report.attempts,
        outcome: report.outcome,
        emitter: emitter_outcome,
    })
}
