//! CLI argument definitions for tidewire.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `serve` | Serve scripted streams over HTTP with replay support |
//! | `tail` | Follow a stream resiliently and print NDJSON |
//! | `simulate` | Run an in-process stream through injected faults |
//! | `validate` | Check a captured wire file |
//!
//! # Examples
//!
//! ```bash
//! tidewire serve --addr 127.0.0.1:8080 --fragments 50
//! curl -s -X POST localhost:8080/streams
//! tidewire tail http://127.0.0.1:8080 --stream-id 3f2a...
//! tidewire simulate --fragments 100 --drop-after 30 --discard-every 7
//! tidewire validate capture.txt
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resumable streaming delivery: serve, tail, simulate and validate streams.
#[derive(Debug, Parser)]
#[command(name = "tidewire", author, version, about)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "info", "tidewire_core=debug").
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Pretty-print JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve streams over HTTP.
    ///
    /// POST /streams opens a stream fed by a scripted producer;
    /// GET /streams/{id}/events serves it, resuming after Last-Event-ID.
    Serve(ServeArgs),

    /// Follow a served stream, reconnecting through drops and stalls.
    ///
    /// Delivered fragments are written to stdout as NDJSON.
    Tail(TailArgs),

    /// Run a stream end to end over an in-memory transport with faults.
    Simulate(SimulateArgs),

    /// Validate a captured wire stream.
    Validate(ValidateArgs),
}

/// Arguments for the `serve` command.
#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Fragments produced per stream unless the request overrides it.
    #[arg(long, default_value_t = 20)]
    pub fragments: u64,

    /// Delay before each fragment, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub fragment_interval_ms: u64,

    /// Idle time before a liveness event is emitted.
    #[arg(long, default_value_t = 10_000)]
    pub liveness_ms: u64,

    /// Reconnect delay suggested to clients via the wire `retry` field.
    #[arg(long)]
    pub retry_ms: Option<u64>,

    /// Events retained per stream for replay.
    #[arg(long, default_value_t = 10_000)]
    pub max_events: usize,

    /// Seconds a finished stream stays replayable.
    #[arg(long, default_value_t = 60)]
    pub terminal_ttl_secs: u64,
}

/// Reconnect tunables shared by `tail` and `simulate`.
#[derive(Debug, Clone, Args)]
pub struct ClientArgs {
    #[arg(long, default_value_t = 1_000)]
    pub base_delay_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub max_delay_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub stall_window_ms: u64,

    #[arg(long, default_value_t = 1_000)]
    pub stall_check_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Seed for reconnect jitter.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the `tail` command.
#[derive(Debug, Args)]
pub struct TailArgs {
    /// Base URL of a `tidewire serve` instance.
    pub url: String,

    #[arg(long)]
    pub stream_id: String,

    #[command(flatten)]
    pub client: ClientArgs,
}

/// Arguments for the `simulate` command.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 100)]
    pub fragments: u64,

    /// Reset the faulty connection after this many events.
    #[arg(long)]
    pub drop_after: Option<usize>,

    /// Lose every n-th fragment in transit on the faulty connection.
    #[arg(long)]
    pub discard_every: Option<u64>,

    /// Send every n-th event twice on the faulty connection.
    #[arg(long)]
    pub duplicate_every: Option<usize>,

    /// Deliver events pairwise swapped on the faulty connection.
    #[arg(long, default_value_t = false)]
    pub swap: bool,

    /// Go silent after this many events (exercises stall detection).
    #[arg(long)]
    pub hang_after: Option<usize>,

    /// Refuse this many connect attempts before the faulty connection.
    #[arg(long, default_value_t = 0)]
    pub refuse: usize,

    /// Split wire output into chunks of this many bytes.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Number of consecutive connections the faults apply to.
    #[arg(long, default_value_t = 1)]
    pub faulty_connections: usize,

    /// Delay before each fragment, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub fragment_interval_ms: u64,

    #[command(flatten)]
    pub client: ClientArgs,
}

/// Arguments for the `validate` command.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// File containing raw wire output of one connection.
    pub file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_faults() {
        let cli = Cli::try_parse_from([
            "tidewire",
            "simulate",
            "--fragments",
            "50",
            "--drop-after",
            "30",
            "--discard-every",
            "7",
            "--base-delay-ms",
            "10",
        ])
        .expect("valid arguments");

        match cli.command {
            Command::Simulate(args) => {
                assert_eq!(args.fragments, 50);
                assert_eq!(args.drop_after, Some(30));
                assert_eq!(args.discard_every, Some(7));
                assert_eq!(args.client.base_delay_ms, 10);
                assert_eq!(args.faulty_connections, 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn tail_requires_stream_id() {
        assert!(Cli::try_parse_from(["tidewire", "tail", "http://localhost:8080"]).is_err());
    }
}
