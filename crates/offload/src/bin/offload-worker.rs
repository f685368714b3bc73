//! Worker process launched by `offload::Supervisor`.
//!
//! Reads its handshake from stdin and serves the entry point named in
//! `OFFLOAD_ENTRY_POINT`. Not meant to be run by hand.

use std::process::ExitCode;

use offload::worker::{EntryPoints, run_main};

#[tokio::main]
async fn main() -> ExitCode {
    offload::logging::init_tracing();
    tracing::debug!(pid = std::process::id(), "offload-worker {}", env!("CARGO_PKG_VERSION"));

    let entry_points = EntryPoints::builtin();
    match run_main(&entry_points).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}
