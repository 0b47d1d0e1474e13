//! rankpipe CLI entry point.
//!
//! Usage:
//!   rankpipe run -- ls -l              # Run one program
//!   rankpipe pipe 'ls' 'wc -l'         # Chain programs
//!   rankpipe args job.json             # Print the mpiexec command line for a job
//!   rankpipe mpi job.json              # Run a job through mpiexec

use std::process::ExitCode;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match rankpipe_cli::parse_args(&args).and_then(rankpipe_cli::execute) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}
