//! Magma worker process.
//!
//! Runs one cell per `Run` command, isolated from the session process.
//! Commands arrive on stdin and responses go to stdout, both framed by
//! `magma_core::ipc`. Logs go to stderr, filtered by `MAGMA_LOG`.

use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use magma_core::execute::{JobRequest, run_job};
use magma_core::ipc::{WorkerCommand, WorkerResponse, read_message, write_message};
use magma_core::namespace::decode_variables;

/// Stack size for the thread running user code.
const JOB_STACK_SIZE: usize = 256 * 1024 * 1024;

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("MAGMA_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let mut stdin = BufReader::new(io::stdin().lock());
    let stdout = io::stdout();

    loop {
        let command: WorkerCommand = match read_message(&mut stdin) {
            Ok(command) => command,
            Err(e) => {
                // The parent closed the pipe or died
                tracing::debug!("Worker stopping: {}", e);
                return Ok(());
            }
        };

        match command {
            WorkerCommand::Ping => {
                write_message(&mut stdout.lock(), &WorkerResponse::Pong)?;
            }
            WorkerCommand::Run {
                document_id,
                source,
                snapshot,
                imports,
                namespace_path,
            } => {
                let request = JobRequest {
                    snapshot: decode_variables(&snapshot)
                        .context("Failed to decode namespace snapshot")?,
                    document_id,
                    source,
                    imports,
                    namespace_path: (!namespace_path.is_empty())
                        .then(|| PathBuf::from(namespace_path)),
                };
                tracing::debug!("Running cell of {}", request.document_id);

                let error = thread::scope(|scope| -> anyhow::Result<bool> {
                    thread::Builder::new()
                        .name("magma-job".to_string())
                        .stack_size(JOB_STACK_SIZE)
                        .spawn_scoped(scope, || {
                            run_job(request, BufWriter::new(stdout.lock()))
                        })
                        .context("Failed to start job thread")?
                        .join()
                        .map_err(|_| anyhow::anyhow!("Job thread panicked"))?
                        .context("Failed to stream job results")
                })?;
                tracing::debug!("Cell finished (error: {})", error);
            }
            WorkerCommand::Shutdown => {
                tracing::debug!("Worker shutting down");
                return Ok(());
            }
        }
    }
}
