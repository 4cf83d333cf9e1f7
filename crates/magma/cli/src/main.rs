//! Magma CLI - run code cells embedded in plain text documents.

mod cells;
mod colors;
mod namespace;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use magma_core::Scope;

#[derive(Parser)]
#[command(name = "magma")]
#[command(about = "Run code cells embedded in plain text documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory for stored namespaces (default: .magma next to the document)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// JSON engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cells and write their output into the document
    Run {
        /// Path to the document
        document: String,

        /// Run only the cell at this line (1-based)
        #[arg(long, conflicts_with_all = ["all", "above", "below"])]
        line: Option<usize>,

        /// Run every code cell, top to bottom (the default)
        #[arg(long, conflicts_with_all = ["above", "below"])]
        all: bool,

        /// Run the cells up to and including the one at this line
        #[arg(long, value_name = "LINE", conflicts_with = "below")]
        above: Option<usize>,

        /// Run the cell at this line and every cell after it
        #[arg(long, value_name = "LINE")]
        below: Option<usize>,

        /// Wait the configured start delay before each cell runs
        #[arg(long)]
        delay: bool,
    },

    /// List the code cells of a document
    Cells {
        /// Path to the document
        document: String,
    },

    /// Print the stored namespace of a document
    Namespace {
        /// Path to the document
        document: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the stored namespace of a document
    Reset {
        /// Path to the document
        document: String,
    },

    /// Remove output blocks from a document (all of them by default)
    Strip {
        /// Path to the document
        document: String,

        /// Only outputs of cells up to and including the one at this line
        #[arg(long, value_name = "LINE", conflicts_with = "below")]
        above: Option<usize>,

        /// Only outputs of the cell at this line and the cells after it
        #[arg(long, value_name = "LINE")]
        below: Option<usize>,
    },

    /// Change the kind of the block at a line (cell, markdown, raw)
    Kind {
        /// Path to the document
        document: String,

        /// Line inside the block (1-based)
        #[arg(long)]
        line: usize,

        /// Cycle backwards
        #[arg(long)]
        backward: bool,
    },
}

/// Options shared by every subcommand.
pub struct GlobalArgs {
    pub state_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format magma-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(magma_err) = err.downcast_ref::<magma_core::Error>() {
            anyhow::anyhow!("{}", magma_err.with_hint())
        } else {
            err
        }
    };

    let globals = GlobalArgs {
        state_dir: cli.state_dir,
        config: cli.config,
    };

    match cli.command {
        Commands::Run {
            document,
            line,
            all: _,
            above,
            below,
            delay,
        } => {
            let scope = scope(above, below)?;
            run::execute(&globals, &document, line, scope, delay)
                .await
                .map_err(format_error)?;
        }

        Commands::Cells { document } => cells::list(&document).map_err(format_error)?,

        Commands::Namespace { document, json } => {
            namespace::show(&globals, &document, json).map_err(format_error)?;
        }

        Commands::Reset { document } => {
            namespace::reset(&globals, &document).map_err(format_error)?;
        }

        Commands::Strip {
            document,
            above,
            below,
        } => {
            let scope = scope(above, below)?;
            cells::strip(&document, scope).map_err(format_error)?;
        }

        Commands::Kind {
            document,
            line,
            backward,
        } => {
            cells::cycle(&document, line, backward).map_err(format_error)?;
        }
    }

    Ok(())
}

/// Convert a 1-based line from the command line.
fn line_index(line: usize) -> anyhow::Result<usize> {
    line.checked_sub(1)
        .ok_or_else(|| anyhow::anyhow!("Line numbers start at 1"))
}

/// Scope selected by `--above` or `--below`, the whole document otherwise.
fn scope(above: Option<usize>, below: Option<usize>) -> anyhow::Result<Scope> {
    Ok(match (above, below) {
        (Some(line), _) => Scope::Above(line_index(line)?),
        (None, Some(line)) => Scope::Below(line_index(line)?),
        (None, None) => Scope::All,
    })
}
