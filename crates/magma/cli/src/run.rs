//! Run command implementation for Magma CLI.
//!
//! Opens the document in an in-memory host, submits cells to a session,
//! waits for them and writes the rendered document back to disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use magma::{DocumentFile, load_config};
use magma_core::locator::{self, find_output_block};
use magma_core::{
    DocumentLines, ForegroundHost, JobState, Scope, SessionController, parse_status_line,
};

use crate::{GlobalArgs, colors};

/// Run the cell at `line`, or every code cell in `scope` when `line` is
/// `None`.
pub async fn execute(
    globals: &GlobalArgs,
    document: &str,
    line: Option<usize>,
    scope: Scope,
    delay: bool,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let doc = DocumentFile::open(document)?;
    let config = load_config(globals.config.as_deref(), globals.state_dir.as_deref(), &doc)?;

    let host = Arc::new(ForegroundHost::new()?);
    host.open(doc.id.clone(), doc.read()?)?;
    let session = Arc::new(SessionController::new(config, host.clone())?);

    println!(
        "\n{}Magma{} - Running {}{}{}\n",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        doc.file_name(),
        colors::RESET
    );

    let index = line.map(crate::line_index).transpose()?;
    let selected = host.with_document(&doc.id, move |lines| select_cells(lines, index, scope))?;
    let submitted = submit_cells(&session, &host, &doc, selected, delay)?;

    if submitted.is_empty() {
        session.shutdown();
        println!("{}No runnable cell found.{}", colors::YELLOW, colors::RESET);
        println!("Cells are non-empty regions between <cell> and </cell> lines");
        return Ok(());
    }

    let mut waiter = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || while !session.wait_idle(Duration::from_secs(1)) {})
    };
    let interrupted = tokio::select! {
        res = &mut waiter => {
            res?;
            false
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            true
        }
    };
    if interrupted {
        println!("{}Interrupting...{}", colors::YELLOW, colors::RESET);
        session.interrupt();
        waiter.await?;
    }

    // Every edit is scheduled before the dispatcher exits, so closing the
    // document afterwards sees the final text.
    session.shutdown();
    let lines = host.close(&doc.id)?;
    doc.write(&lines)?;

    let states = print_outputs(&lines, &submitted);
    let failed = states.iter().filter(|s| **s == JobState::Error).count();

    println!("\n{}", "─".repeat(50));
    if interrupted {
        anyhow::bail!("Interrupted after {:.2}s", start.elapsed().as_secs_f64());
    }
    if failed > 0 {
        anyhow::bail!("{} of {} cells failed", failed, submitted.len());
    }
    println!(
        "{}Completed{} {} cells in {:.2}s",
        colors::GREEN,
        colors::RESET,
        submitted.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Ordinals of the code cells to run: the cell enclosing `line`, or every
/// cell in `scope`.
fn select_cells(lines: &DocumentLines, line: Option<usize>, scope: Scope) -> Vec<usize> {
    let lines = lines.as_slice();
    let in_scope = locator::cells_in(lines, scope);
    locator::cells(lines)
        .iter()
        .enumerate()
        .filter(|(_, cell)| match line {
            Some(line) => cell.contains(line),
            None => in_scope.contains(*cell),
        })
        .map(|(idx, _)| idx)
        .collect()
}

/// Submit the selected code cells in document order. Returns the ordinal and
/// eval id of every cell that was queued.
///
/// Each cell is looked up and submitted in one foreground edit, so output
/// rendered by earlier cells cannot shift it in between. Placeholders move
/// cells but never add or remove one, so ordinals stay valid.
fn submit_cells(
    session: &Arc<SessionController>,
    host: &ForegroundHost,
    doc: &DocumentFile,
    selected: Vec<usize>,
    delay: bool,
) -> anyhow::Result<Vec<(usize, u64)>> {
    let mut submitted = Vec::with_capacity(selected.len());
    for idx in selected {
        let session = Arc::clone(session);
        let id = doc.id.clone();
        let eval_id = host.with_document(&doc.id, move |lines| {
            let start = locator::cells(lines.as_slice()).get(idx)?.start_line;
            if delay {
                session.submit_delayed(&id, lines, start)
            } else {
                session.submit(&id, lines, start)
            }
        })?;
        submitted.extend(eval_id.map(|eval_id| (idx, eval_id)));
    }
    Ok(submitted)
}

/// Print the output block of every submitted cell and return their states.
///
/// Eval ids restart at 1 in every run, so a block only counts when it sits
/// after the cell that was submitted.
fn print_outputs(lines: &DocumentLines, submitted: &[(usize, u64)]) -> Vec<JobState> {
    println!("{}Outputs:{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));

    let mut states = Vec::new();
    for (idx, cell) in locator::cells(lines.as_slice()).iter().enumerate() {
        let Some((open, close)) = find_output_block(lines.as_slice(), cell.end_line) else {
            continue;
        };
        let Some((eval_id, state)) = lines.get(open + 1).and_then(|l| parse_status_line(l)) else {
            continue;
        };
        if !submitted.contains(&(idx, eval_id)) {
            continue;
        }

        println!(
            "{}{}{}",
            colors::for_state(state),
            lines[open + 1].trim(),
            colors::RESET
        );
        for line in &lines[open + 2..close] {
            println!("  {}", line);
        }
        states.push(state);
    }
    states
}
