//! Document inspection and editing commands.

use magma::DocumentFile;
use magma_core::locator::{self, BlockKind, Direction};
use magma_core::{DocumentLines, Scope, parse_status_line};

use crate::colors;

/// List the code cells of a document with their last status.
pub fn list(document: &str) -> anyhow::Result<()> {
    let doc = DocumentFile::open(document)?;
    let lines = doc.read()?;
    let cells = locator::cells(lines.as_slice());

    if cells.is_empty() {
        println!("{}No cells found in {}.{}", colors::YELLOW, doc.file_name(), colors::RESET);
        println!("Cells are regions between <cell> and </cell> lines");
        return Ok(());
    }

    for (idx, cell) in cells.iter().enumerate() {
        let first = cell
            .source_text()
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        let status = locator::find_output_block(lines.as_slice(), cell.end_line)
            .and_then(|(open, _)| lines.get(open + 1))
            .and_then(|header| parse_status_line(header));

        print!(
            "{}#{:<3}{} lines {:>4}-{:<4} ",
            colors::BOLD,
            idx + 1,
            colors::RESET,
            cell.start_line + 1,
            cell.end_line + 1
        );
        match status {
            Some((eval_id, state)) => print!(
                "{}[{}][{}]{} ",
                colors::for_state(state),
                eval_id,
                state,
                colors::RESET
            ),
            None => print!("{}(not run){} ", colors::DIM, colors::RESET),
        }
        println!("{}{}{}", colors::CYAN, first.trim(), colors::RESET);
    }
    Ok(())
}

/// Remove the output blocks in `scope`.
pub fn strip(document: &str, scope: Scope) -> anyhow::Result<()> {
    let doc = DocumentFile::open(document)?;
    let lines = doc.read()?;
    let Some(stripped) = locator::strip_outputs_in(lines.as_slice(), scope) else {
        anyhow::bail!("{} has unbalanced output markers", doc.file_name());
    };

    let removed = lines.len() - stripped.len().min(lines.len());
    doc.write(&DocumentLines::new(stripped))?;
    println!("Stripped outputs from {} ({} lines removed)", doc.file_name(), removed);
    Ok(())
}

/// Rotate the kind of the block at `line`.
pub fn cycle(document: &str, line: usize, backward: bool) -> anyhow::Result<()> {
    let doc = DocumentFile::open(document)?;
    let mut lines = doc.read()?;
    let direction = if backward {
        Direction::Backward
    } else {
        Direction::Forward
    };

    let index = crate::line_index(line)?;
    let Some((region, kind)) = locator::cycle_kind(lines.as_slice(), index, direction) else {
        anyhow::bail!("No block at line {} of {}", line, doc.file_name());
    };

    lines[region.start_line] = kind.open_marker().to_string();
    lines[region.end_line] = kind.close_marker().to_string();
    doc.write(&lines)?;
    println!(
        "Block at lines {}-{} is now {}",
        region.start_line + 1,
        region.end_line + 1,
        kind_name(kind)
    );
    Ok(())
}

fn kind_name(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::Code => "a code cell",
        BlockKind::Markdown => "markdown",
        BlockKind::Raw => "raw text",
    }
}
