//! Cell locator for Magma documents.
//!
//! A document is plain text with paired markers, each alone on its line:
//!
//! ```text
//! <cell>
//! x = 1
//! print(x)
//! </cell>
//!
//! <output>
//! [1][Done] 0.02 seconds...
//! 1
//! </output>
//! ```
//!
//! `<markdown>` and `<raw>` blocks use the same scheme but are only a display
//! classification; they are never evaluated. Markers never nest. A document
//! with an unbalanced, nested or crossed marker is malformed and yields no
//! regions at all.

/// Opening marker of an output block.
pub const OUTPUT_OPEN: &str = "<output>";

/// Closing marker of an output block.
pub const OUTPUT_CLOSE: &str = "</output>";

/// Kind of a delimited block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Executable code cell.
    Code,
    /// Markdown text, display only.
    Markdown,
    /// Raw text, display only.
    Raw,
}

impl BlockKind {
    const ORDER: [BlockKind; 3] = [BlockKind::Code, BlockKind::Markdown, BlockKind::Raw];

    pub fn open_marker(self) -> &'static str {
        match self {
            BlockKind::Code => "<cell>",
            BlockKind::Markdown => "<markdown>",
            BlockKind::Raw => "<raw>",
        }
    }

    pub fn close_marker(self) -> &'static str {
        match self {
            BlockKind::Code => "</cell>",
            BlockKind::Markdown => "</markdown>",
            BlockKind::Raw => "</raw>",
        }
    }

    /// The next kind in `code → markdown → raw` order.
    pub fn cycled(self, direction: Direction) -> BlockKind {
        let idx = Self::ORDER.iter().position(|k| *k == self).unwrap_or(0);
        let len = Self::ORDER.len();
        match direction {
            Direction::Forward => Self::ORDER[(idx + 1) % len],
            Direction::Backward => Self::ORDER[(idx + len - 1) % len],
        }
    }
}

/// Direction for [`cycle_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Part of a document selected relative to a line.
///
/// A code cell and the output block after it count as one unit: the unit is
/// in scope when any of its lines is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Units starting at or before the line.
    Above(usize),
    /// Units ending at or after the line.
    Below(usize),
}

impl Scope {
    /// Whether a unit spanning `start..=end` is in scope.
    pub fn covers(self, start: usize, end: usize) -> bool {
        match self {
            Scope::All => true,
            Scope::Above(line) => start <= line,
            Scope::Below(line) => end >= line,
        }
    }
}

/// A delimited region of the document.
///
/// Line indices are 0-based and point at the marker lines themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRegion {
    /// Line of the opening marker.
    pub start_line: usize,
    /// Line of the closing marker.
    pub end_line: usize,
    /// Kind of block.
    pub kind: BlockKind,
    source_text: String,
}

impl CellRegion {
    /// The lines strictly between the markers, joined with `\n`.
    ///
    /// Kept verbatim so that line 1 of the source is the first line after
    /// the opening marker.
    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    /// Whether the body contains nothing but whitespace.
    pub fn is_empty_body(&self) -> bool {
        self.source_text.trim().is_empty()
    }

    /// Whether `line` falls on the region, markers included.
    pub fn contains(&self, line: usize) -> bool {
        self.start_line <= line && line <= self.end_line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Open(BlockKind),
    Close(BlockKind),
    OutputOpen,
    OutputClose,
}

impl Marker {
    fn parse(line: &str) -> Option<Marker> {
        let trimmed = line.trim();
        if trimmed == OUTPUT_OPEN {
            return Some(Marker::OutputOpen);
        }
        if trimmed == OUTPUT_CLOSE {
            return Some(Marker::OutputClose);
        }
        BlockKind::ORDER.iter().find_map(|&kind| {
            if trimmed == kind.open_marker() {
                Some(Marker::Open(kind))
            } else if trimmed == kind.close_marker() {
                Some(Marker::Close(kind))
            } else {
                None
            }
        })
    }
}

/// Scan all blocks. `None` if the document is malformed.
fn scan_blocks<S: AsRef<str>>(lines: &[S]) -> Option<Vec<CellRegion>> {
    let mut blocks = Vec::new();
    let mut open: Option<(BlockKind, usize)> = None;
    let mut in_output = false;

    for (idx, line) in lines.iter().enumerate() {
        let marker = Marker::parse(line.as_ref());

        // Inside a cell every line is content, including output markers.
        if let Some((kind, start)) = open {
            match marker {
                Some(Marker::Close(close)) if close == kind => {
                    blocks.push(CellRegion {
                        start_line: start,
                        end_line: idx,
                        kind,
                        source_text: join_lines(&lines[start + 1..idx]),
                    });
                    open = None;
                }
                Some(Marker::Open(_)) | Some(Marker::Close(_)) => return None,
                _ => {}
            }
            continue;
        }

        match marker {
            Some(Marker::OutputOpen) => {
                if in_output {
                    return None;
                }
                in_output = true;
            }
            Some(Marker::OutputClose) => {
                if !in_output {
                    return None;
                }
                in_output = false;
            }
            // Printed text may look like markers.
            _ if in_output => {}
            Some(Marker::Open(kind)) => open = Some((kind, idx)),
            Some(Marker::Close(_)) => return None,
            None => {}
        }
    }

    if open.is_some() || in_output {
        return None;
    }
    Some(blocks)
}

/// Make a line of printed output safe to place inside an output block.
///
/// A line that would read as a marker gets a leading backslash, so printed
/// text never opens or closes a block.
pub fn escape_output_line(line: &str) -> String {
    if Marker::parse(line).is_some() {
        format!("\\{}", line)
    } else {
        line.to_string()
    }
}

fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The block of any kind enclosing `line`, marker lines included.
pub fn locate_block<S: AsRef<str>>(lines: &[S], line: usize) -> Option<CellRegion> {
    scan_blocks(lines)?
        .into_iter()
        .find(|region| region.contains(line))
}

/// The code cell enclosing `line`.
///
/// Returns `None` when the line is outside every cell, inside a display-only
/// block, or when the document is malformed.
pub fn locate_cell<S: AsRef<str>>(lines: &[S], line: usize) -> Option<CellRegion> {
    locate_block(lines, line).filter(|region| region.kind == BlockKind::Code)
}

/// All code cells in document order.
pub fn cells<S: AsRef<str>>(lines: &[S]) -> Vec<CellRegion> {
    scan_blocks(lines)
        .unwrap_or_default()
        .into_iter()
        .filter(|region| region.kind == BlockKind::Code)
        .collect()
}

/// Find the output block that follows line `after`.
///
/// The search stops at the next block opener, so an output block belonging to
/// a later cell is never returned. Returns the lines of `<output>` and
/// `</output>`.
pub fn find_output_block<S: AsRef<str>>(lines: &[S], after: usize) -> Option<(usize, usize)> {
    let mut start = None;
    for (idx, line) in lines.iter().enumerate().skip(after + 1) {
        match Marker::parse(line.as_ref()) {
            Some(Marker::Open(_)) if start.is_none() => return None,
            Some(Marker::OutputOpen) if start.is_none() => start = Some(idx),
            Some(Marker::OutputClose) => return start.map(|s| (s, idx)),
            _ => {}
        }
    }
    None
}

/// Code cells in scope, in document order.
///
/// The output block after a cell extends its unit, so `Below` a line inside
/// a cell's output still selects that cell.
pub fn cells_in<S: AsRef<str>>(lines: &[S], scope: Scope) -> Vec<CellRegion> {
    cells(lines)
        .into_iter()
        .filter(|cell| {
            let end = find_output_block(lines, cell.end_line)
                .map_or(cell.end_line, |(_, close)| close);
            scope.covers(cell.start_line, end)
        })
        .collect()
}

/// Remove every output block.
///
/// Runs of blank lines left behind collapse to a single blank line and
/// trailing blank lines are dropped. Returns `None` if the output markers are
/// unbalanced.
pub fn strip_outputs<S: AsRef<str>>(lines: &[S]) -> Option<Vec<String>> {
    strip_outputs_in(lines, Scope::All)
}

/// Remove the output blocks in scope, cleaning up blank lines like
/// [`strip_outputs`]. An output block belongs to the block whose closing
/// marker precedes it.
pub fn strip_outputs_in<S: AsRef<str>>(lines: &[S], scope: Scope) -> Option<Vec<String>> {
    let opens = lines.iter().filter(|l| l.as_ref().trim() == OUTPUT_OPEN).count();
    let closes = lines.iter().filter(|l| l.as_ref().trim() == OUTPUT_CLOSE).count();
    if opens != closes {
        return None;
    }

    let mut kept: Vec<String> = Vec::with_capacity(lines.len());
    let mut owner_start = None;
    // Start of the unit and the lines of the output block being read
    let mut output: Option<(usize, Vec<String>)> = None;
    for (idx, line) in lines.iter().enumerate() {
        let line = line.as_ref();
        if let Some((unit_start, block)) = output.as_mut() {
            block.push(line.to_string());
            if line.trim() == OUTPUT_CLOSE {
                if !scope.covers(*unit_start, idx) {
                    kept.append(block);
                }
                output = None;
            }
            continue;
        }

        match Marker::parse(line) {
            Some(Marker::OutputOpen) => {
                output = Some((owner_start.unwrap_or(idx), vec![line.to_string()]));
                continue;
            }
            Some(Marker::Open(_)) => owner_start = Some(idx),
            _ => {}
        }
        let blank = line.trim().is_empty();
        let prev_blank = kept.last().is_some_and(|l| l.trim().is_empty());
        if !(blank && prev_blank) {
            kept.push(line.to_string());
        }
    }
    if output.is_some() {
        return None;
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    Some(kept)
}

/// Rotate the kind of the block enclosing `line`.
///
/// Returns the block and its new kind; the caller rewrites the two marker
/// lines with [`BlockKind::open_marker`] and [`BlockKind::close_marker`].
pub fn cycle_kind<S: AsRef<str>>(
    lines: &[S],
    line: usize,
    direction: Direction,
) -> Option<(CellRegion, BlockKind)> {
    let region = locate_block(lines, line)?;
    let kind = region.kind.cycled(direction);
    Some((region, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Vec<String> {
        text.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_locate_cell_inside_body() {
        let lines = doc("intro\n<cell>\nx = 1\nprint(x)\n</cell>\nafter");
        let region = locate_cell(&lines, 2).unwrap();
        assert_eq!(region.start_line, 1);
        assert_eq!(region.end_line, 4);
        assert_eq!(region.source_text(), "x = 1\nprint(x)");
    }

    #[test]
    fn test_locate_cell_on_markers() {
        let lines = doc("<cell>\nx = 1\n</cell>");
        assert!(locate_cell(&lines, 0).is_some());
        assert!(locate_cell(&lines, 2).is_some());
    }

    #[test]
    fn test_locate_cell_outside() {
        let lines = doc("intro\n<cell>\nx = 1\n</cell>\nafter");
        assert!(locate_cell(&lines, 0).is_none());
        assert!(locate_cell(&lines, 4).is_none());
    }

    #[test]
    fn test_marker_whitespace_ignored() {
        let lines = doc("  <cell>  \nx = 1\n\t</cell>");
        assert_eq!(locate_cell(&lines, 1).unwrap().source_text(), "x = 1");
    }

    #[test]
    fn test_unbalanced_document_yields_nothing() {
        let lines = doc("<cell>\nx = 1\n</cell>\n<cell>\ny = 2");
        assert!(locate_cell(&lines, 1).is_none());
        assert!(cells(&lines).is_empty());
    }

    #[test]
    fn test_nested_markers_yield_nothing() {
        let lines = doc("<cell>\n<cell>\nx = 1\n</cell>\n</cell>");
        assert!(locate_cell(&lines, 2).is_none());
    }

    #[test]
    fn test_crossed_kinds_yield_nothing() {
        let lines = doc("<cell>\nx = 1\n</markdown>");
        assert!(locate_block(&lines, 1).is_none());
    }

    #[test]
    fn test_markdown_is_not_evaluable() {
        let lines = doc("<markdown>\n# Title\n</markdown>");
        assert!(locate_cell(&lines, 1).is_none());
        assert_eq!(locate_block(&lines, 1).unwrap().kind, BlockKind::Markdown);
    }

    #[test]
    fn test_markers_inside_output_are_ignored() {
        let lines = doc("<cell>\nprint('<cell>')\n</cell>\n<output>\n[1][Done] 0.01 seconds...\n<cell>\n</output>\n<cell>\ny = 2\n</cell>");
        let all = cells(&lines);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].source_text(), "y = 2");
    }

    #[test]
    fn test_escape_output_line() {
        assert_eq!(escape_output_line("</output>"), "\\</output>");
        assert_eq!(escape_output_line(" <cell> "), "\\ <cell> ");
        assert_eq!(escape_output_line("print('</output>')"), "print('</output>')");

        let lines = doc("<cell>\nprint('</output>')\n</cell>\n<output>\n[1][Done] 0.01 seconds...\n\\</output>\n</output>\n<cell>\nx = 1\n</cell>");
        assert_eq!(cells(&lines).len(), 2);
        assert_eq!(locate_cell(&lines, 9).unwrap().source_text(), "x = 1");
    }

    #[test]
    fn test_empty_body() {
        let lines = doc("<cell>\n   \n\n</cell>");
        assert!(locate_cell(&lines, 1).unwrap().is_empty_body());
    }

    #[test]
    fn test_find_output_block() {
        let lines = doc("<cell>\nx\n</cell>\n\n<output>\n[1][*] queue...\n</output>\n<cell>\ny\n</cell>");
        assert_eq!(find_output_block(&lines, 2), Some((4, 6)));
    }

    #[test]
    fn test_find_output_block_stops_at_next_cell() {
        let lines = doc("<cell>\nx\n</cell>\n<cell>\ny\n</cell>\n<output>\n</output>");
        assert_eq!(find_output_block(&lines, 2), None);
        assert_eq!(find_output_block(&lines, 5), Some((6, 7)));
    }

    #[test]
    fn test_strip_outputs() {
        let lines = doc("<cell>\nx\n</cell>\n\n<output>\n[1][Done] 0.00 seconds...\n</output>\n\n\n<cell>\ny\n</cell>\n\n<output>\n</output>\n");
        let stripped = strip_outputs(&lines).unwrap();
        assert_eq!(stripped, doc("<cell>\nx\n</cell>\n\n<cell>\ny\n</cell>"));
    }

    const TWO_RUN_CELLS: &str = "<cell>\nx\n</cell>\n\n<output>\n[1][Done] 0.00 seconds...\n</output>\n\nnotes\n\n<cell>\ny\n</cell>\n\n<output>\n[2][Done] 0.00 seconds...\n</output>";

    #[test]
    fn test_strip_outputs_above() {
        let lines = doc(TWO_RUN_CELLS);
        let stripped = strip_outputs_in(&lines, Scope::Above(8)).unwrap();
        assert_eq!(stripped.iter().filter(|l| *l == OUTPUT_OPEN).count(), 1);
        assert!(stripped.contains(&"[2][Done] 0.00 seconds...".to_string()));
        assert_eq!(&stripped[..5], &doc("<cell>\nx\n</cell>\n\nnotes")[..]);
    }

    #[test]
    fn test_strip_outputs_below() {
        let lines = doc(TWO_RUN_CELLS);
        // Inside the first output block
        let stripped = strip_outputs_in(&lines, Scope::Below(5)).unwrap();
        assert!(!stripped.iter().any(|l| l == OUTPUT_OPEN));

        let stripped = strip_outputs_in(&lines, Scope::Below(8)).unwrap();
        assert!(stripped.contains(&"[1][Done] 0.00 seconds...".to_string()));
        assert!(!stripped.contains(&"[2][Done] 0.00 seconds...".to_string()));
        assert_eq!(stripped.last().map(String::as_str), Some("</cell>"));
    }

    #[test]
    fn test_cells_in_scope() {
        let lines = doc(TWO_RUN_CELLS);
        let sources = |scope| -> Vec<String> {
            cells_in(&lines, scope)
                .iter()
                .map(|c| c.source_text().to_string())
                .collect()
        };
        assert_eq!(sources(Scope::All), vec!["x", "y"]);
        assert_eq!(sources(Scope::Above(8)), vec!["x"]);
        assert_eq!(sources(Scope::Above(11)), vec!["x", "y"]);
        assert_eq!(sources(Scope::Below(8)), vec!["y"]);
        assert_eq!(sources(Scope::Below(5)), vec!["x", "y"]);
        assert!(sources(Scope::Below(40)).is_empty());
    }

    #[test]
    fn test_strip_outputs_unbalanced() {
        let lines = doc("<output>\nx\n");
        assert!(strip_outputs(&lines).is_none());
    }

    #[test]
    fn test_cycle_kind() {
        let lines = doc("<cell>\nx\n</cell>");
        let (region, kind) = cycle_kind(&lines, 1, Direction::Forward).unwrap();
        assert_eq!(region.start_line, 0);
        assert_eq!(kind, BlockKind::Markdown);

        let (_, kind) = cycle_kind(&lines, 0, Direction::Backward).unwrap();
        assert_eq!(kind, BlockKind::Raw);
    }

    #[test]
    fn test_cycled_wraps() {
        assert_eq!(BlockKind::Raw.cycled(Direction::Forward), BlockKind::Code);
        assert_eq!(BlockKind::Code.cycled(Direction::Backward), BlockKind::Raw);
    }
}
