//! Rendering job progress into the document's output blocks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::EvaluationJob;
use crate::document::{DocumentId, DocumentLines};
use crate::locator::{
    CellRegion, OUTPUT_CLOSE, OUTPUT_OPEN, cells, escape_output_line, find_output_block,
};

use super::host::DocumentHost;
use super::status::{JobState, status_line, status_tag};

/// Replace the output block of a freshly submitted cell with a queued
/// placeholder.
///
/// Runs on the foreground, against the document the region was located in.
pub fn write_placeholder(doc: &mut DocumentLines, region: &CellRegion, eval_id: u64) {
    let at = region.end_line + 1;
    remove_blank_lines_at(doc, at);
    if let Some((open, close)) = find_output_block(doc.as_slice(), region.end_line) {
        doc.drain(open..=close);
        remove_blank_lines_at(doc, at);
    }

    let block = [
        String::new(),
        OUTPUT_OPEN.to_string(),
        status_line(eval_id, JobState::Queued, Duration::ZERO),
        OUTPUT_CLOSE.to_string(),
        String::new(),
    ];
    let at = at.min(doc.len());
    doc.splice(at..at, block);
}

fn remove_blank_lines_at(doc: &mut DocumentLines, at: usize) {
    while doc.get(at).is_some_and(|l| l.trim().is_empty()) {
        doc.remove(at);
    }
}

/// Where a job's output lives.
#[derive(Debug, Clone)]
struct OutputTarget {
    document_id: DocumentId,
    eval_id: u64,
    source: String,
    /// Closing marker line of the cell when it was submitted.
    end_line: usize,
}

/// Find the output block of `target`, creating one after the cell if the
/// cell is still there but its block is gone.
///
/// Eval ids repeat after a restart and across sessions, so the block is found
/// through its cell: first a cell whose body equals the job's source, then the
/// cell's original position. The status tag only picks between cells with the
/// same source and confirms a block found by position.
fn locate_output(doc: &mut DocumentLines, target: &OutputTarget) -> Option<(usize, usize)> {
    let tag = status_tag(target.eval_id);
    let carries_tag = |lines: &[String], (open, _): (usize, usize)| {
        lines
            .get(open + 1)
            .is_some_and(|l| l.trim_start().starts_with(&tag))
    };

    let lines = doc.as_slice();
    let candidates: Vec<CellRegion> = cells(lines)
        .into_iter()
        .filter(|r| r.source_text() == target.source)
        .collect();
    if let Some(block) = candidates
        .iter()
        .filter_map(|r| find_output_block(lines, r.end_line))
        .find(|&block| carries_tag(lines, block))
    {
        return Some(block);
    }
    if let Some(region) = candidates
        .iter()
        .min_by_key(|r| r.end_line.abs_diff(target.end_line))
    {
        if let Some(block) = find_output_block(lines, region.end_line) {
            return Some(block);
        }
        let at = region.end_line + 1;
        doc.splice(
            at..at,
            [String::new(), OUTPUT_OPEN.to_string(), OUTPUT_CLOSE.to_string()],
        );
        return Some((at + 1, at + 2));
    }

    // The cell was edited while the job ran
    find_output_block(lines, target.end_line).filter(|&block| carries_tag(lines, block))
}

/// Replace the interior of a job's output block.
fn rewrite_block(doc: &mut DocumentLines, target: &OutputTarget, interior: Vec<String>) {
    match locate_output(doc, target) {
        Some((open, close)) => {
            doc.splice(open + 1..close, interior);
        }
        None => tracing::debug!(
            "Output block of evaluation {} in {} is gone",
            target.eval_id,
            target.document_id
        ),
    }
}

/// Streams one job's output into its block with throttled rewrites.
pub struct OutputRenderer {
    host: Arc<dyn DocumentHost>,
    target: OutputTarget,
    refresh_interval: Duration,
    started: Instant,
    last_rewrite: Option<Instant>,
    body: Vec<String>,
}

impl OutputRenderer {
    pub fn new(host: Arc<dyn DocumentHost>, job: &EvaluationJob, refresh_interval: Duration) -> Self {
        Self {
            host,
            target: OutputTarget {
                document_id: job.document_id.clone(),
                eval_id: job.eval_id,
                source: job.source_text.clone(),
                end_line: job.region.end_line,
            },
            refresh_interval,
            started: Instant::now(),
            last_rewrite: None,
            body: Vec::new(),
        }
    }

    /// Restart the elapsed-time clock.
    pub fn start_clock(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn push_line(&mut self, line: String) {
        self.body.push(line);
    }

    pub fn push_lines(&mut self, lines: impl IntoIterator<Item = String>) {
        self.body.extend(lines);
    }

    pub fn body(&self) -> &[String] {
        &self.body
    }

    /// Show the running state unless the last rewrite was too recent.
    /// The first call always rewrites. Returns whether it did.
    pub fn refresh(&mut self) -> bool {
        let due = self
            .last_rewrite
            .is_none_or(|last| last.elapsed() >= self.refresh_interval);
        if due {
            self.rewrite(JobState::Running);
        }
        due
    }

    /// Show a final state, whatever the throttle says.
    pub fn finish(&mut self, state: JobState) {
        self.rewrite(state);
    }

    fn rewrite(&mut self, state: JobState) {
        self.last_rewrite = Some(Instant::now());
        while self.body.last().is_some_and(|l| l.trim().is_empty()) {
            self.body.pop();
        }

        let mut interior = Vec::with_capacity(self.body.len() + 1);
        interior.push(status_line(self.target.eval_id, state, self.elapsed()));
        interior.extend(self.body.iter().map(|l| escape_output_line(l)));

        let target = self.target.clone();
        self.host.schedule(
            &self.target.document_id,
            Box::new(move |doc| rewrite_block(doc, &target, interior)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::locate_cell;
    use crate::render::host::ForegroundHost;
    use crate::render::status::parse_status_line;

    fn doc(text: &str) -> DocumentLines {
        DocumentLines::from_text(text)
    }

    fn job_for(doc: &DocumentLines, line: usize, eval_id: u64) -> EvaluationJob {
        let region = locate_cell(doc.as_slice(), line).unwrap();
        EvaluationJob {
            document_id: DocumentId::new("doc"),
            source_text: region.source_text().to_string(),
            region,
            eval_id,
            delayed: false,
            generation: 0,
        }
    }

    #[test]
    fn test_placeholder_after_cell() {
        let mut lines = doc("<cell>\nx = 1\n</cell>\n\n\nnext");
        let region = locate_cell(lines.as_slice(), 1).unwrap();
        write_placeholder(&mut lines, &region, 4);

        assert_eq!(
            lines.to_text(),
            "<cell>\nx = 1\n</cell>\n\n<output>\n[4][*] queue...\n</output>\n\nnext\n"
        );
    }

    #[test]
    fn test_placeholder_replaces_old_output() {
        let mut lines = doc(
            "<cell>\nx = 1\n</cell>\n\n<output>\n[1][Done] 0.10 seconds...\nold\n</output>\n\n<cell>\ny\n</cell>",
        );
        let region = locate_cell(lines.as_slice(), 1).unwrap();
        write_placeholder(&mut lines, &region, 2);

        let text = lines.to_text();
        assert!(!text.contains("old"));
        assert_eq!(text.matches("<output>").count(), 1);
        assert!(text.contains("[2][*] queue..."));
        assert!(text.ends_with("</output>\n\n<cell>\ny\n</cell>\n"));
    }

    #[test]
    fn test_placeholder_keeps_next_cell_output() {
        let mut lines = doc(
            "<cell>\na\n</cell>\n<cell>\nb\n</cell>\n\n<output>\n[1][Done] 0.00 seconds...\n</output>",
        );
        let region = locate_cell(lines.as_slice(), 1).unwrap();
        write_placeholder(&mut lines, &region, 2);
        assert_eq!(lines.to_text().matches("<output>").count(), 2);
        assert!(lines.to_text().contains("[1][Done]"));
    }

    #[test]
    fn test_rewrite_follows_moved_block() {
        let host = Arc::new(ForegroundHost::new().unwrap());
        let id = DocumentId::new("doc");
        let mut lines = doc("<cell>\nprint(1)\n</cell>");
        let job = job_for(&lines, 1, 1);
        write_placeholder(&mut lines, &job.region, 1);
        host.open(id.clone(), lines).unwrap();

        // Text inserted above the cell shifts every line
        host.schedule(&id, Box::new(|d| d.insert(0, "title".to_string())));

        let mut renderer = OutputRenderer::new(host.clone(), &job, Duration::from_secs(60));
        renderer.push_line("1".to_string());
        renderer.push_line(String::new());
        renderer.finish(JobState::Done);
        host.flush().unwrap();

        let lines = host.lines(&id).unwrap();
        let open = lines.iter().position(|l| l == OUTPUT_OPEN).unwrap();
        assert_eq!(open, 5);
        assert_eq!(parse_status_line(&lines[open + 1]).unwrap(), (1, JobState::Done));
        assert_eq!(lines[open + 2], "1");
        assert_eq!(lines[open + 3], OUTPUT_CLOSE);
    }

    #[test]
    fn test_rewrite_recreates_deleted_block() {
        let host = Arc::new(ForegroundHost::new().unwrap());
        let id = DocumentId::new("doc");
        let lines = doc("<cell>\nprint(1)\n</cell>\ntail");
        let job = job_for(&lines, 1, 3);
        host.open(id.clone(), lines).unwrap();

        let mut renderer = OutputRenderer::new(host.clone(), &job, Duration::ZERO);
        renderer.finish(JobState::Error);
        host.flush().unwrap();

        let text = host.text(&id).unwrap();
        assert!(text.contains("<output>\n[3][Error]"));
        assert!(text.ends_with("</output>\ntail\n"));
    }

    #[test]
    fn test_repeated_eval_id_targets_own_cell() {
        let host = Arc::new(ForegroundHost::new().unwrap());
        let id = DocumentId::new("doc");
        let mut lines = doc("<cell>\nprint('a')\n</cell>\n<cell>\nprint('b')\n</cell>");

        // Cell a finished as evaluation 1 before the ids were reset
        let first = job_for(&lines, 1, 1);
        write_placeholder(&mut lines, &first.region, 1);
        let second = job_for(&lines, 8, 1);
        write_placeholder(&mut lines, &second.region, 1);
        host.open(id.clone(), lines).unwrap();

        let mut renderer = OutputRenderer::new(host.clone(), &first, Duration::ZERO);
        renderer.push_line("a".to_string());
        renderer.finish(JobState::Done);
        let mut renderer = OutputRenderer::new(host.clone(), &second, Duration::ZERO);
        renderer.push_line("b".to_string());
        renderer.finish(JobState::Done);
        host.flush().unwrap();

        let lines = host.lines(&id).unwrap();
        let all = cells(lines.as_slice());
        for (region, expected) in all.iter().zip(["a", "b"]) {
            let (open, close) = find_output_block(lines.as_slice(), region.end_line).unwrap();
            assert_eq!(parse_status_line(&lines[open + 1]).unwrap(), (1, JobState::Done));
            assert_eq!(lines[open + 2..close], [expected.to_string()]);
        }
    }

    #[test]
    fn test_edited_cell_keeps_only_tagged_block() {
        let host = Arc::new(ForegroundHost::new().unwrap());
        let id = DocumentId::new("doc");
        let lines = doc(
            "<cell>\nx = 1\n</cell>\n\n<output>\n[7][Done] 0.00 seconds...\nold\n</output>",
        );
        let job = job_for(&lines, 1, 2);
        host.open(id.clone(), lines).unwrap();
        host.schedule(&id, Box::new(|d| d[1] = "x = 2".to_string()));

        let mut renderer = OutputRenderer::new(host.clone(), &job, Duration::ZERO);
        renderer.finish(JobState::Done);
        host.flush().unwrap();

        let text = host.text(&id).unwrap();
        assert!(text.contains("[7][Done] 0.00 seconds...\nold\n</output>"), "{}", text);
        assert!(!text.contains("[2]"));
    }

    #[test]
    fn test_printed_markers_keep_document_well_formed() {
        let host = Arc::new(ForegroundHost::new().unwrap());
        let id = DocumentId::new("doc");
        let mut lines = doc("<cell>\nprint('</output>')\n</cell>\n<cell>\nx = 1\n</cell>");
        let job = job_for(&lines, 1, 1);
        write_placeholder(&mut lines, &job.region, 1);
        host.open(id.clone(), lines).unwrap();

        let mut renderer = OutputRenderer::new(host.clone(), &job, Duration::ZERO);
        renderer.push_lines(["</output>".to_string(), "<output>".to_string(), "  <cell>".to_string()]);
        renderer.finish(JobState::Done);
        host.flush().unwrap();

        let lines = host.lines(&id).unwrap();
        let all = cells(lines.as_slice());
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].source_text(), "x = 1");
        assert!(locate_cell(lines.as_slice(), all[1].start_line + 1).is_some());
        let (open, close) = find_output_block(lines.as_slice(), all[0].end_line).unwrap();
        assert_eq!(
            lines[open + 2..close],
            ["\\</output>".to_string(), "\\<output>".to_string(), "\\  <cell>".to_string()]
        );
    }

    #[test]
    fn test_refresh_is_throttled() {
        let host = Arc::new(ForegroundHost::new().unwrap());
        let lines = doc("<cell>\nx\n</cell>");
        let job = job_for(&lines, 1, 1);

        let mut renderer = OutputRenderer::new(host, &job, Duration::from_secs(60));
        assert!(renderer.refresh());
        assert!(!renderer.refresh());
        renderer.finish(JobState::Done);
    }
}
