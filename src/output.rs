use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::batch::{BatchOutcome, ProgressEvent, ProgressSink};
use crate::model::CompoundRow;
use crate::stats::ProcessingStats;
use crate::store::StoreSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Tsv,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_outcome(outcome: &BatchOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_stats(stats: &ProcessingStats) -> io::Result<()> {
        Self::print_json(stats)
    }

    pub fn print_store_summary(summary: &StoreSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        Self::write_json(&mut stdout, value)
    }

    pub fn write_json<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Tab-separated export, one row per merged compound.
pub struct TsvOutput {
    max_activities: usize,
}

impl TsvOutput {
    pub fn new(max_activities: usize) -> Self {
        Self { max_activities }
    }

    pub fn print(&self, outcome: &BatchOutcome) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        self.write(&mut stdout, outcome)
    }

    pub fn write(&self, writer: &mut impl Write, outcome: &BatchOutcome) -> io::Result<()> {
        writeln!(writer, "{}", CompoundRow::HEADERS.join("\t"))?;
        for compound in &outcome.dataset {
            let row = CompoundRow::from_compound(compound, self.max_activities);
            let cells = row.cells().map(escape_cell);
            writeln!(writer, "{}", cells.join("\t"))?;
        }
        Ok(())
    }
}

fn escape_cell(cell: &str) -> String {
    cell.replace(['\t', '\r', '\n'], " ")
}

/// Writes one progress line per event to stderr.
pub struct StderrProgress {
    lock: Mutex<()>,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = event
            .elapsed
            .map(|elapsed| format!(" ({:.1}s)", elapsed.as_secs_f64()))
            .unwrap_or_default();
        eprintln!(
            "[{}/{}] {}{elapsed}",
            event.completed, event.total, event.message
        );
    }
}

/// Human-readable run summary on stderr.
pub fn print_summary(outcome: &BatchOutcome) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let stats = &outcome.stats;
    eprintln!("{cyan}chemdata summary{reset}");
    eprintln!(
        "{green}resolved: {} of {} ({:.0}%){reset}",
        stats.succeeded,
        stats.total_compounds,
        stats.success_rate() * 100.0
    );
    if stats.failed > 0 {
        eprintln!("{yellow}unresolved: {}{reset}", stats.failed);
    }
    if stats.rejected > 0 {
        eprintln!("{red}rejected inputs: {}{reset}", stats.rejected);
    }
    if stats.cancelled > 0 {
        eprintln!("{yellow}cancelled: {}{reset}", stats.cancelled);
    }
    eprintln!(
        "{cyan}cache: {} hits, {} misses ({:.0}% hit ratio){reset}",
        stats.cache_hits,
        stats.cache_misses,
        stats.cache_hit_ratio() * 100.0
    );
    for (source, source_stats) in &stats.sources {
        let color = if source_stats.failures + source_stats.circuit_rejections > 0 {
            yellow
        } else {
            green
        };
        eprintln!(
            "{color}  {source}: {} requests, {} attempts, {:.0}% reliable{reset}",
            source_stats.requests,
            source_stats.attempts,
            source_stats.reliability() * 100.0
        );
    }
}
