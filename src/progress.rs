//! Build progress reporting.
//!
//! `voc ingest` runs three long phases (extract, summarize, embed). Progress
//! is emitted on **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// Phase of the build pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildPhase {
    Extract,
    Summarize,
    Embed,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Extract => "extract",
            BuildPhase::Summarize => "summarize",
            BuildPhase::Embed => "embed",
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            BuildPhase::Extract => "documents",
            BuildPhase::Summarize => "communities",
            BuildPhase::Embed => "objects",
        }
    }
}

/// `n` units of `phase` finished out of `total`.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub phase: BuildPhase,
    pub n: u64,
    pub total: u64,
}

/// Reports build progress. Called by the single writer of each phase.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "extract  1,234 / 5,000 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!(
            "{:<9} {} / {} {}\n",
            event.phase.as_str(),
            format_number(event.n),
            format_number(event.total),
            event.phase.unit()
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": event.phase.as_str(),
            "n": event.n,
            "total": event.total
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
