//! Scan progress reporting.
//!
//! Reports observable progress during `ingest scan` so operators see what is
//! being scanned, how much is left, and when the index was last committed.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a scan.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanProgressEvent {
    /// Walking the source directory. Total unknown.
    Discovering { source: String },
    /// `n` of `total` files have an outcome.
    Ingesting { source: String, n: u64, total: u64 },
    /// A batch was persisted and committed.
    Committed { files: u64, entries: u64 },
}

/// Reports scan progress. Implementations write to stderr (human or JSON).
pub trait ScanProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the coordinator.
    fn report(&self, event: ScanProgressEvent);
}

/// Human-friendly progress on stderr: "scan ./docs  ingesting  1,234 / 5,000 files".
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, event: ScanProgressEvent) {
        let line = match &event {
            ScanProgressEvent::Discovering { source } => {
                format!("scan {}  discovering...\n", source)
            }
            ScanProgressEvent::Ingesting { source, n, total } => format!(
                "scan {}  ingesting  {} / {} files\n",
                source,
                format_number(*n),
                format_number(*total)
            ),
            ScanProgressEvent::Committed { files, entries } => format!(
                "scan  committed {} files, index holds {} entries\n",
                format_number(*files),
                format_number(*entries)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &ScanProgressEvent) -> serde_json::Value {
        match event {
            ScanProgressEvent::Discovering { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "discovering"
            }),
            ScanProgressEvent::Ingesting { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            ScanProgressEvent::Committed { files, entries } => serde_json::json!({
                "event": "commit",
                "files": files,
                "entries": entries
            }),
        }
    }
}

impl ScanProgressReporter for JsonProgress {
    fn report(&self, event: ScanProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _event: ScanProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
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

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_event_shapes() {
        let v = JsonProgress::to_json(&ScanProgressEvent::Ingesting {
            source: "docs".into(),
            n: 3,
            total: 41,
        });
        assert_eq!(v["phase"], "ingesting");
        assert_eq!(v["n"], 3);
        assert_eq!(v["total"], 41);

        let v = JsonProgress::to_json(&ScanProgressEvent::Committed {
            files: 32,
            entries: 90,
        });
        assert_eq!(v["event"], "commit");
    }
}
