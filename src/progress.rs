//! Batch progress reporting.
//!
//! Reports observable progress during `ibl sync` and `ibl parse` so users
//! see which page is being fetched and how far the parse pass has got.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// One mailbox page has been processed.
    Fetching {
        account: String,
        page: u64,
        listed: u64,
        stored: u64,
    },
    /// n of total selected messages parsed.
    Parsing {
        account: String,
        mode: String,
        n: u64,
        total: u64,
    },
}

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "parse acct  quick  1,234 / 5,000 messages".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let _ = std::io::stderr().lock().write_all(human_line(&event).as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

fn human_line(event: &SyncProgressEvent) -> String {
    match event {
        SyncProgressEvent::Fetching {
            account,
            page,
            listed,
            stored,
        } => format!(
            "sync {}  page {}  {} listed, {} new\n",
            account,
            page,
            format_number(*listed),
            format_number(*stored)
        ),
        SyncProgressEvent::Parsing {
            account,
            mode,
            n,
            total,
        } => format!(
            "parse {}  {}  {} / {} messages\n",
            account,
            mode,
            format_number(*n),
            format_number(*total)
        ),
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Fetching {
                account,
                page,
                listed,
                stored,
            } => serde_json::json!({
                "event": "progress",
                "account": account,
                "phase": "fetching",
                "page": page,
                "listed": listed,
                "stored": stored
            }),
            SyncProgressEvent::Parsing {
                account,
                mode,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "account": account,
                "phase": "parsing",
                "mode": mode,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    /// Resolve the `--progress` flag value.
    pub fn from_flag(flag: &str) -> anyhow::Result<Self> {
        match flag {
            "auto" => Ok(Self::default_for_tty()),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            "off" => Ok(ProgressMode::Off),
            other => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be auto, human, json, or off.",
                other
            ),
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
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
    fn human_parse_line() {
        let line = human_line(&SyncProgressEvent::Parsing {
            account: "work".into(),
            mode: "quick".into(),
            n: 1200,
            total: 5000,
        });
        assert_eq!(line, "parse work  quick  1,200 / 5,000 messages\n");
    }

    #[test]
    fn progress_flag_values() {
        assert_eq!(ProgressMode::from_flag("json").unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::from_flag("off").unwrap(), ProgressMode::Off);
        assert!(ProgressMode::from_flag("loud").is_err());
    }
}
