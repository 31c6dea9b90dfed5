//! Error-history memory
//!
//! Append-only JSONL log of error→fix pairs shared across runs and
//! consulted as few-shot context. Writes go through a single
//! `O_APPEND` write so concurrent runs never corrupt each other;
//! readers tolerate torn or malformed lines by skipping them.

use crate::failure::BugType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const HISTORY_FILE: &str = "error_history.jsonl";
const MAX_MESSAGE_CHARS: usize = 500;
const MAX_FIX_CHARS: usize = 1000;
/// Cap on few-shot examples fed into a prompt.
pub const FEW_SHOT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    bug_type: String,
    message: String,
    fix: String,
    status: String,
    timestamp: String,
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join(HISTORY_FILE),
        }
    }

    /// Record an error and the fix that was (or was not) applied.
    pub fn record(&self, bug: BugType, message: &str, fix: &str, fixed: bool) {
        let entry = HistoryEntry {
            bug_type: bug.as_str().to_string(),
            message: crate::prompt::truncate(message, MAX_MESSAGE_CHARS),
            fix: crate::prompt::truncate(fix, MAX_FIX_CHARS),
            status: if fixed { "Fixed" } else { "Failed" }.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.path.display(), "failed to append error history: {}", e);
        }
    }

    fn load(&self) -> Vec<HistoryEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Most recent successful fixes for the bug class, formatted as
    /// few-shot prompt context. Empty string when there is nothing
    /// relevant.
    pub fn few_shot(&self, bug: BugType, limit: usize) -> String {
        let limit = limit.min(FEW_SHOT_LIMIT);
        let entries = self.load();
        let relevant: Vec<&HistoryEntry> = entries
            .iter()
            .filter(|e| e.bug_type == bug.as_str() && e.status == "Fixed")
            .collect();
        let tail = relevant.len().saturating_sub(limit);

        let mut lines = Vec::new();
        for entry in &relevant[tail..] {
            lines.push(format!("Past fix for {}:", entry.bug_type));
            lines.push(format!("  Error: {}", crate::prompt::truncate(&entry.message, 200)));
            lines.push(format!("  Fix excerpt: {}", crate::prompt::truncate(&entry.fix, 300)));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_retrieve_by_bug_type() {
        let tmp = TempDir::new().unwrap();
        let log = HistoryLog::new(tmp.path());

        log.record(BugType::Syntax, "E999 invalid syntax", "def f():\n    pass", true);
        log.record(BugType::Logic, "assert 1 == 2", "return a + b", true);
        log.record(BugType::Syntax, "E999 missing paren", "", false);

        let shots = log.few_shot(BugType::Syntax, 5);
        assert!(shots.contains("E999 invalid syntax"));
        // Failed fixes are never few-shot material.
        assert!(!shots.contains("missing paren"));
        assert!(!shots.contains("assert 1 == 2"));
    }

    #[test]
    fn test_few_shot_limit_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let log = HistoryLog::new(tmp.path());
        for i in 0..10 {
            log.record(BugType::Logic, &format!("failure number {}", i), "fix", true);
        }
        let shots = log.few_shot(BugType::Logic, 2);
        assert!(shots.contains("failure number 9"));
        assert!(shots.contains("failure number 8"));
        assert!(!shots.contains("failure number 7"));
    }

    #[test]
    fn test_empty_history_yields_empty_context() {
        let tmp = TempDir::new().unwrap();
        let log = HistoryLog::new(tmp.path());
        assert_eq!(log.few_shot(BugType::Import, 5), "");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = HistoryLog::new(tmp.path());
        log.record(BugType::Logic, "real entry", "fix", true);
        std::fs::OpenOptions::new()
            .append(true)
            .open(tmp.path().join(HISTORY_FILE))
            .unwrap()
            .write_all(b"{torn line\n")
            .unwrap();
        log.record(BugType::Logic, "after torn", "fix", true);

        let shots = log.few_shot(BugType::Logic, 5);
        assert!(shots.contains("real entry"));
        assert!(shots.contains("after torn"));
    }
}
