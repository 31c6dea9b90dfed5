//! Run report assembly
//!
//! The single document a run produces: totals, score, fix records and
//! the iteration timeline, with stable JSON keys for the HTTP surface
//! and the dashboard.

use crate::failure::BugType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Input to one healing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub repo_url: String,
    pub team_name: String,
    pub team_leader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiStatus {
    #[serde(rename = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// What an iteration decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Applied,
    RolledBack,
    Stuck,
    Passed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based.
    pub iteration: usize,
    /// PASSED when the iteration applied cleanly or ended the run
    /// green, FAILED otherwise.
    pub status: CiStatus,
    /// Failures observed before the iteration's fixes.
    pub failures_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures_after: Option<usize>,
    pub decision: Decision,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Rollback target, kept out of the wire format.
    #[serde(skip)]
    pub snapshot: String,
}

impl IterationRecord {
    pub fn new(iteration: usize, failures_count: usize, decision: Decision, snapshot: &str) -> Self {
        let status = match decision {
            Decision::Applied | Decision::Passed => CiStatus::Passed,
            Decision::RolledBack | Decision::Stuck => CiStatus::Failed,
        };
        Self {
            iteration,
            status,
            failures_count,
            failures_after: None,
            decision,
            timestamp: Utc::now().to_rfc3339(),
            reason: None,
            snapshot: snapshot.to_string(),
        }
    }

    pub fn with_after(mut self, failures_after: usize) -> Self {
        self.failures_after = Some(failures_after);
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    pub file: String,
    pub bug_type: BugType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Every line in the file that shared the bug class.
    pub all_lines: Vec<u32>,
    pub error_message: String,
    pub commit_message: String,
    pub providers_used: Vec<String>,
    /// Chosen-fix origin, validation outcome, truncated raw provider
    /// responses, anything else worth keeping for debugging.
    pub debug: BTreeMap<String, String>,
}

impl FixRecord {
    pub fn site(&self) -> (String, Option<u32>) {
        (self.file.clone(), self.line)
    }
}

/// Commit message for a fix, always carrying the agent prefix.
pub fn fix_commit_message(bug: BugType, file: &str) -> String {
    format!("{}fix {} in {}", crate::git_ops::COMMIT_PREFIX, bug, file)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub base: i64,
    pub speed_bonus: i64,
    pub efficiency_penalty: i64,
    pub total: i64,
}

/// Threshold for the speed bonus, strict.
const SPEED_BONUS_SECS: u64 = 300;
/// Commits beyond this count are penalized.
const FREE_COMMITS: usize = 20;

impl Score {
    pub fn compute(total_time_seconds: u64, commits_made: usize) -> Self {
        let base = 100;
        let speed_bonus = if total_time_seconds < SPEED_BONUS_SECS { 10 } else { 0 };
        let efficiency_penalty = 2 * commits_made.saturating_sub(FREE_COMMITS) as i64;
        Self {
            base,
            speed_bonus,
            efficiency_penalty,
            total: base + speed_bonus - efficiency_penalty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubCi {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub repo_url: String,
    pub team_name: String,
    pub team_leader: String,
    pub branch_name: String,
    pub total_failures_detected: usize,
    pub total_fixes_applied: usize,
    pub regressions_prevented: usize,
    pub total_time_seconds: u64,
    pub ci_status: CiStatus,
    pub retry_limit: usize,
    pub score: Score,
    pub fixes: Vec<FixRecord>,
    pub timeline: Vec<IterationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_ci: Option<GithubCi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(request: &RunRequest, branch_name: &str, retry_limit: usize) -> Self {
        Self {
            repo_url: request.repo_url.clone(),
            team_name: request.team_name.clone(),
            team_leader: request.team_leader.clone(),
            branch_name: branch_name.to_string(),
            total_failures_detected: 0,
            total_fixes_applied: 0,
            regressions_prevented: 0,
            total_time_seconds: 0,
            ci_status: CiStatus::Failed,
            retry_limit,
            score: Score::compute(0, 0),
            fixes: Vec::new(),
            timeline: Vec::new(),
            github_ci: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_formula_holds() {
        for (secs, commits) in [(0u64, 0usize), (299, 25), (300, 5), (1000, 50)] {
            let score = Score::compute(secs, commits);
            assert_eq!(score.total, score.base + score.speed_bonus - score.efficiency_penalty);
        }
    }

    #[test]
    fn test_speed_bonus_is_strict_at_threshold() {
        assert_eq!(Score::compute(299, 0).speed_bonus, 10);
        assert_eq!(Score::compute(300, 0).speed_bonus, 0);
    }

    #[test]
    fn test_efficiency_penalty_kicks_in_after_twenty_commits() {
        assert_eq!(Score::compute(400, 20).efficiency_penalty, 0);
        assert_eq!(Score::compute(400, 23).efficiency_penalty, 6);
    }

    #[test]
    fn test_report_json_stable_keys() {
        let request = RunRequest {
            repo_url: "https://github.com/octo/widget".to_string(),
            team_name: "rocket".to_string(),
            team_leader: "ada".to_string(),
            auth_token: None,
        };
        let report = RunReport::new(&request, "ROCKET_ADA_AI_Fix", 5);
        let json = serde_json::to_value(&report).unwrap();
        for key in [
            "repo_url",
            "team_name",
            "team_leader",
            "branch_name",
            "total_failures_detected",
            "total_fixes_applied",
            "regressions_prevented",
            "total_time_seconds",
            "ci_status",
            "retry_limit",
            "score",
            "fixes",
            "timeline",
        ] {
            assert!(json.get(key).is_some(), "missing key {}", key);
        }
        assert_eq!(json["ci_status"], "FAILED");
        assert_eq!(json["score"]["base"], 100);
    }

    #[test]
    fn test_iteration_status_tracks_decision() {
        let applied = IterationRecord::new(1, 4, Decision::Applied, "abc");
        assert_eq!(applied.status, CiStatus::Passed);
        let rolled = IterationRecord::new(2, 4, Decision::RolledBack, "abc");
        assert_eq!(rolled.status, CiStatus::Failed);
        let json = serde_json::to_value(&rolled).unwrap();
        assert_eq!(json["decision"], "rolled_back");
        assert!(json.get("snapshot").is_none());
    }

    #[test]
    fn test_fix_commit_message_prefix() {
        let msg = fix_commit_message(BugType::Linting, "f.py");
        assert_eq!(msg, "[AI-AGENT] fix LINTING in f.py");
    }

    #[test]
    fn test_bug_type_serializes_upper() {
        assert_eq!(serde_json::to_string(&BugType::TypeError).unwrap(), "\"TYPE_ERROR\"");
    }
}
