//! The healing loop
//!
//! Drives detect→classify→repair→validate→commit cycles against one
//! checkout while holding two guarantees: progress (same-line locks,
//! convergence detection, bounded iterations) and non-regression (an
//! iteration that grows the failure count is rolled back to its
//! snapshot).

use crate::config::Config;
use crate::ensemble;
use crate::error::AgentError;
use crate::failure::{self, classify, BugType, Failure, Language};
use crate::git_ops::{self, GitVcs, Vcs, COMMIT_PREFIX};
use crate::github::{self, CiConclusion};
use crate::history::{HistoryLog, FEW_SHOT_LIMIT};
use crate::prompt;
use crate::providers::LlmClient;
use crate::report::{
    fix_commit_message, CiStatus, Decision, FixRecord, GithubCi, IterationRecord, RunReport,
    RunRequest, Score,
};
use crate::runner::{ProcessRunner, Runner};
use crate::selector;
use crate::tools;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A pre-iteration failure count more than this factor above the
/// previous iteration is treated as a latent regression.
const REGRESSION_FACTOR: f64 = 1.5;

/// Result of one fix attempt against one (file, bug class) batch.
#[derive(Debug, Clone)]
pub struct FixAttempt {
    pub fixed: bool,
    /// Tool name or "ensemble".
    pub origin: String,
    pub providers: Vec<String>,
    pub error: Option<String>,
    pub debug: BTreeMap<String, String>,
}

impl FixAttempt {
    fn failed(origin: &str, error: String) -> Self {
        let mut debug = BTreeMap::new();
        debug.insert("status".to_string(), "failed".to_string());
        Self {
            fixed: false,
            origin: origin.to_string(),
            providers: Vec::new(),
            error: Some(error),
            debug,
        }
    }
}

/// Repair port: tool-first, then ensemble. The loop never sees how a
/// fix was produced, only whether the file changed validly.
#[async_trait]
pub trait FixEngine: Send + Sync {
    async fn attempt_fix(
        &self,
        repo: &Path,
        file: &str,
        bug: BugType,
        failures: &[Failure],
    ) -> FixAttempt;
}

/// Production fix engine: deterministic tools first, the provider
/// ensemble for everything the tools cannot solve.
pub struct RepairEngine {
    providers: Vec<Arc<dyn LlmClient>>,
    history: HistoryLog,
    api_timeout: Duration,
}

impl RepairEngine {
    pub fn new(
        providers: Vec<Arc<dyn LlmClient>>,
        history: HistoryLog,
        api_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            history,
            api_timeout,
        }
    }
}

/// Reject ensemble output whose size diverges wildly from the
/// original file; a whole-file rewrite for a one-line bug is a
/// regression in waiting. Multi-error batches get more slack.
fn patch_oversized(original: &str, patched: &str, error_count: usize) -> bool {
    let base = original.chars().count();
    let max_diff = if error_count > 1 {
        (base * 4 / 5).max(5000)
    } else {
        (base / 2).max(2000)
    };
    patched.chars().count().abs_diff(base) > max_diff
}

/// Match the original file's trailing-newline convention so diffs
/// stay minimal.
fn match_trailing_newline(original: &str, mut content: String) -> String {
    if original.ends_with('\n') {
        if !content.ends_with('\n') {
            content.push('\n');
        }
    } else {
        while content.ends_with('\n') {
            content.pop();
        }
    }
    content
}

#[async_trait]
impl FixEngine for RepairEngine {
    async fn attempt_fix(
        &self,
        repo: &Path,
        file: &str,
        bug: BugType,
        failures: &[Failure],
    ) -> FixAttempt {
        if failures.is_empty() {
            return FixAttempt::failed("none", "no failures to fix".to_string());
        }
        let path = repo.join(file);
        let language = Language::from_path(file);
        let original = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                return FixAttempt::failed("none", format!("file unreadable: {}", e));
            }
        };

        let mut debug: BTreeMap<String, String> = BTreeMap::new();

        // Tool-first: mechanically solvable classes never reach a
        // provider when a fixer succeeds.
        match tools::apply_first_fixer(&path, repo, language, bug) {
            Ok(Some(tool)) => {
                debug.insert("strategy".to_string(), format!("tool:{}", tool));
                debug.insert("validation".to_string(), "ok".to_string());
                let fixed = fs::read_to_string(&path).unwrap_or_default();
                self.history.record(bug, &failures[0].message, &fixed, true);
                return FixAttempt {
                    fixed: true,
                    origin: tool,
                    providers: Vec::new(),
                    error: None,
                    debug,
                };
            }
            Ok(None) => {}
            Err(e) => {
                debug.insert("tool_error".to_string(), e.to_string());
            }
        }

        // Ensemble path.
        let plan = selector::plan_for(bug, &self.providers);
        if !plan.is_empty() {
            debug.insert("ensemble_plan".to_string(), plan.describe());
        }
        let mypy = if bug == BugType::TypeError && language == Language::Python {
            tools::mypy_context(&path, repo)
        } else {
            None
        };
        let few_shot = self.history.few_shot(bug, FEW_SHOT_LIMIT);
        let system = prompt::fix_system_prompt(language.name());
        let user =
            prompt::fix_user_prompt(file, bug, failures, &original, &few_shot, mypy.as_deref());

        match ensemble::generate_fix(
            &plan,
            file,
            &original,
            &system,
            &user,
            language,
            self.api_timeout,
        )
        .await
        {
            Ok(outcome) => {
                if patch_oversized(&original, &outcome.content, failures.len()) {
                    self.history.record(bug, &failures[0].message, "", false);
                    let mut attempt =
                        FixAttempt::failed("ensemble", "patch too large (guardrail)".to_string());
                    attempt.debug.append(&mut debug);
                    return attempt;
                }
                let content = match_trailing_newline(&original, outcome.content);
                if let Err(e) = fs::write(&path, &content) {
                    return FixAttempt::failed("ensemble", format!("write failed: {}", e));
                }
                debug.insert("strategy".to_string(), "ensemble".to_string());
                debug.insert("validation".to_string(), "ok".to_string());
                if outcome.repair_rounds > 0 {
                    debug.insert("repair_rounds".to_string(), outcome.repair_rounds.to_string());
                }
                for (key, value) in &outcome.raw {
                    debug.insert(format!("raw:{}", key), value.clone());
                }
                self.history.record(bug, &failures[0].message, &content, true);
                FixAttempt {
                    fixed: true,
                    origin: "ensemble".to_string(),
                    providers: outcome.providers,
                    error: None,
                    debug,
                }
            }
            Err(e) => {
                self.history.record(bug, &failures[0].message, "", false);
                let mut attempt = FixAttempt::failed("ensemble", e.to_string());
                attempt.debug.append(&mut debug);
                attempt.debug.insert("error_kind".to_string(), e.kind().to_string());
                attempt
            }
        }
    }
}

/// One (file, bug class) batch: every failure of that class in the
/// file is fixed in a single attempt and locked together.
struct WorkItem {
    file: String,
    bug: BugType,
    failures: Vec<Failure>,
    lines: Vec<u32>,
}

fn group_work_items(sorted: &[Failure]) -> Vec<WorkItem> {
    let mut order: Vec<(String, BugType)> = Vec::new();
    let mut buckets: HashMap<(String, BugType), Vec<Failure>> = HashMap::new();
    for f in sorted {
        let key = (f.file.clone(), classify(&f.message, f.language));
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(f.clone());
    }
    order
        .into_iter()
        .map(|key| {
            let failures = buckets.remove(&key).unwrap_or_default();
            let mut lines: Vec<u32> = failures.iter().filter_map(|f| f.line).collect();
            lines.sort_unstable();
            lines.dedup();
            WorkItem {
                file: key.0,
                bug: key.1,
                failures,
                lines,
            }
        })
        .collect()
}

/// Merge a fix record, replacing an earlier failed record for the
/// same site so (file, line) stays unique across the report.
fn merge_record(fixes: &mut Vec<FixRecord>, record: FixRecord) {
    if let Some(pos) = fixes.iter().position(|r| {
        r.site() == record.site() && r.debug.get("status").map(|s| s == "failed").unwrap_or(false)
    }) {
        fixes.remove(pos);
    }
    fixes.push(record);
}

/// Run the iterative healing loop against an already cloned checkout.
pub async fn heal_loop<R, V, F>(
    request: &RunRequest,
    repo: &Path,
    runner: &R,
    vcs: &V,
    engine: &F,
    cfg: &Config,
) -> RunReport
where
    R: Runner + ?Sized,
    V: Vcs + ?Sized,
    F: FixEngine + ?Sized,
{
    let start = Instant::now();
    let branch = git_ops::branch_name(&request.team_name, &request.team_leader);
    let mut report = RunReport::new(request, &branch, cfg.retry_limit);

    let mut fix_sites: HashSet<(String, Option<u32>)> = HashSet::new();
    let mut unique_failures: HashSet<(String, Option<u32>, BugType)> = HashSet::new();
    let mut prior_counts: Vec<usize> = Vec::new();
    let mut last_snapshot: Option<String> = None;
    let mut pre_rollback_done: Option<usize> = None;
    let mut commits_made: usize = 0;
    let mut iteration: usize = 0;

    while iteration < cfg.retry_limit {
        if start.elapsed() >= cfg.run_deadline {
            report.error = Some("wall clock cap reached".to_string());
            break;
        }
        iteration += 1;

        let failures = match runner.run(repo) {
            Ok(failures) => failures,
            Err(e) => {
                report.error = Some(e.to_string());
                break;
            }
        };
        let mut failures = failure::dedupe(failures);
        for f in &failures {
            unique_failures.insert((f.file.clone(), f.line, classify(&f.message, f.language)));
        }
        let errors_before = failures.len();

        let snapshot = match vcs.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                report.error = Some(format!("snapshot failed: {}", e));
                break;
            }
        };

        if errors_before == 0 {
            report
                .timeline
                .push(IterationRecord::new(iteration, 0, Decision::Passed, &snapshot));
            report.ci_status = CiStatus::Passed;
            break;
        }

        // Convergence: two consecutive iterations with this same
        // pre-fix count means the loop is churning without progress.
        let n = prior_counts.len();
        if n >= 2 && prior_counts[n - 1] == errors_before && prior_counts[n - 2] == errors_before {
            report.timeline.push(
                IterationRecord::new(iteration, errors_before, Decision::Stuck, &snapshot)
                    .with_reason("convergence_stuck"),
            );
            break;
        }

        // Latent regression: a jump well past the previous count
        // means the prior iteration's patches are poisoning the tree.
        if let (Some(&prev), Some(prev_snapshot)) = (prior_counts.last(), last_snapshot.as_ref()) {
            if pre_rollback_done != Some(iteration)
                && errors_before as f64 > prev as f64 * REGRESSION_FACTOR
            {
                warn!(
                    errors_before,
                    prev, "failure spike detected, rolling back previous iteration"
                );
                if vcs.reset_to(prev_snapshot).is_ok() {
                    report.regressions_prevented += 1;
                    pre_rollback_done = Some(iteration);
                    iteration -= 1;
                    continue;
                }
            }
        }

        prior_counts.push(errors_before);
        last_snapshot = Some(snapshot.clone());
        info!(iteration, errors_before, "healing iteration starting");

        failure::sort_by_severity(&mut failures);
        let items = group_work_items(&failures);

        let mut applied_records: Vec<FixRecord> = Vec::new();
        let mut failed_records: Vec<FixRecord> = Vec::new();
        let mut locked_this_iter: Vec<(String, Option<u32>)> = Vec::new();

        for item in items {
            if item.failures.iter().all(|f| fix_sites.contains(&f.site())) {
                continue;
            }
            let attempt = engine.attempt_fix(repo, &item.file, item.bug, &item.failures).await;
            let lead = &item.failures[0];
            let mut debug = attempt.debug.clone();
            debug.insert("origin".to_string(), attempt.origin.clone());

            if attempt.fixed {
                for f in &item.failures {
                    if fix_sites.insert(f.site()) {
                        locked_this_iter.push(f.site());
                    }
                }
                applied_records.push(FixRecord {
                    file: item.file.clone(),
                    bug_type: item.bug,
                    line: lead.line,
                    all_lines: item.lines.clone(),
                    error_message: lead.message.clone(),
                    commit_message: fix_commit_message(item.bug, &item.file),
                    providers_used: attempt.providers,
                    debug,
                });
            } else {
                if let Some(error) = &attempt.error {
                    debug.insert("error".to_string(), error.clone());
                }
                failed_records.push(FixRecord {
                    file: item.file.clone(),
                    bug_type: item.bug,
                    line: lead.line,
                    all_lines: item.lines.clone(),
                    error_message: lead.message.clone(),
                    commit_message: String::new(),
                    providers_used: attempt.providers,
                    debug,
                });
            }
        }

        // One commit per iteration.
        let mut committed = false;
        let mut pushed = false;
        if !applied_records.is_empty() {
            let message = if applied_records.len() == 1 {
                applied_records[0].commit_message.clone()
            } else {
                format!(
                    "{}iteration {} fixes ({} sites)",
                    COMMIT_PREFIX,
                    iteration,
                    applied_records.len()
                )
            };
            match vcs.commit_all(&message) {
                Ok(Some(_sha)) => {
                    commits_made += 1;
                    committed = true;
                    match vcs.push(&branch).await {
                        Ok(()) => pushed = true,
                        Err(e) => {
                            // Push failures are terminal for the run.
                            report.error = Some(e.to_string());
                            report.timeline.push(
                                IterationRecord::new(
                                    iteration,
                                    errors_before,
                                    Decision::Applied,
                                    &snapshot,
                                )
                                .with_reason("push_failed"),
                            );
                            for record in applied_records {
                                merge_record(&mut report.fixes, record);
                            }
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("commit failed: {}", e);
                }
            }
        }

        let errors_after = match runner.run(repo) {
            Ok(failures) => failure::dedupe(failures).len(),
            Err(e) => {
                report.error = Some(e.to_string());
                break;
            }
        };

        if errors_after > errors_before {
            // Regression: restore the snapshot, retract this
            // iteration's records and locks.
            if let Err(e) = vcs.reset_to(&snapshot) {
                report.error = Some(format!("rollback failed: {}", e));
            }
            for site in &locked_this_iter {
                fix_sites.remove(site);
            }
            if committed {
                commits_made -= 1;
            }
            report.regressions_prevented += 1;
            report.timeline.push(
                IterationRecord::new(iteration, errors_before, Decision::RolledBack, &snapshot)
                    .with_after(errors_after)
                    .with_reason("patch_introduced_regression"),
            );
            for record in failed_records {
                merge_record(&mut report.fixes, record);
            }
            continue;
        }

        report.total_fixes_applied += applied_records.len();
        for record in applied_records {
            merge_record(&mut report.fixes, record);
        }
        for record in failed_records {
            merge_record(&mut report.fixes, record);
        }
        report.timeline.push(
            IterationRecord::new(iteration, errors_before, Decision::Applied, &snapshot)
                .with_after(errors_after),
        );

        if errors_after == 0 {
            report.ci_status = CiStatus::Passed;
            break;
        }

        // Upstream CI short-circuit after a successful push.
        if pushed {
            if let Some(token) = &cfg.github_token {
                let outcome = github::wait_for_workflow_runs(
                    &request.repo_url,
                    &branch,
                    token,
                    cfg.ci_timeout,
                )
                .await;
                report.github_ci = Some(GithubCi {
                    status: outcome.conclusion.as_str().to_string(),
                    message: outcome.message,
                });
                if outcome.conclusion == CiConclusion::Success {
                    report.ci_status = CiStatus::Passed;
                    break;
                }
            }
        }
    }

    report.total_failures_detected = unique_failures.len();
    report.total_time_seconds = start.elapsed().as_secs();
    report.score = Score::compute(report.total_time_seconds, commits_made);
    info!(
        ci_status = ?report.ci_status,
        fixes = report.total_fixes_applied,
        regressions_prevented = report.regressions_prevented,
        "healing run finished"
    );
    report
}

/// Full run lifecycle: workspace, clone, branch, loop, teardown.
/// Clone failures are terminal but still produce a FAILED report;
/// only configuration problems surface as errors.
pub async fn run_healing(
    request: RunRequest,
    cfg: &Config,
    providers: Vec<Arc<dyn LlmClient>>,
) -> Result<RunReport, AgentError> {
    if providers.is_empty() {
        return Err(AgentError::Config("no providers supplied".to_string()));
    }
    let branch = git_ops::branch_name(&request.team_name, &request.team_leader);
    let token = request.auth_token.clone().or_else(|| cfg.github_token.clone());

    let repo_path = match git_ops::clone_repo(&request.repo_url, &cfg.workspace, token.as_deref())
    {
        Ok(path) => path,
        Err(e) => {
            let mut report = RunReport::new(&request, &branch, cfg.retry_limit);
            report.error = Some(e.to_string());
            return Ok(report);
        }
    };

    if let Err(e) = git_ops::create_and_checkout_branch(&repo_path, &branch) {
        let mut report = RunReport::new(&request, &branch, cfg.retry_limit);
        report.error = Some(format!("branch setup failed: {}", e));
        let _ = fs::remove_dir_all(&repo_path);
        return Ok(report);
    }
    info!(
        branch = %git_ops::current_branch(&repo_path).unwrap_or_else(|_| branch.clone()),
        repo = %request.repo_url,
        "checkout ready"
    );

    let vcs = GitVcs::new(&repo_path, &request.repo_url, token.clone());
    let engine = RepairEngine::new(providers, HistoryLog::new(&cfg.workspace), cfg.api_timeout);
    let mut loop_cfg = cfg.clone();
    loop_cfg.github_token = token;

    let report = heal_loop(&request, &repo_path, &ProcessRunner, &vcs, &engine, &loop_cfg).await;

    if let Ok(json) = serde_json::to_string_pretty(&report) {
        let _ = fs::write(cfg.workspace.join("results.json"), json);
    }
    let _ = fs::remove_dir_all(&repo_path);
    Ok(report)
}
