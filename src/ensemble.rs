//! Ensemble engine
//!
//! Issues the plan's W prompts in parallel under a shared deadline,
//! validates the responses, and picks a winner: majority vote on
//! whitespace-normalized bytes first, then longest valid response,
//! ties broken by provider priority. When every response fails
//! validation, the highest-priority provider is re-prompted with its
//! own invalid output for up to three repair rounds.

use crate::error::AgentError;
use crate::failure::Language;
use crate::prompt;
use crate::selector::EnsemblePlan;
use crate::validate;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Responses shorter than this are conversational refuse/leakage,
/// never a file.
const MIN_RESPONSE_CHARS: usize = 10;

/// Repair attempts after a round where nothing validated.
const MAX_REPAIR_ROUNDS: usize = 3;

/// Raw-response excerpt length kept for the debug map.
const RAW_EXCERPT_CHARS: usize = 200;

#[derive(Debug)]
pub struct EnsembleOutcome {
    /// Winning file contents, already stripped of tags and fences.
    pub content: String,
    /// Providers that contributed the winning response (all members
    /// of the majority group, or the single winner).
    pub providers: Vec<String>,
    /// Per-call excerpts keyed "Provider(model)".
    pub raw: BTreeMap<String, String>,
    pub repair_rounds: usize,
}

struct Collected {
    priority: usize,
    provider: String,
    content: String,
    normalized: String,
}

enum Checked {
    Valid(Collected),
    Invalid { content: String, error: String },
}

fn check_response(priority: usize, provider: &str, raw: &str, language: Language) -> Checked {
    let content = prompt::extract_code(raw);
    if content.chars().count() < MIN_RESPONSE_CHARS {
        return Checked::Invalid {
            content,
            error: "response too short to be a file".to_string(),
        };
    }
    match validate::check_source(&content, language) {
        Ok(()) => Checked::Valid(Collected {
            priority,
            provider: provider.to_string(),
            normalized: prompt::normalize_whitespace(&content),
            content,
        }),
        Err(e) => Checked::Invalid {
            content,
            error: e.to_string(),
        },
    }
}

/// Group the valid responses and pick the winner per the
/// reconciliation rules. Returns (content, contributing providers).
fn reconcile(mut valid: Vec<Collected>) -> Option<(String, Vec<String>)> {
    if valid.is_empty() {
        return None;
    }
    valid.sort_by_key(|v| v.priority);
    if valid.len() == 1 {
        let only = valid.remove(0);
        return Some((only.content, vec![only.provider]));
    }

    // Majority vote on whitespace-normalized bytes.
    let mut groups: BTreeMap<&str, Vec<&Collected>> = BTreeMap::new();
    for v in &valid {
        groups.entry(v.normalized.as_str()).or_default().push(v);
    }
    let best_group_len = groups.values().map(|g| g.len()).max().unwrap_or(0);
    if best_group_len >= 2 {
        // Among tied groups, the one holding the highest-priority
        // provider wins (members are already priority-sorted).
        let group = groups
            .values()
            .filter(|g| g.len() == best_group_len)
            .min_by_key(|g| g[0].priority)?;
        return Some((
            group[0].content.clone(),
            group.iter().map(|v| v.provider.clone()).collect(),
        ));
    }

    // No majority: longest valid response as a proxy for
    // completeness, priority breaking exact-length ties.
    let winner = valid
        .iter()
        .max_by(|a, b| {
            a.content
                .chars()
                .count()
                .cmp(&b.content.chars().count())
                .then(b.priority.cmp(&a.priority))
        })?;
    Some((winner.content.clone(), vec![winner.provider.clone()]))
}

/// Run the ensemble for one fix attempt.
///
/// `file` and `original` feed the self-repair prompt; `language`
/// selects the validator.
pub async fn generate_fix(
    plan: &EnsemblePlan,
    file: &str,
    original: &str,
    system: &str,
    user: &str,
    language: Language,
    deadline: Duration,
) -> Result<EnsembleOutcome, AgentError> {
    if plan.is_empty() {
        return Err(AgentError::Provider {
            provider: "registry".to_string(),
            message: "no provider available for this bug class".to_string(),
        });
    }

    let mut raw: BTreeMap<String, String> = BTreeMap::new();
    let mut valid: Vec<Collected> = Vec::new();
    let mut last_invalid: Option<(String, String)> = None;
    let mut errors: Vec<String> = Vec::new();

    let mut set = JoinSet::new();
    for candidate in &plan.candidates {
        let provider = Arc::clone(&candidate.provider);
        let model = candidate.model.clone();
        let system = system.to_string();
        let user = user.to_string();
        let priority = candidate.priority;
        set.spawn(async move {
            let result = provider.send_prompt(&model, &system, &user, deadline).await;
            (priority, provider.name().to_string(), model, result)
        });
    }

    let width = plan.width();
    let deadline_at = tokio::time::Instant::now() + deadline;
    let mut outstanding = width;
    loop {
        let joined = tokio::select! {
            _ = tokio::time::sleep_until(deadline_at) => {
                warn!(bug = %plan.bug, "ensemble deadline reached with {} call(s) outstanding", outstanding);
                set.abort_all();
                break;
            }
            joined = set.join_next() => joined,
        };
        let Some(joined) = joined else { break };
        let Ok((priority, provider, model, result)) = joined else { continue };
        outstanding -= 1;

        let key = format!("{}({})", provider, model);
        match result {
            Ok(response) => {
                raw.insert(key, prompt::truncate(&response, RAW_EXCERPT_CHARS));
                match check_response(priority, &provider, &response, language) {
                    Checked::Valid(v) => valid.push(v),
                    Checked::Invalid { content, error } => {
                        debug!(provider = %provider, %error, "ensemble response rejected");
                        last_invalid = Some((content, error));
                    }
                }
            }
            Err(e) => {
                raw.insert(key, format!("ERROR: {}", e));
                errors.push(e.to_string());
            }
        }

        // Early termination: a whitespace-identical majority that the
        // remaining calls can no longer outvote is already decided.
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for v in &valid {
            *counts.entry(v.normalized.as_str()).or_default() += 1;
        }
        let top = counts.values().copied().max().unwrap_or(0);
        let runner_up = counts
            .values()
            .copied()
            .filter(|&c| c != top)
            .max()
            .unwrap_or(0);
        if top >= 2 && top > runner_up + outstanding {
            set.abort_all();
            break;
        }
    }

    if let Some((content, providers)) = reconcile(std::mem::take(&mut valid)) {
        return Ok(EnsembleOutcome { content, providers, raw, repair_rounds: 0 });
    }

    // Nothing came back at all: report failure.
    let Some((mut broken, mut check_error)) = last_invalid else {
        return Err(AgentError::Provider {
            provider: plan
                .candidates
                .first()
                .map(|c| c.provider.name().to_string())
                .unwrap_or_default(),
            message: errors
                .first()
                .cloned()
                .unwrap_or_else(|| "no response before deadline".to_string()),
        });
    };

    // Self-repair: re-prompt the highest-priority provider with its
    // invalid output, bounded rounds.
    let primary = &plan.candidates[0];
    for round in 1..=MAX_REPAIR_ROUNDS {
        let repair_user = prompt::repair_user_prompt(file, original, &broken, &check_error);
        let key = format!("{}({}) repair#{}", primary.provider.name(), primary.model, round);
        match primary
            .provider
            .send_prompt(&primary.model, system, &repair_user, deadline)
            .await
        {
            Ok(response) => {
                raw.insert(key, prompt::truncate(&response, RAW_EXCERPT_CHARS));
                match check_response(0, primary.provider.name(), &response, language) {
                    Checked::Valid(v) => {
                        return Ok(EnsembleOutcome {
                            content: v.content,
                            providers: vec![v.provider],
                            raw,
                            repair_rounds: round,
                        });
                    }
                    Checked::Invalid { content, error } => {
                        broken = content;
                        check_error = error;
                    }
                }
            }
            Err(e) => {
                raw.insert(key, format!("ERROR: {}", e));
            }
        }
    }

    Err(AgentError::Validation {
        checker: "ensemble".to_string(),
        message: check_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::BugType;
    use crate::providers::{Capability, LlmClient};
    use crate::selector::{Candidate, Role};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        name: &'static str,
        responses: Vec<Result<String, String>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl StubClient {
        fn ok(name: &'static str, response: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                responses: vec![Ok(response.to_string())],
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                responses: vec![Err("connection timed out".to_string())],
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn sequence(name: &'static str, responses: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                responses,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl LlmClient for StubClient {
        fn name(&self) -> &str {
            self.name
        }
        fn capability(&self) -> Capability {
            Capability::Reasoning
        }
        async fn send_prompt(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = call.min(self.responses.len() - 1);
            match &self.responses[idx] {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn plan_of(clients: Vec<Arc<StubClient>>) -> EnsemblePlan {
        let candidates = clients
            .into_iter()
            .enumerate()
            .map(|(i, c)| Candidate {
                provider: c as Arc<dyn LlmClient>,
                model: "stub-model".to_string(),
                role: if i == 0 { Role::Primary } else { Role::Secondary },
                priority: i,
            })
            .collect();
        EnsemblePlan { bug: BugType::Logic, candidates }
    }

    async fn run(plan: &EnsemblePlan) -> Result<EnsembleOutcome, AgentError> {
        generate_fix(
            plan,
            "main.tcl",
            "original contents here\n",
            "system",
            "user",
            Language::Unknown,
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn test_majority_vote_wins_over_different_patch() {
        let shared = "result = compute(a, b)\nreturn result\n";
        let shared_reformatted = "result   = compute(a, b)\n\nreturn   result\n";
        let plan = plan_of(vec![
            StubClient::ok("alpha", shared),
            StubClient::ok("beta", "something completely different but also long"),
            StubClient::ok("gamma", shared_reformatted),
        ]);
        let outcome = run(&plan).await.unwrap();
        assert_eq!(outcome.content, shared);
        let mut providers = outcome.providers.clone();
        providers.sort();
        assert_eq!(providers, vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_single_valid_response_is_picked() {
        let plan = plan_of(vec![
            StubClient::ok("alpha", "the one valid response body"),
            StubClient::failing("beta"),
        ]);
        let outcome = run(&plan).await.unwrap();
        assert_eq!(outcome.providers, vec!["alpha"]);
        assert!(outcome.raw.values().any(|v| v.starts_with("ERROR:")));
    }

    #[tokio::test]
    async fn test_longest_valid_wins_without_majority() {
        let plan = plan_of(vec![
            StubClient::ok("alpha", "short response"),
            StubClient::ok("beta", "a much longer response that should win on completeness"),
        ]);
        let outcome = run(&plan).await.unwrap();
        assert_eq!(outcome.providers, vec!["beta"]);
    }

    #[tokio::test]
    async fn test_provider_outage_reports_failure_without_crash() {
        let plan = plan_of(vec![StubClient::failing("alpha")]);
        let err = run(&plan).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider { .. }));
    }

    #[tokio::test]
    async fn test_self_repair_recovers_from_short_garbage() {
        let plan = plan_of(vec![StubClient::sequence(
            "alpha",
            vec![
                Ok("nope".to_string()),
                Ok("repaired = file_contents(now, valid)\n".to_string()),
            ],
        )]);
        let outcome = run(&plan).await.unwrap();
        assert_eq!(outcome.repair_rounds, 1);
        assert!(outcome.content.starts_with("repaired"));
    }

    #[tokio::test]
    async fn test_repair_rounds_are_bounded() {
        let plan = plan_of(vec![StubClient::sequence(
            "alpha",
            vec![Ok("bad".to_string())],
        )]);
        let err = run(&plan).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_slow_providers() {
        let slow = Arc::new(StubClient {
            name: "slow",
            responses: vec![Ok("slow but valid response body".to_string())],
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(60),
        });
        let plan = plan_of(vec![slow]);
        let err = generate_fix(
            &plan,
            "f",
            "orig",
            "s",
            "u",
            Language::Unknown,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Provider { .. }));
    }
}
