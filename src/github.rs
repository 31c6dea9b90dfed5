//! GitHub API integration
//!
//! Two concerns: forking a repository the token's user cannot push
//! to, and polling Actions workflow runs for a branch after a push.
//! Both are best-effort collaborators of the healing loop; failures
//! here never crash a run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const API_BASE: &str = "https://api.github.com";
const API_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Workflows take a few seconds to appear after a push.
const INITIAL_GRACE: Duration = Duration::from_secs(5);

/// Extract (owner, repo) from a GitHub remote URL.
///
/// Supports `git@github.com:owner/repo.git`,
/// `https://github.com/owner/repo.git` and the same without suffix.
pub fn parse_repo_url(repo_url: &str) -> Option<(String, String)> {
    if let Some(rest) = repo_url.strip_prefix("git@github.com:") {
        let path = rest.trim_end_matches('/').trim_end_matches(".git");
        let mut parts = path.splitn(2, '/');
        let owner = parts.next()?.to_string();
        let repo = parts.next()?.to_string();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        return Some((owner, repo));
    }

    if repo_url.contains("github.com") {
        let parsed = url::Url::parse(repo_url).ok()?;
        if parsed.host_str() != Some("github.com") && parsed.host_str() != Some("www.github.com") {
            return None;
        }
        let path = parsed.path().trim_matches('/').trim_end_matches(".git");
        let mut parts = path.splitn(2, '/');
        let owner = parts.next()?.to_string();
        let repo = parts.next()?.split('/').next()?.to_string();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        return Some((owner, repo));
    }

    None
}

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(API_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

fn authed(builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
    builder
        .header("Accept", "application/vnd.github+json")
        .header("Authorization", format!("Bearer {}", token))
        .header("User-Agent", "mender-agent")
        .header("X-GitHub-Api-Version", "2022-11-28")
}

#[derive(Deserialize)]
struct User {
    login: String,
}

async fn authenticated_user(client: &reqwest::Client, token: &str) -> Result<String> {
    let user: User = authed(client.get(format!("{}/user", API_BASE)), token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(user.login)
}

#[derive(Deserialize)]
struct ForkResponse {
    owner: ForkOwner,
    name: String,
}

#[derive(Deserialize)]
struct ForkOwner {
    login: String,
}

/// Make sure the token's user has a pushable copy of the repository.
/// Returns the clone URL to push to: the original when the user owns
/// it, otherwise an existing or freshly created fork.
pub async fn ensure_fork(repo_url: &str, token: &str) -> Result<String> {
    let (owner, repo) = parse_repo_url(repo_url)
        .ok_or_else(|| anyhow::anyhow!("not a GitHub repository URL: {}", repo_url))?;
    let client = client()?;
    let user = authenticated_user(&client, token).await?;

    if owner.eq_ignore_ascii_case(&user) {
        return Ok(repo_url.to_string());
    }

    // An existing fork under the user's account wins.
    let existing = authed(
        client.get(format!("{}/repos/{}/{}", API_BASE, user, repo)),
        token,
    )
    .send()
    .await;
    if let Ok(resp) = existing {
        if resp.status().is_success() {
            debug!(%user, %repo, "reusing existing fork");
            return Ok(format!("https://github.com/{}/{}.git", user, repo));
        }
    }

    let fork: ForkResponse = authed(
        client.post(format!("{}/repos/{}/{}/forks", API_BASE, owner, repo)),
        token,
    )
    .send()
    .await?
    .error_for_status()
    .context("fork request rejected")?
    .json()
    .await?;

    // Forks materialize asynchronously.
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!(owner = %fork.owner.login, repo = %fork.name, "created fork");
    Ok(format!(
        "https://github.com/{}/{}.git",
        fork.owner.login, fork.name
    ))
}

/// Terminal state of an upstream CI wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiConclusion {
    Success,
    Failure,
    Timeout,
    NoWorkflows,
    Error,
}

impl CiConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiConclusion::Success => "success",
            CiConclusion::Failure => "failure",
            CiConclusion::Timeout => "timeout",
            CiConclusion::NoWorkflows => "no_workflows",
            CiConclusion::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CiOutcome {
    pub conclusion: CiConclusion,
    pub message: String,
}

#[derive(Deserialize)]
struct WorkflowRuns {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct WorkflowRun {
    #[serde(default)]
    head_branch: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
}

fn runs_settled(runs: &[&WorkflowRun]) -> Option<bool> {
    let mut any_failure = false;
    for run in runs {
        match run.status.as_deref() {
            Some("queued") | Some("in_progress") | Some("pending") | Some("waiting")
            | Some("requested") => return None,
            _ => {}
        }
        if matches!(
            run.conclusion.as_deref(),
            Some("failure") | Some("cancelled") | Some("timed_out")
        ) {
            any_failure = true;
        }
    }
    Some(any_failure)
}

/// Poll GitHub Actions for the branch's push-triggered workflow runs
/// until they all complete or the timeout elapses.
pub async fn wait_for_workflow_runs(
    repo_url: &str,
    branch: &str,
    token: &str,
    timeout: Duration,
) -> CiOutcome {
    let Some((owner, repo)) = parse_repo_url(repo_url) else {
        return CiOutcome {
            conclusion: CiConclusion::Error,
            message: "Invalid GitHub URL".to_string(),
        };
    };
    let Ok(client) = client() else {
        return CiOutcome {
            conclusion: CiConclusion::Error,
            message: "HTTP client unavailable".to_string(),
        };
    };

    let url = format!(
        "{}/repos/{}/{}/actions/runs?branch={}&per_page=10&event=push",
        API_BASE,
        owner,
        repo,
        urlencode(branch)
    );

    let started = tokio::time::Instant::now();
    tokio::time::sleep(INITIAL_GRACE).await;

    let mut saw_runs = false;
    while started.elapsed() < timeout {
        let runs: Option<WorkflowRuns> = match authed(client.get(&url), token).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            _ => None,
        };

        if let Some(runs) = runs {
            let branch_runs: Vec<&WorkflowRun> = runs
                .workflow_runs
                .iter()
                .filter(|r| r.head_branch.as_deref() == Some(branch))
                .collect();
            if !branch_runs.is_empty() {
                saw_runs = true;
                if let Some(any_failure) = runs_settled(&branch_runs) {
                    let conclusion = if any_failure {
                        CiConclusion::Failure
                    } else {
                        CiConclusion::Success
                    };
                    return CiOutcome {
                        conclusion,
                        message: format!("{} workflow(s) completed", branch_runs.len()),
                    };
                }
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if saw_runs {
        CiOutcome {
            conclusion: CiConclusion::Timeout,
            message: "Timeout waiting for workflows".to_string(),
        }
    } else {
        CiOutcome {
            conclusion: CiConclusion::NoWorkflows,
            message: "No workflow runs found".to_string(),
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
            out.push(c);
        } else {
            for byte in c.to_string().as_bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    out
}
