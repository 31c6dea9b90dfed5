//! Environment configuration for the healing agent
//!
//! Everything is read once at startup. At least one LLM provider
//! credential must be present or initialization refuses to proceed.

use crate::error::AgentError;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-LLM-call deadline in seconds.
const DEFAULT_API_TIMEOUT_SECS: u64 = 25;
/// Default upstream CI polling budget in seconds.
const DEFAULT_CI_TIMEOUT_SECS: u64 = 300;
/// Whole-run wall clock cap in seconds.
const RUN_DEADLINE_SECS: u64 = 900;
/// Default iteration budget for the healing loop.
const DEFAULT_RETRY_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub openrouter_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub ollama_base_url: String,
    pub ollama_enabled: bool,
    /// Enables private clones, fork-on-push and Actions polling.
    pub github_token: Option<String>,
    pub retry_limit: usize,
    pub workspace: PathBuf,
    pub api_timeout: Duration,
    pub ci_timeout: Duration,
    pub run_deadline: Duration,
}

fn env_nonempty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_nonempty(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            openrouter_api_key: env_nonempty("OPENROUTER_API_KEY"),
            openai_api_key: env_nonempty("OPENAI_API_KEY"),
            gemini_api_key: env_nonempty("GOOGLE_API_KEY"),
            groq_api_key: env_nonempty("GROQ_API_KEY"),
            ollama_base_url: env_nonempty("OLLAMA_BASE_URL")
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string()),
            ollama_enabled: env_nonempty("OLLAMA_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            github_token: env_nonempty("GITHUB_TOKEN"),
            retry_limit: env_parse("AGENT_RETRY_LIMIT", DEFAULT_RETRY_LIMIT),
            workspace: PathBuf::from(
                env_nonempty("AGENT_WORKSPACE").unwrap_or_else(|| "./workspace".to_string()),
            ),
            api_timeout: Duration::from_secs(env_parse("API_TIMEOUT", DEFAULT_API_TIMEOUT_SECS)),
            ci_timeout: Duration::from_secs(env_parse(
                "GITHUB_CI_TIMEOUT",
                DEFAULT_CI_TIMEOUT_SECS,
            )),
            run_deadline: Duration::from_secs(RUN_DEADLINE_SECS),
        }
    }

    /// True when at least one LLM provider credential is configured.
    pub fn has_provider(&self) -> bool {
        self.openrouter_api_key.is_some()
            || self.openai_api_key.is_some()
            || self.gemini_api_key.is_some()
            || self.groq_api_key.is_some()
            || self.ollama_enabled
    }

    /// Refuse to initialize without a provider.
    pub fn validate(&self) -> Result<(), AgentError> {
        if !self.has_provider() {
            return Err(AgentError::Config(
                "no LLM provider configured; set at least one of OPENROUTER_API_KEY, \
                 OPENAI_API_KEY, GOOGLE_API_KEY, GROQ_API_KEY or OLLAMA_ENABLED=true"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            openai_api_key: None,
            gemini_api_key: None,
            groq_api_key: None,
            ollama_base_url: "http://localhost:11434/v1".to_string(),
            ollama_enabled: false,
            github_token: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            workspace: PathBuf::from("./workspace"),
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            ci_timeout: Duration::from_secs(DEFAULT_CI_TIMEOUT_SECS),
            run_deadline: Duration::from_secs(RUN_DEADLINE_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let cfg = Config::default();
        assert_eq!(cfg.retry_limit, 5);
        assert_eq!(cfg.api_timeout, Duration::from_secs(25));
        assert_eq!(cfg.ci_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_no_provider_is_a_config_error() {
        let cfg = Config::default();
        assert!(!cfg.has_provider());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_any_single_key_satisfies_validation() {
        let cfg = Config {
            groq_api_key: Some("gsk_test".to_string()),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
