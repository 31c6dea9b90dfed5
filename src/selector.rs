//! Model selection
//!
//! Maps a bug class to an ordered list of (provider, model)
//! candidates and an ensemble width. Reasoning-heavy classes fan out
//! wide; mechanical classes get a single fast model.

use crate::failure::BugType;
use crate::providers::{Capability, LlmClient};
use std::sync::Arc;

/// Role a candidate plays in the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

pub struct Candidate {
    pub provider: Arc<dyn LlmClient>,
    pub model: String,
    pub role: Role,
    /// Position in the preferred order; lower wins reconciliation
    /// tie-breaks.
    pub priority: usize,
}

pub struct EnsemblePlan {
    pub bug: BugType,
    pub candidates: Vec<Candidate>,
}

impl EnsemblePlan {
    pub fn width(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// One-line description of the slots, kept in fix debug maps.
    pub fn describe(&self) -> String {
        self.candidates
            .iter()
            .map(|c| format!("{} {}:{}", c.role.as_str(), c.provider.name(), c.model))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Desired capability per slot, in preference order. LINTING is
/// normally handled entirely by tools; the single fast slot here only
/// matters when every tool failed and control falls back to the
/// ensemble.
fn slot_capabilities(bug: BugType) -> &'static [Capability] {
    match bug {
        BugType::Logic => &[Capability::Reasoning, Capability::Reasoning, Capability::Reasoning],
        BugType::TypeError => &[Capability::Reasoning, Capability::Reasoning],
        BugType::Syntax => &[Capability::Reasoning, Capability::Fast],
        BugType::Import => &[Capability::Fast],
        BugType::Indentation => &[Capability::Fast],
        BugType::Linting => &[Capability::Fast],
    }
}

/// Preferred model per provider for a reasoning slot.
fn reasoning_model(provider: &str) -> &'static str {
    match provider {
        "OpenRouter" => "anthropic/claude-3.5-sonnet",
        "OpenAI" => "gpt-4o",
        "Groq" => "llama-3.3-70b-versatile",
        "Gemini" => "gemini-1.5-pro",
        "Ollama" => "codellama",
        _ => "gpt-4o",
    }
}

/// Preferred model per provider for a fast slot.
fn fast_model(provider: &str) -> &'static str {
    match provider {
        "OpenRouter" => "openai/gpt-4o-mini",
        "OpenAI" => "gpt-4o-mini",
        "Groq" => "llama-3.1-8b-instant",
        "Gemini" => "gemini-2.0-flash",
        "Ollama" => "llama3.2",
        _ => "gpt-4o-mini",
    }
}

fn model_for(provider: &dyn LlmClient, wanted: Capability) -> String {
    match wanted {
        Capability::Reasoning | Capability::Code => reasoning_model(provider.name()).to_string(),
        Capability::Fast | Capability::Local => fast_model(provider.name()).to_string(),
    }
}

/// Build the ensemble plan for a bug class from the configured
/// providers. Each slot takes the first unused provider carrying the
/// wanted capability; a slot whose tag has no provider left falls
/// back to any unused provider, and width shrinks to what is
/// available (minimum one provider when any is configured).
pub fn plan_for(bug: BugType, providers: &[Arc<dyn LlmClient>]) -> EnsemblePlan {
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut used: Vec<usize> = Vec::new();

    for (slot, wanted) in slot_capabilities(bug).iter().enumerate() {
        let pick = providers
            .iter()
            .enumerate()
            .find(|(i, p)| !used.contains(i) && p.capability() == *wanted)
            .or_else(|| {
                providers
                    .iter()
                    .enumerate()
                    .find(|(i, _)| !used.contains(i))
            });
        if let Some((i, provider)) = pick {
            used.push(i);
            candidates.push(Candidate {
                provider: Arc::clone(provider),
                model: model_for(provider.as_ref(), *wanted),
                role: if slot == 0 { Role::Primary } else { Role::Secondary },
                priority: slot,
            });
        }
    }

    // Width reduced to what exists, but never below one when any
    // provider is configured.
    if candidates.is_empty() {
        if let Some(provider) = providers.first() {
            candidates.push(Candidate {
                provider: Arc::clone(provider),
                model: model_for(provider.as_ref(), Capability::Fast),
                role: Role::Primary,
                priority: 0,
            });
        }
    }

    EnsemblePlan { bug, candidates }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubClient {
        name: &'static str,
        capability: Capability,
    }

    #[async_trait]
    impl LlmClient for StubClient {
        fn name(&self) -> &str {
            self.name
        }
        fn capability(&self) -> Capability {
            self.capability
        }
        async fn send_prompt(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<String> {
            Ok(String::new())
        }
    }

    fn stub(name: &'static str, capability: Capability) -> Arc<dyn LlmClient> {
        Arc::new(StubClient { name, capability })
    }

    fn full_registry() -> Vec<Arc<dyn LlmClient>> {
        vec![
            stub("OpenRouter", Capability::Reasoning),
            stub("OpenAI", Capability::Reasoning),
            stub("Gemini", Capability::Fast),
            stub("Groq", Capability::Fast),
            stub("Ollama", Capability::Local),
        ]
    }

    #[test]
    fn test_logic_gets_width_three_reasoning_first() {
        let plan = plan_for(BugType::Logic, &full_registry());
        assert_eq!(plan.width(), 3);
        assert_eq!(plan.candidates[0].provider.name(), "OpenRouter");
        assert_eq!(plan.candidates[0].model, "anthropic/claude-3.5-sonnet");
        assert_eq!(plan.candidates[1].provider.name(), "OpenAI");
        assert_eq!(plan.candidates[1].model, "gpt-4o");
        // Third reasoning slot filled by the next provider available.
        assert_eq!(plan.candidates[2].provider.name(), "Gemini");
        assert_eq!(plan.candidates[0].role, Role::Primary);
        assert_eq!(plan.candidates[1].role, Role::Secondary);
        assert!(plan
            .describe()
            .starts_with("primary OpenRouter:anthropic/claude-3.5-sonnet, secondary OpenAI:"));
    }

    #[test]
    fn test_type_error_gets_width_two() {
        let plan = plan_for(BugType::TypeError, &full_registry());
        assert_eq!(plan.width(), 2);
    }

    #[test]
    fn test_syntax_mixes_reasoning_and_fast() {
        let plan = plan_for(BugType::Syntax, &full_registry());
        assert_eq!(plan.width(), 2);
        assert_eq!(plan.candidates[0].provider.capability(), Capability::Reasoning);
        assert_eq!(plan.candidates[1].provider.capability(), Capability::Fast);
        assert_eq!(plan.candidates[1].model, "gemini-2.0-flash");
    }

    #[test]
    fn test_import_and_indentation_single_fast() {
        for bug in [BugType::Import, BugType::Indentation, BugType::Linting] {
            let plan = plan_for(bug, &full_registry());
            assert_eq!(plan.width(), 1, "{:?}", bug);
            assert_eq!(plan.candidates[0].provider.capability(), Capability::Fast);
        }
    }

    #[test]
    fn test_missing_capability_falls_back_to_any_provider() {
        let only_fast = vec![stub("Groq", Capability::Fast)];
        let plan = plan_for(BugType::Logic, &only_fast);
        assert_eq!(plan.width(), 1);
        assert_eq!(plan.candidates[0].provider.name(), "Groq");
    }

    #[test]
    fn test_width_reduced_to_available_providers() {
        let two = vec![
            stub("OpenAI", Capability::Reasoning),
            stub("Groq", Capability::Fast),
        ];
        let plan = plan_for(BugType::Logic, &two);
        assert_eq!(plan.width(), 2);
    }

    #[test]
    fn test_empty_registry_yields_empty_plan() {
        let plan = plan_for(BugType::Logic, &[]);
        assert!(plan.is_empty());
    }
}
