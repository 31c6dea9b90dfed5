//! Prompt construction and model-output extraction
//!
//! Prompts always carry the full current file contents, the failure
//! list, the bug class, and few-shot history. Models are instructed
//! to emit the complete new file inside `<fixed_code>` tags with no
//! prose; extraction tolerates markdown fences anyway because some
//! providers leak them.

use crate::failure::{BugType, Failure};
use regex::Regex;
use std::sync::OnceLock;

/// Output tag the models are told to wrap their answer in. Strict
/// tags defeat conversational leakage better than "no prose please".
const FIXED_CODE_OPEN: &str = "<fixed_code>";
const FIXED_CODE_CLOSE: &str = "</fixed_code>";

/// System prompt for a repair request.
pub fn fix_system_prompt(language: &str) -> String {
    format!(
        "You are an expert {language} refactoring engine.\n\
         RULES (follow exactly):\n\
         1. Wrap the entire corrected file strictly inside {open} and {close} tags.\n\
         2. Output no conversational text, explanations, or markdown outside the tags.\n\
         3. Always return the FULL corrected file. Never emit snippets.\n\
         4. Modify ONLY the line(s) causing the listed errors.\n\
         5. Do not add decorative comments, docstrings, or blank lines.\n\
         6. Do not reformat, refactor, or rename anything else.\n\
         7. Preserve all existing logic, structure, comments, and formatting.",
        language = language,
        open = FIXED_CODE_OPEN,
        close = FIXED_CODE_CLOSE,
    )
}

/// User prompt for a batch of failures in one file.
pub fn fix_user_prompt(
    file: &str,
    bug: BugType,
    failures: &[Failure],
    content: &str,
    few_shot: &str,
    extra_context: Option<&str>,
) -> String {
    let error_list = failures
        .iter()
        .map(|f| {
            format!(
                "- Line {}: {}",
                f.line.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
                f.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = String::new();
    if !few_shot.is_empty() {
        prompt.push_str("Learn from these past fixes (avoid repeating the same mistakes):\n");
        prompt.push_str(few_shot);
        prompt.push_str("\n\n---\n\n");
    }
    prompt.push_str(&format!("File: {}\nBug class: {}\n\nErrors to fix:\n{}\n", file, bug, error_list));
    if let Some(context) = extra_context {
        prompt.push_str(&format!("\nStatic analysis context:\n{}\n", context));
    }
    prompt.push_str(&format!(
        "\nCurrent FULL file content:\n{}\n\nFix ALL of the errors listed above. \
         Output the COMPLETE corrected file inside {} tags.",
        content, FIXED_CODE_OPEN
    ));
    prompt
}

/// Repair prompt used when every ensemble response failed validation.
pub fn repair_user_prompt(file: &str, original: &str, broken: &str, checker_message: &str) -> String {
    format!(
        "File: {file}\n\n\
         Your previous fix introduced a syntax error; fix it without removing existing structure.\n\n\
         Checker output:\n{checker}\n\n\
         Your broken output:\n{broken}\n\n\
         Original file content (before your fix):\n{original}\n\n\
         Output the COMPLETE corrected file inside {open} tags.",
        file = file,
        checker = checker_message,
        broken = truncate(broken, 8000),
        original = original,
        open = FIXED_CODE_OPEN,
    )
}

/// Extract code from a model response: strict tags first, then a
/// fenced block, then trimming stray outer fences.
pub fn extract_code(raw: &str) -> String {
    let text = raw.trim();
    if text.is_empty() {
        return String::new();
    }

    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let tag_re = TAG_RE.get_or_init(|| {
        Regex::new(r"(?is)<fixed_code>\s*(.*?)\s*</fixed_code>").unwrap()
    });
    if let Some(caps) = tag_re.captures(text) {
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("").trim();
        return strip_fence(inner);
    }

    static FENCE_RE: OnceLock<Regex> = OnceLock::new();
    let fence_re = FENCE_RE.get_or_init(|| {
        Regex::new(r"(?s)```[a-zA-Z]*\n(.*?)```").unwrap()
    });
    if let Some(caps) = fence_re.captures(text) {
        return caps.get(1).map(|m| m.as_str()).unwrap_or("").trim().to_string();
    }

    strip_fence(text)
}

/// Trim a bare leading/trailing fence line when a model forgot the
/// closing one or wrapped the whole answer.
fn strip_fence(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.first().map(|l| l.starts_with("```")).unwrap_or(false) {
        lines.remove(0);
    }
    if lines.last().map(|l| l.trim() == "```").unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n").trim_matches('\n').to_string()
}

/// Whitespace-normalize content for the ensemble's byte-identity
/// vote.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Language;

    fn failure(line: u32, message: &str) -> Failure {
        Failure {
            file: "app.py".to_string(),
            line: Some(line),
            kind: "E999".to_string(),
            message: message.to_string(),
            language: Language::Python,
        }
    }

    #[test]
    fn test_extract_from_tags() {
        let raw = "Sure, here is the fix:\n<fixed_code>\ndef f():\n    return 1\n</fixed_code>\nHope that helps!";
        assert_eq!(extract_code(raw), "def f():\n    return 1");
    }

    #[test]
    fn test_extract_from_tags_with_inner_fence() {
        let raw = "<fixed_code>\n```python\ndef f():\n    return 1\n```\n</fixed_code>";
        assert_eq!(extract_code(raw), "def f():\n    return 1");
    }

    #[test]
    fn test_extract_from_markdown_fence() {
        let raw = "```python\nx = 1\n```";
        assert_eq!(extract_code(raw), "x = 1");
    }

    #[test]
    fn test_extract_plain_text_untouched() {
        assert_eq!(extract_code("x = 1\ny = 2"), "x = 1\ny = 2");
    }

    #[test]
    fn test_extract_trims_dangling_fence() {
        let raw = "```python\nx = 1";
        assert_eq!(extract_code(raw), "x = 1");
    }

    #[test]
    fn test_user_prompt_carries_full_file_and_lines() {
        let failures = vec![failure(3, "E999 SyntaxError: invalid syntax")];
        let prompt = fix_user_prompt(
            "app.py",
            BugType::Syntax,
            &failures,
            "def f()\n    return 1\n",
            "",
            None,
        );
        assert!(prompt.contains("File: app.py"));
        assert!(prompt.contains("Bug class: SYNTAX"));
        assert!(prompt.contains("- Line 3: E999"));
        assert!(prompt.contains("def f()\n    return 1"));
        assert!(prompt.contains("<fixed_code>"));
    }

    #[test]
    fn test_user_prompt_prepends_few_shot() {
        let failures = vec![failure(1, "boom")];
        let prompt = fix_user_prompt(
            "app.py",
            BugType::Logic,
            &failures,
            "x = 1\n",
            "Past fix for LOGIC:\n  Error: assert 1 == 2",
            None,
        );
        assert!(prompt.starts_with("Learn from these past fixes"));
    }

    #[test]
    fn test_normalize_whitespace_collapses_runs() {
        assert_eq!(normalize_whitespace("a  b\n\tc"), "a b c");
        assert_eq!(normalize_whitespace("a b c"), normalize_whitespace("a\nb\nc"));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("ééééé", 3), "ééé…");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
