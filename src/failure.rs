//! Failure model and bug classification
//!
//! Normalizes heterogeneous test-runner and linter output into a
//! uniform record and assigns one of the closed error classes. The
//! classifier is pure: the same (message, language) always yields the
//! same class.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Closed set of error classes, declared in severity order.
/// Syntax and indentation errors mask everything else, so they must
/// clear before the later classes are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BugType {
    #[serde(rename = "SYNTAX")]
    Syntax,
    #[serde(rename = "INDENTATION")]
    Indentation,
    #[serde(rename = "IMPORT")]
    Import,
    #[serde(rename = "TYPE_ERROR")]
    TypeError,
    #[serde(rename = "LOGIC")]
    Logic,
    #[serde(rename = "LINTING")]
    Linting,
}

impl BugType {
    /// Lower fixes first.
    pub fn severity(&self) -> u8 {
        match self {
            BugType::Syntax => 1,
            BugType::Indentation => 2,
            BugType::Import => 3,
            BugType::TypeError => 4,
            BugType::Logic => 5,
            BugType::Linting => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BugType::Syntax => "SYNTAX",
            BugType::Indentation => "INDENTATION",
            BugType::Import => "IMPORT",
            BugType::TypeError => "TYPE_ERROR",
            BugType::Logic => "LOGIC",
            BugType::Linting => "LINTING",
        }
    }
}

impl std::fmt::Display for BugType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Languages the agent can repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Ruby,
    Unknown,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_lowercase();
        if lower.ends_with(".py") {
            Language::Python
        } else if lower.ends_with(".js") || lower.ends_with(".jsx") || lower.ends_with(".mjs") {
            Language::JavaScript
        } else if lower.ends_with(".ts") || lower.ends_with(".tsx") {
            Language::TypeScript
        } else if lower.ends_with(".rb") {
            Language::Ruby
        } else {
            Language::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Ruby => "ruby",
            Language::Unknown => "unknown",
        }
    }
}

/// One normalized failure. Immutable once produced by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Repo-relative path, forward slashes.
    pub file: String,
    /// 1-based line number when the tool reported one.
    pub line: Option<u32>,
    /// Error-kind string as produced by the tool (e.g. "E501",
    /// "SyntaxError", "test_failure").
    pub kind: String,
    /// Raw message line.
    pub message: String,
    pub language: Language,
}

impl Failure {
    pub fn site(&self) -> (String, Option<u32>) {
        (self.file.clone(), self.line)
    }
}

fn lint_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([ewfdc]\d{3})\b").unwrap())
}

/// Assign a bug class to a raw failure message. First match wins;
/// the rule order mirrors the severity order so masking classes are
/// recognized before the noise they produce.
pub fn classify(message: &str, language: Language) -> BugType {
    let msg = message.to_lowercase();

    // Syntax. E999 is flake8's SyntaxError code and must beat the
    // generic lint-code pattern below.
    if msg.contains("e999")
        || msg.contains("syntaxerror")
        || msg.contains("syntax error")
        || msg.contains("unexpected token")
        || msg.contains("missing ;")
        || msg.contains("expected ';'")
        || msg.contains("unexpected eof")
        || msg.contains("unmatched ')'")
    {
        return BugType::Syntax;
    }

    // Indentation.
    if msg.contains("indentationerror")
        || msg.contains("taberror")
        || msg.contains("expected an indented block")
        || msg.contains("unexpected indent")
        || msg.contains("w191")
        || msg.contains("e128")
        || (matches!(language, Language::JavaScript | Language::TypeScript)
            && msg.contains("(indent)"))
    {
        return BugType::Indentation;
    }

    // Unresolved imports and identifiers.
    if msg.contains("modulenotfounderror")
        || msg.contains("importerror")
        || msg.contains("no module named")
        || msg.contains("cannot find module")
        || msg.contains("undefined name")
        || msg.contains("is not defined")
    {
        return BugType::Import;
    }

    // Type mismatches: runtime TypeError, TS diagnostics, mypy.
    if msg.contains("typeerror")
        || msg.contains("ts2322")
        || msg.contains("ts2345")
        || msg.contains("incompatible type")
        || msg.contains("incompatible return value")
        || msg.contains("[assignment]")
        || msg.contains("[arg-type]")
    {
        return BugType::TypeError;
    }

    // Style and lint codes. flake8/pyflakes/pydocstyle codes, eslint
    // style rules, rubocop cops.
    if lint_code_re().is_match(&msg)
        || msg.contains("unused import")
        || msg.contains("unused variable")
        || msg.contains("missing docstring")
        || msg.contains("line too long")
        || msg.contains("trailing whitespace")
        || (language == Language::Ruby && (msg.contains("style/") || msg.contains("layout/")))
        || (matches!(language, Language::JavaScript | Language::TypeScript)
            && (msg.contains("(semi)") || msg.contains("(no-unused-vars)")))
    {
        return BugType::Linting;
    }

    // Everything else, including assertion failures.
    BugType::Logic
}

/// Extract the tool's own error-kind token from a message, used to
/// fill `Failure::kind`.
pub fn extract_kind(message: &str) -> String {
    static KIND_RE: OnceLock<Regex> = OnceLock::new();
    let re = KIND_RE.get_or_init(|| {
        Regex::new(r"\b([EWFDC]\d{3}|[A-Z][a-z]+(?:[A-Z][a-z]+)*Error|TS\d{4})\b").unwrap()
    });
    if let Some(m) = re.find(message) {
        return m.as_str().to_string();
    }
    if message.contains("assert") {
        return "AssertionError".to_string();
    }
    if message.contains("FAILED") {
        return "test_failure".to_string();
    }
    "unknown".to_string()
}

/// Deduplicate failures by (file, line, class), preserving order.
pub fn dedupe(failures: Vec<Failure>) -> Vec<Failure> {
    let mut seen = std::collections::HashSet::new();
    failures
        .into_iter()
        .filter(|f| seen.insert((f.file.clone(), f.line, classify(&f.message, f.language))))
        .collect()
}

/// Sort by class severity, then (file, line). Stable, so equal keys
/// keep runner order.
pub fn sort_by_severity(failures: &mut [Failure]) {
    failures.sort_by(|a, b| {
        let ka = (
            classify(&a.message, a.language).severity(),
            a.file.clone(),
            a.line.unwrap_or(0),
        );
        let kb = (
            classify(&b.message, b.language).severity(),
            b.file.clone(),
            b.line.unwrap_or(0),
        );
        ka.cmp(&kb)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(file: &str, line: Option<u32>, message: &str) -> Failure {
        Failure {
            file: file.to_string(),
            line,
            kind: extract_kind(message),
            message: message.to_string(),
            language: Language::from_path(file),
        }
    }

    #[test]
    fn test_classify_syntax_first() {
        assert_eq!(
            classify("app.py:3:1: E999 SyntaxError: invalid syntax", Language::Python),
            BugType::Syntax
        );
        assert_eq!(
            classify("SyntaxError: Unexpected token '}'", Language::JavaScript),
            BugType::Syntax
        );
    }

    #[test]
    fn test_classify_indentation() {
        assert_eq!(
            classify("IndentationError: expected an indented block", Language::Python),
            BugType::Indentation
        );
        assert_eq!(
            classify("app.py:7:1: W191 indentation contains tabs", Language::Python),
            BugType::Indentation
        );
        assert_eq!(
            classify("src/a.js: line 4, col 2, Error - Expected indentation (indent)", Language::JavaScript),
            BugType::Indentation
        );
    }

    #[test]
    fn test_classify_import() {
        assert_eq!(
            classify("ModuleNotFoundError: No module named 'requests'", Language::Python),
            BugType::Import
        );
        assert_eq!(
            classify("Error: Cannot find module './util'", Language::JavaScript),
            BugType::Import
        );
        assert_eq!(
            classify("app.py:9: undefined name 'helper'", Language::Python),
            BugType::Import
        );
    }

    #[test]
    fn test_classify_type_error() {
        assert_eq!(
            classify("TypeError: unsupported operand type(s) for +", Language::Python),
            BugType::TypeError
        );
        assert_eq!(
            classify("error TS2322: Type 'string' is not assignable to type 'number'", Language::TypeScript),
            BugType::TypeError
        );
        assert_eq!(
            classify("app.py:4: error: Incompatible types in assignment [assignment]", Language::Python),
            BugType::TypeError
        );
    }

    #[test]
    fn test_classify_linting() {
        assert_eq!(
            classify("f.py:2:15: W291 trailing whitespace", Language::Python),
            BugType::Linting
        );
        assert_eq!(
            classify("app.py:1:1: F401 'os' imported but unused", Language::Python),
            BugType::Linting
        );
        assert_eq!(
            classify("a.rb:3:1: C: Style/FrozenStringLiteralComment", Language::Ruby),
            BugType::Linting
        );
    }

    #[test]
    fn test_classify_logic_fallback() {
        assert_eq!(
            classify("FAILED test_math.py::test_add - assert 3 == 4", Language::Python),
            BugType::Logic
        );
        assert_eq!(classify("something unrecognizable", Language::Unknown), BugType::Logic);
    }

    #[test]
    fn test_classifier_is_deterministic() {
        let inputs = [
            ("IndentationError: unexpected indent", Language::Python),
            ("E999 SyntaxError", Language::Python),
            ("assert 1 == 2", Language::Python),
        ];
        for (msg, lang) in inputs {
            let first = classify(msg, lang);
            for _ in 0..10 {
                assert_eq!(classify(msg, lang), first);
            }
        }
    }

    #[test]
    fn test_severity_order_masks_first() {
        assert!(BugType::Syntax.severity() < BugType::Indentation.severity());
        assert!(BugType::Indentation.severity() < BugType::Import.severity());
        assert!(BugType::Import.severity() < BugType::TypeError.severity());
        assert!(BugType::TypeError.severity() < BugType::Logic.severity());
        assert!(BugType::Logic.severity() < BugType::Linting.severity());
    }

    #[test]
    fn test_sort_puts_syntax_before_logic() {
        let mut failures = vec![
            f("b.py", Some(10), "FAILED b.py::test_x - assert 1 == 2"),
            f("a.py", Some(3), "a.py:3:1: E999 SyntaxError: invalid syntax"),
        ];
        sort_by_severity(&mut failures);
        assert_eq!(failures[0].file, "a.py");
        assert_eq!(failures[1].file, "b.py");
    }

    #[test]
    fn test_dedupe_same_site_and_class() {
        let failures = vec![
            f("a.py", Some(3), "a.py:3:1: W291 trailing whitespace"),
            f("a.py", Some(3), "a.py:3:1: W291 trailing whitespace"),
            f("a.py", Some(4), "a.py:4:1: W291 trailing whitespace"),
        ];
        assert_eq!(dedupe(failures).len(), 2);
    }

    #[test]
    fn test_extract_kind() {
        assert_eq!(extract_kind("f.py:2:15: W291 trailing whitespace"), "W291");
        assert_eq!(extract_kind("TypeError: bad operand"), "TypeError");
        assert_eq!(extract_kind("error TS2322: nope"), "TS2322");
        assert_eq!(extract_kind("FAILED tests/test_a.py::test_b"), "test_failure");
    }

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path("src/app.py"), Language::Python);
        assert_eq!(Language::from_path("web/index.tsx"), Language::TypeScript);
        assert_eq!(Language::from_path("lib/a.rb"), Language::Ruby);
        assert_eq!(Language::from_path("README.md"), Language::Unknown);
    }
}
