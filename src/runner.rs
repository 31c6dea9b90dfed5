//! Test and linter execution
//!
//! The Runner port: detect the project type, run its tests and
//! linters, and normalize whatever they print into `Failure` records.
//! Missing tools degrade to empty output; the loop only fails when a
//! repository has nothing the agent understands at all.

use crate::error::AgentError;
use crate::failure::{self, extract_kind, Failure, Language};
use crate::tools::run_command_with_timeout;
use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

const TEST_TIMEOUT: Duration = Duration::from_secs(90);
const LINT_TIMEOUT: Duration = Duration::from_secs(60);
/// Linter invocations cap their file lists to keep runs bounded on
/// huge repositories.
const MAX_PY_LINT_FILES: usize = 50;
const MAX_JS_LINT_FILES: usize = 30;

/// Runner port used by the healing loop.
pub trait Runner: Send + Sync {
    /// Run tests + linters and return the merged, deduplicated
    /// failure list.
    fn run(&self, repo: &Path) -> Result<Vec<Failure>, AgentError>;
}

/// Detected project type, by marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Python,
    Node,
    Ruby,
    Unknown,
}

impl ProjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectKind::Python => "python",
            ProjectKind::Node => "node",
            ProjectKind::Ruby => "ruby",
            ProjectKind::Unknown => "unknown",
        }
    }
}

pub fn detect_project(repo: &Path) -> ProjectKind {
    if repo.join("pyproject.toml").exists()
        || repo.join("setup.py").exists()
        || repo.join("requirements.txt").exists()
    {
        ProjectKind::Python
    } else if repo.join("package.json").exists() {
        ProjectKind::Node
    } else if repo.join("Gemfile").exists() {
        ProjectKind::Ruby
    } else {
        ProjectKind::Unknown
    }
}

fn is_vendored(path: &str) -> bool {
    path.contains("node_modules/")
        || path.contains("venv/")
        || path.contains(".venv/")
        || path.contains("__pycache__/")
        || path.contains(".git/")
}

fn walk_files(repo: &Path) -> Vec<String> {
    WalkDir::new(repo)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(repo)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .filter(|p| !is_vendored(p))
        .collect()
}

/// Find test files across the supported ecosystems.
pub fn discover_tests(repo: &Path) -> Vec<String> {
    let mut tests: Vec<String> = walk_files(repo)
        .into_iter()
        .filter(|p| {
            let name = p.rsplit('/').next().unwrap_or(p);
            (name.starts_with("test_") && name.ends_with(".py"))
                || name.ends_with("_test.py")
                || name.ends_with(".test.js")
                || name.ends_with(".test.ts")
                || name.ends_with(".spec.js")
                || name.ends_with(".spec.ts")
        })
        .collect();
    tests.sort();
    tests
}

/// Find repairable source files, used for linter-only mode when a
/// repository has no tests.
pub fn discover_sources(repo: &Path) -> Vec<String> {
    let mut sources: Vec<String> = walk_files(repo)
        .into_iter()
        .filter(|p| !matches!(Language::from_path(p), Language::Unknown))
        .collect();
    sources.sort();
    sources
}

fn run_cmd(repo: &Path, program: &str, args: &[&str], timeout: Duration) -> String {
    let mut cmd = Command::new(program);
    cmd.current_dir(repo).args(args);
    match run_command_with_timeout(&mut cmd, timeout) {
        Ok(run) => run.combined_output(),
        // Tool missing: nothing to parse.
        Err(_) => String::new(),
    }
}

fn run_tests(repo: &Path, tests: &[String]) -> String {
    let mut output = String::new();
    let py_tests: Vec<&str> = tests
        .iter()
        .filter(|t| t.ends_with(".py"))
        .map(|s| s.as_str())
        .collect();
    let has_js_tests = tests.iter().any(|t| t.ends_with(".js") || t.ends_with(".ts"));

    if !py_tests.is_empty() {
        let mut args = vec!["-m", "pytest"];
        args.extend(py_tests);
        args.extend(["-v", "--tb=short"]);
        output.push_str(&run_cmd(repo, "python", &args, TEST_TIMEOUT));
    }
    if has_js_tests && repo.join("package.json").exists() {
        output.push_str(&run_cmd(
            repo,
            "npx",
            &["--yes", "jest", "--passWithNoTests", "--no-cache"],
            TEST_TIMEOUT,
        ));
    }
    output
}

fn run_linters(repo: &Path, sources: &[String]) -> String {
    let mut output = String::new();
    let py_src: Vec<&str> = sources
        .iter()
        .filter(|s| s.ends_with(".py"))
        .take(MAX_PY_LINT_FILES)
        .map(|s| s.as_str())
        .collect();
    let js_src: Vec<&str> = sources
        .iter()
        .filter(|s| matches!(Language::from_path(s), Language::JavaScript | Language::TypeScript))
        .take(MAX_JS_LINT_FILES)
        .map(|s| s.as_str())
        .collect();

    if !py_src.is_empty() {
        let mut args = vec!["-m", "flake8", "--max-line-length=120"];
        args.extend(py_src.iter());
        output.push_str(&run_cmd(repo, "python", &args, LINT_TIMEOUT));

        let mut args = vec!["-m", "pyflakes"];
        args.extend(py_src.iter());
        output.push_str(&run_cmd(repo, "python", &args, LINT_TIMEOUT));
    }

    if !js_src.is_empty() && repo.join("package.json").exists() {
        let mut args = vec![
            "--yes",
            "eslint",
            "--format",
            "compact",
            "--no-error-on-unmatched-pattern",
        ];
        args.extend(js_src.iter());
        output.push_str(&run_cmd(repo, "npx", &args, LINT_TIMEOUT));
    }

    output
}

/// Syntax-error sweep for repositories without tests: byte-compile
/// each python source so SyntaxError and IndentationError surface.
fn run_py_compile(repo: &Path, sources: &[String]) -> String {
    let mut output = String::new();
    for source in sources.iter().filter(|s| s.ends_with(".py")) {
        output.push_str(&run_cmd(
            repo,
            "python",
            &["-m", "py_compile", source],
            LINT_TIMEOUT,
        ));
    }
    output
}

fn relativize(path: &str, repo: &Path) -> String {
    let repo_str = repo.to_string_lossy();
    let stripped = path
        .strip_prefix(repo_str.as_ref())
        .map(|p| p.trim_start_matches('/'))
        .unwrap_or(path);
    stripped.replace('\\', "/")
}

fn make_failure(file: String, line: Option<u32>, message: &str) -> Failure {
    let language = Language::from_path(&file);
    Failure {
        file,
        line,
        kind: extract_kind(message),
        message: message.trim().to_string(),
        language,
    }
}

/// Parse pytest / jest / interpreter-traceback output.
pub fn parse_test_output(output: &str, repo: &Path) -> Vec<Failure> {
    static PY_SITE: OnceLock<Regex> = OnceLock::new();
    static TRACEBACK: OnceLock<Regex> = OnceLock::new();
    static JEST_SITE: OnceLock<Regex> = OnceLock::new();
    let py_site = PY_SITE.get_or_init(|| Regex::new(r"([^\s:]+\.py):(\d+)").unwrap());
    let traceback =
        TRACEBACK.get_or_init(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());
    let jest_site = JEST_SITE
        .get_or_init(|| Regex::new(r"at\s+.*?([^\s():]+\.(?:js|ts|jsx|tsx)):(\d+)").unwrap());

    let mut failures = Vec::new();
    let mut seen: HashSet<(String, Option<u32>)> = HashSet::new();
    let lines: Vec<&str> = output.lines().collect();

    for (i, line) in lines.iter().copied().enumerate() {
        // Pytest summary: FAILED tests/test_x.py::test_y - assert ...
        if line.contains("FAILED") && line.contains(".py") {
            if let Some(token) = line.split_whitespace().find(|t| t.contains(".py") && t.contains("::")) {
                let file = relativize(token.split("::").next().unwrap_or(token), repo);
                if !is_vendored(&file) && seen.insert((file.clone(), None)) {
                    failures.push(make_failure(file, None, line));
                }
                continue;
            }
        }

        // Interpreter traceback frames carry absolute paths; the
        // error name usually follows within a few lines.
        if let Some(caps) = traceback.captures(line) {
            let file = relativize(&caps[1], repo);
            let line_num = caps[2].parse().ok();
            let detail = lines[i..(i + 5).min(lines.len())]
                .iter()
                .find(|l| l.contains("Error"))
                .copied();
            let message = match detail {
                Some(detail) => format!("{}: {}", line.trim(), detail.trim()),
                None => line.to_string(),
            };
            if !is_vendored(&file) && !file.starts_with('/') && seen.insert((file.clone(), line_num)) {
                failures.push(make_failure(file, line_num, &message));
            }
            continue;
        }

        // Generic file:line sites inside pytest tracebacks.
        if let Some(caps) = py_site.captures(line) {
            let file = relativize(&caps[1], repo);
            let line_num = caps[2].parse().ok();
            if !is_vendored(&file) && !file.starts_with('/') && seen.insert((file.clone(), line_num)) {
                failures.push(make_failure(file, line_num, line));
            }
            continue;
        }

        // Jest stack frames.
        if let Some(caps) = jest_site.captures(line) {
            let file = relativize(&caps[1], repo);
            let line_num = caps[2].parse().ok();
            if !is_vendored(&file) && !file.starts_with('/') && seen.insert((file.clone(), line_num)) {
                failures.push(make_failure(file, line_num, line));
            }
        }
    }

    failures
}

/// Parse flake8 / pyflakes / eslint-compact output.
pub fn parse_linter_output(output: &str, repo: &Path) -> Vec<Failure> {
    static PY_LINT: OnceLock<Regex> = OnceLock::new();
    static ESLINT: OnceLock<Regex> = OnceLock::new();
    let py_lint = PY_LINT.get_or_init(|| Regex::new(r"^([^\s:]+\.py):(\d+):").unwrap());
    let eslint = ESLINT.get_or_init(|| {
        Regex::new(r"^([^\s:]+\.(?:js|ts|jsx|tsx)):\s*line\s+(\d+)").unwrap()
    });

    let mut failures = Vec::new();
    let mut seen: HashSet<(String, u32)> = HashSet::new();

    for line in output.lines() {
        if let Some(caps) = py_lint.captures(line) {
            let file = relativize(&caps[1], repo);
            if let Ok(line_num) = caps[2].parse::<u32>() {
                if seen.insert((file.clone(), line_num)) {
                    failures.push(make_failure(file, Some(line_num), line));
                }
            }
            continue;
        }
        if let Some(caps) = eslint.captures(line) {
            let file = relativize(&caps[1], repo);
            if let Ok(line_num) = caps[2].parse::<u32>() {
                if seen.insert((file.clone(), line_num)) {
                    failures.push(make_failure(file, Some(line_num), line));
                }
            }
        }
    }

    failures
}

/// Production runner backed by child processes.
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&self, repo: &Path) -> Result<Vec<Failure>, AgentError> {
        let kind = detect_project(repo);
        let tests = discover_tests(repo);
        let sources = discover_sources(repo);
        if tests.is_empty() && sources.is_empty() {
            return Err(AgentError::Runner(
                "no supported source or test files found".to_string(),
            ));
        }
        info!(
            project = kind.name(),
            tests = tests.len(),
            sources = sources.len(),
            "scanning repository"
        );

        let mut failures = Vec::new();
        if !tests.is_empty() {
            let output = run_tests(repo, &tests);
            failures.extend(parse_test_output(&output, repo));
        } else {
            // No tests: byte-compile sweep catches syntax errors the
            // linters stumble over.
            let output = run_py_compile(repo, &sources);
            failures.extend(parse_test_output(&output, repo));
        }

        let lint_output = run_linters(repo, &sources);
        failures.extend(parse_linter_output(&lint_output, repo));

        let failures = failure::dedupe(failures);
        debug!(count = failures.len(), "failures detected");
        Ok(failures)
    }
}
