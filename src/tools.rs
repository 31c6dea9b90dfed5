//! Deterministic fixer tools
//!
//! Maps (language, bug class) to external fixer invocations that are
//! tried before any LLM is consulted. A fixer succeeds if it exits
//! zero and the file still passes the validator; otherwise the file
//! is restored and the next tool in the list is tried.

use crate::failure::{BugType, Language};
use crate::validate;
use anyhow::{Context, Result};
use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Per-tool execution budget.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Run a child process with a hard timeout, draining stdout/stderr on
/// separate threads so a chatty tool cannot deadlock on a full pipe.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to start command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr"))?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(stdout).read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(stderr).read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to wait for command: {}", e)),
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

/// One fixer invocation. The offending file path is appended as the
/// final argument.
#[derive(Debug, Clone, Copy)]
pub struct Fixer {
    pub name: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
}

const PYTHON_FORMATTERS: &[Fixer] = &[
    Fixer {
        name: "autopep8",
        program: "python",
        args: &["-m", "autopep8", "--in-place"],
    },
    Fixer {
        name: "black",
        program: "black",
        args: &["--quiet"],
    },
];

const JS_FORMATTERS: &[Fixer] = &[
    Fixer {
        name: "eslint",
        program: "npx",
        args: &["--yes", "eslint", "--fix"],
    },
    Fixer {
        name: "prettier",
        program: "npx",
        args: &["--yes", "prettier", "--write"],
    },
];

const RUBY_FORMATTERS: &[Fixer] = &[Fixer {
    name: "rubocop",
    program: "rubocop",
    args: &["-A"],
}];

/// Ordered fixer list for a (language, bug class) pair. SYNTAX,
/// IMPORT and LOGIC always return an empty list: those classes are
/// LLM-only.
pub fn fixers_for(language: Language, bug: BugType) -> &'static [Fixer] {
    match (language, bug) {
        (Language::Python, BugType::Linting | BugType::Indentation) => PYTHON_FORMATTERS,
        (Language::JavaScript | Language::TypeScript, BugType::Linting | BugType::Indentation) => {
            JS_FORMATTERS
        }
        (Language::Ruby, BugType::Linting | BugType::Indentation) => RUBY_FORMATTERS,
        _ => &[],
    }
}

/// Try the registry's fixers in order against one file. Returns the
/// name of the first tool that exited zero and left the file valid,
/// or `None` when the list is exhausted and control should return to
/// the ensemble. The file is restored after any broken attempt.
pub fn apply_first_fixer(
    file: &Path,
    repo: &Path,
    language: Language,
    bug: BugType,
) -> Result<Option<String>> {
    let fixers = fixers_for(language, bug);
    if fixers.is_empty() {
        return Ok(None);
    }

    let original = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    for fixer in fixers {
        let mut cmd = Command::new(fixer.program);
        cmd.current_dir(repo).args(fixer.args).arg(file);

        let run = match run_command_with_timeout(&mut cmd, TOOL_TIMEOUT) {
            Ok(run) => run,
            // Tool not installed; try the next one.
            Err(_) => continue,
        };
        if !run.success() {
            let _ = fs::write(file, &original);
            continue;
        }

        let fixed = fs::read_to_string(file)
            .with_context(|| format!("Failed to re-read {}", file.display()))?;
        if validate::check_source(&fixed, language).is_ok() {
            return Ok(Some(fixer.name.to_string()));
        }
        // Tool exited zero but broke the file.
        fs::write(file, &original)
            .with_context(|| format!("Failed to restore {}", file.display()))?;
    }

    Ok(None)
}

/// mypy is report-only: it never auto-applies, its diagnostics are
/// fed forward to the LLM as extra context for python TYPE_ERROR
/// fixes.
pub fn mypy_context(file: &Path, repo: &Path) -> Option<String> {
    let mut cmd = Command::new("mypy");
    cmd.current_dir(repo).arg("--no-color-output").arg(file);
    let run = run_command_with_timeout(&mut cmd, TOOL_TIMEOUT).ok()?;
    let out = run.combined_output();
    let out = out.trim();
    if out.is_empty() {
        None
    } else {
        Some(out.to_string())
    }
}
