//! Patch validation
//!
//! Runs the minimum static check for a language against proposed file
//! contents before they are accepted. The check runs on a scratch
//! copy so a bad patch never touches the working tree. A missing
//! checker binary trivially accepts; the agent must keep working on
//! hosts without every toolchain installed.

use crate::error::AgentError;
use crate::failure::Language;
use crate::tools::run_command_with_timeout;
use std::io::Write;
use std::process::Command;
use std::time::Duration;

/// Hard per-check budget.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

fn scratch_file(content: &str, extension: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("mender-check-")
        .suffix(extension)
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn run_checker(checker: &str, cmd: &mut Command) -> Result<(), AgentError> {
    let run = match run_command_with_timeout(cmd, CHECK_TIMEOUT) {
        Ok(run) => run,
        // Checker not installed: trivially accept.
        Err(_) => return Ok(()),
    };
    if run.timed_out {
        return Err(AgentError::Timeout(checker.to_string(), CHECK_TIMEOUT));
    }
    if run.success() {
        return Ok(());
    }
    Err(AgentError::Validation {
        checker: checker.to_string(),
        message: run.combined_output().trim().to_string(),
    })
}

/// Validate proposed file contents for a language. `Ok(())` means the
/// patch may be applied; the error carries the checker's message for
/// the ensemble's self-repair loop.
pub fn check_source(content: &str, language: Language) -> Result<(), AgentError> {
    match language {
        Language::Python => {
            let file = scratch_file(content, ".py").map_err(io_to_validation("python"))?;
            let path = file.path().to_path_buf();
            // AST parse first for a precise message, then byte-compile.
            run_checker(
                "ast.parse",
                Command::new("python").args([
                    "-c",
                    "import ast,sys; ast.parse(open(sys.argv[1],encoding='utf-8').read())",
                ])
                .arg(&path),
            )?;
            run_checker(
                "py_compile",
                Command::new("python").args(["-m", "py_compile"]).arg(&path),
            )
        }
        Language::JavaScript => {
            let file = scratch_file(content, ".js").map_err(io_to_validation("node"))?;
            run_checker("node --check", Command::new("node").arg("--check").arg(file.path()))
        }
        Language::TypeScript => {
            let file = scratch_file(content, ".ts").map_err(io_to_validation("tsc"))?;
            run_checker(
                "tsc",
                Command::new("npx")
                    .args(["--yes", "tsc", "--noEmit", "--skipLibCheck"])
                    .arg(file.path()),
            )
        }
        Language::Ruby => {
            let file = scratch_file(content, ".rb").map_err(io_to_validation("ruby"))?;
            run_checker("ruby -c", Command::new("ruby").arg("-c").arg(file.path()))
        }
        // No checker exists: trivially accept.
        Language::Unknown => Ok(()),
    }
}

fn io_to_validation(checker: &'static str) -> impl Fn(std::io::Error) -> AgentError {
    move |e| AgentError::Validation {
        checker: checker.to_string(),
        message: format!("failed to stage scratch file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_language_trivially_accepts() {
        assert!(check_source("anything at all", Language::Unknown).is_ok());
    }

    #[test]
    fn test_valid_python_accepted() {
        // Accepts either because python parses it or because no
        // python binary exists on the host.
        assert!(check_source("def f():\n    return 1\n", Language::Python).is_ok());
    }

    #[test]
    fn test_validation_error_carries_checker_name() {
        let err = AgentError::Validation {
            checker: "node --check".to_string(),
            message: "SyntaxError: Unexpected end of input".to_string(),
        };
        match err {
            AgentError::Validation { checker, message } => {
                assert_eq!(checker, "node --check");
                assert!(message.contains("SyntaxError"));
            }
            _ => unreachable!(),
        }
    }
}
