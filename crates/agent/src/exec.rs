//! Running external tools with captured output.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tracing::debug;

/// Captured result of one command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// One-line summary for error messages.
    pub fn describe(&self, program: &str) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("{program} exited with {}", self.status)
        } else {
            format!("{program} exited with {}: {}", self.status, last_lines(stderr, 5))
        }
    }
}

/// Runs `argv[0]` with the remaining arguments and waits for it.
pub async fn run(argv: &[String], cwd: Option<&Path>) -> io::Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    debug!(program = %program, args = ?args, "running");

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let out = cmd.output().await?;

    let output = CommandOutput {
        status: out.status,
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    };
    debug!(program = %program, status = %output.status, "finished");
    if !output.stderr.trim().is_empty() {
        debug!(program = %program, stderr = %output.stderr.trim_end(), "stderr");
    }
    Ok(output)
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let out = run(&argv(&["sh", "-c", "echo hi; echo oops >&2; exit 3"]), None)
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
        assert!(out.describe("sh").ends_with(": oops"));
    }

    #[tokio::test]
    async fn runs_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&argv(&["pwd"]), Some(dir.path())).await.unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn empty_and_missing_programs_are_errors() {
        assert!(run(&[], None).await.is_err());
        assert!(run(&argv(&["/nonexistent/tool"]), None).await.is_err());
    }
}
