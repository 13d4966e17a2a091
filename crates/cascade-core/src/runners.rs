//! Collaborator traits the node executors delegate to.
//!
//! The engine never shells out directly; skill and command nodes go through
//! these traits so tests can substitute scripted fakes. The default
//! implementations spawn real processes via tokio::process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::FlowError;

/// Captured result of one finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Renders `${...}` references against run state. Implemented by the
/// engine's execution context.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &str) -> String;
}

/// Runs one shell command to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, FlowError>;
}

/// Runs one named skill with a rendered input payload.
#[async_trait]
pub trait SkillRunner: Send + Sync {
    async fn run(
        &self,
        skill_name: &str,
        input: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, FlowError>;
}

/// Default command runner: `sh -c <command>` in the node's working dir.
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, FlowError> {
        run_process(Command::new("sh").args(["-c", command]).current_dir(cwd), None, timeout).await
    }
}

/// Default skill runner: skills are executable scripts under a skills
/// directory, one file per skill name (`<skills_dir>/<name>.sh`). The
/// rendered input is fed on stdin.
pub struct ScriptSkillRunner {
    skills_dir: PathBuf,
}

impl ScriptSkillRunner {
    pub fn new(skills_dir: impl Into<PathBuf>) -> Self {
        Self {
            skills_dir: skills_dir.into(),
        }
    }
}

#[async_trait]
impl SkillRunner for ScriptSkillRunner {
    async fn run(
        &self,
        skill_name: &str,
        input: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, FlowError> {
        // Skill names come from validated node config but still gate on
        // path separators so a name can't escape the skills directory.
        if skill_name.contains('/') || skill_name.contains("..") {
            return Err(FlowError::BadRequest(format!(
                "Invalid skill name: {}",
                skill_name
            )));
        }
        let script = self.skills_dir.join(format!("{}.sh", skill_name));
        if !script.exists() {
            return Err(FlowError::NotFound(format!(
                "Skill '{}' not found under {}",
                skill_name,
                self.skills_dir.display()
            )));
        }
        run_process(
            Command::new("sh").arg(&script).current_dir(cwd),
            Some(input),
            timeout,
        )
        .await
    }
}

/// Spawn, optionally feed stdin, and wait with a deadline. Deadline expiry
/// kills the process and surfaces `FlowError::Timeout`.
async fn run_process(
    cmd: &mut Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, FlowError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| FlowError::Spawn(format!("Failed to spawn process: {}", e)))?;

    if let Some(input) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            handle
                .write_all(input.as_bytes())
                .await
                .map_err(|e| FlowError::Execution(format!("Failed to write stdin: {}", e)))?;
            // Dropping the handle closes stdin so the child sees EOF.
        }
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| FlowError::Timeout(format!("Process exceeded {}s", timeout.as_secs())))?
        .map_err(|e| FlowError::Execution(format!("Failed to collect output: {}", e)))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_captures_stdout_and_exit_code() {
        let runner = ShellCommandRunner;
        let out = runner
            .run("echo hello; exit 3", ".", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_shell_runner_times_out() {
        let runner = ShellCommandRunner;
        let err = runner
            .run("sleep 5", ".", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_skill_runner_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shout.sh"), "tr a-z A-Z").unwrap();

        let runner = ScriptSkillRunner::new(dir.path());
        let out = runner
            .run("shout", "make this loud", ".", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "MAKE THIS LOUD");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_skill_runner_unknown_skill() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptSkillRunner::new(dir.path());
        let err = runner
            .run("missing", "", ".", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_skill_runner_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptSkillRunner::new(dir.path());
        let err = runner
            .run("../etc/passwd", "", ".", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "bad_request");
    }
}
