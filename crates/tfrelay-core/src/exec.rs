//! Child-process execution for terraform steps.
//!
//! A [`Step`] is a pure description of one invocation: program, arguments,
//! working directory and extra environment. Nothing here ever changes the
//! working directory of the server process; every child gets its directory
//! through [`tokio::process::Command::current_dir`].
//!
//! Standard output and standard error of the child are inherited, so the
//! tool's own progress output lands on the server's terminal and is never
//! collected.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// One child-process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Executable to run (e.g. `terraform`).
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Directory the child is started in.
    pub working_dir: PathBuf,
    /// Extra environment variables set on the child.
    pub env: Vec<(String, String)>,
}

impl Step {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable on the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Why a step did not complete successfully.
#[derive(Debug, Error)]
pub enum StepError {
    /// The process could not be started (missing binary, bad directory, ...).
    #[error("command '{command}' in {} could not be started: {source}", .dir.display())]
    Spawn {
        command: String,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed after it was started.
    #[error("command '{command}' in {} could not be awaited: {source}", .dir.display())]
    Wait {
        command: String,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status.
    #[error("command '{command}' in {} returned non-zero exit status {code}", .dir.display())]
    Exit {
        command: String,
        dir: PathBuf,
        code: i32,
    },

    /// The process was terminated by a signal and has no exit code.
    #[error("command '{command}' in {} was terminated by a signal", .dir.display())]
    Signal { command: String, dir: PathBuf },

    /// The configured step timeout elapsed and the child was killed.
    #[error("command '{command}' in {} timed out after {}s", .dir.display(), .limit.as_secs())]
    TimedOut {
        command: String,
        dir: PathBuf,
        limit: Duration,
    },
}

impl StepError {
    /// Non-zero exit for `step`.
    pub fn exit(step: &Step, code: i32) -> Self {
        Self::Exit {
            command: step.to_string(),
            dir: step.working_dir.clone(),
            code,
        }
    }

    /// The exit code, when the child exited on its own with one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Executes a single [`Step`] to completion.
///
/// The server holds an `Arc<dyn CommandRunner>` so handlers can be driven by
/// a stub in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `step` and wait for it. `Ok(())` means the child exited with 0.
    async fn run(&self, step: &Step) -> Result<(), StepError>;
}

// Compile-time assertion: CommandRunner must be usable as `dyn CommandRunner`.
const _: () = {
    fn _assert_object_safe(_: &dyn CommandRunner) {}
};

/// Runs steps as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill any step that runs longer than `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, step: &Step) -> Result<(), StepError> {
        let command = step.to_string();
        let start = Instant::now();

        tracing::info!(
            command = %command,
            dir = %step.working_dir.display(),
            "running step"
        );

        let mut child = Command::new(&step.program)
            .args(&step.args)
            .current_dir(&step.working_dir)
            .envs(step.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .spawn()
            .map_err(|source| StepError::Spawn {
                command: command.clone(),
                dir: step.working_dir.clone(),
                source,
            })?;

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(command = %command, error = %e, "failed to kill timed-out step");
                    }
                    tracing::warn!(command = %command, limit_secs = limit.as_secs(), "step timed out");
                    return Err(StepError::TimedOut {
                        command,
                        dir: step.working_dir.clone(),
                        limit,
                    });
                }
            },
            None => child.wait().await,
        };

        let status = waited.map_err(|source| StepError::Wait {
            command: command.clone(),
            dir: step.working_dir.clone(),
            source,
        })?;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match status.code() {
            Some(0) => {
                tracing::info!(command = %command, duration_ms, "step succeeded");
                Ok(())
            }
            Some(code) => {
                tracing::warn!(command = %command, exit_code = code, duration_ms, "step failed");
                Err(StepError::exit(step, code))
            }
            None => {
                tracing::warn!(command = %command, duration_ms, "step terminated by signal");
                Err(StepError::Signal {
                    command,
                    dir: step.working_dir.clone(),
                })
            }
        }
    }
}

/// Run `steps` in order, stopping at the first failure.
///
/// Steps after a failed one are never started, and nothing already done is
/// undone.
pub async fn run_steps(runner: &dyn CommandRunner, steps: &[Step]) -> Result<(), StepError> {
    for (index, step) in steps.iter().enumerate() {
        tracing::debug!(index, total = steps.len(), command = %step, "starting step");
        runner.run(step).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    fn sh(script: &str, dir: &Path) -> Step {
        Step::new("sh", dir).args(["-c", script])
    }

    #[test]
    fn display_joins_program_and_args() {
        let step = Step::new("terraform", "/tmp").args(["apply", "-auto-approve"]);
        assert_eq!(step.to_string(), "terraform apply -auto-approve");
    }

    #[test]
    fn exit_error_mentions_command_dir_and_code() {
        let step = Step::new("terraform", "/srv/tf").arg("plan");
        let err = StepError::exit(&step, 1);
        assert_eq!(
            err.to_string(),
            "command 'terraform plan' in /srv/tf returned non-zero exit status 1"
        );
        assert_eq!(err.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn true_command_succeeds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new();
        runner
            .run(&Step::new("true", tmp.path()))
            .await
            .expect("true should exit 0");
    }

    #[tokio::test]
    async fn false_command_reports_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = ProcessRunner::new()
            .run(&Step::new("false", tmp.path()))
            .await
            .expect_err("false should fail");
        assert_eq!(err.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn child_runs_in_step_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new();
        runner
            .run(&sh("pwd > where.txt", tmp.path()))
            .await
            .expect("sh should succeed");

        let recorded = std::fs::read_to_string(tmp.path().join("where.txt")).unwrap();
        let expected = tmp.path().canonicalize().unwrap();
        assert_eq!(
            Path::new(recorded.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn step_env_is_passed_to_child() {
        let tmp = tempfile::TempDir::new().unwrap();
        let step = sh("printf %s \"$AWS_REGION\" > region.txt", tmp.path())
            .env("AWS_REGION", "us-east-1");
        ProcessRunner::new().run(&step).await.unwrap();

        let region = std::fs::read_to_string(tmp.path().join("region.txt")).unwrap();
        assert_eq!(region, "us-east-1");
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = ProcessRunner::new()
            .run(&Step::new("this_command_does_not_exist_tfrelay_test", tmp.path()))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, StepError::Spawn { .. }), "got: {err:?}");
        assert!(err.exit_code().is_none());
    }

    #[tokio::test]
    async fn timeout_kills_slow_step() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new().with_timeout(Duration::from_secs(1));
        let err = runner
            .run(&Step::new("sleep", tmp.path()).arg("30"))
            .await
            .expect_err("sleep should time out");
        assert!(matches!(err, StepError::TimedOut { .. }), "got: {err:?}");
        assert!(err.to_string().contains("timed out after 1s"));
    }

    /// Records every step and fails the one at `fail_at`.
    struct ScriptedRunner {
        fail_at: Option<usize>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, step: &Step) -> Result<(), StepError> {
            let mut seen = self.seen.lock().unwrap();
            let index = seen.len();
            seen.push(step.to_string());
            if self.fail_at == Some(index) {
                return Err(StepError::exit(step, 2));
            }
            Ok(())
        }
    }

    fn three_steps() -> Vec<Step> {
        ["init", "plan", "apply"]
            .into_iter()
            .map(|sub| Step::new("terraform", "/tmp").arg(sub))
            .collect()
    }

    #[tokio::test]
    async fn run_steps_runs_all_in_order() {
        let runner = ScriptedRunner {
            fail_at: None,
            seen: Mutex::new(Vec::new()),
        };
        run_steps(&runner, &three_steps()).await.unwrap();
        assert_eq!(
            *runner.seen.lock().unwrap(),
            vec!["terraform init", "terraform plan", "terraform apply"]
        );
    }

    #[tokio::test]
    async fn run_steps_stops_at_first_failure() {
        let runner = ScriptedRunner {
            fail_at: Some(0),
            seen: Mutex::new(Vec::new()),
        };
        let err = run_steps(&runner, &three_steps()).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(*runner.seen.lock().unwrap(), vec!["terraform init"]);
    }
}
