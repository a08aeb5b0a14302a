//! Runs a pipeline as an external command.
//!
//! Parameters are exported as `PIPELINE_PARAM_<KEY>` environment variables,
//! along with `PIPELINE_ID`, `PIPELINE_EXECUTION_ID`,
//! `PIPELINE_CORRELATION_ID` and `PIPELINE_ATTEMPT`. A non-zero exit status
//! fails the run.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;

use super::local::{PipelineRunner, RunContext, RunOutput};

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 5;

/// [`PipelineRunner`] that spawns a process.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .context("pipeline command must not be empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn env_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn tail(text: &[u8], lines: usize) -> String {
        let text = String::from_utf8_lossy(text);
        let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

#[async_trait]
impl PipelineRunner for CommandRunner {
    async fn run(&self, ctx: &RunContext) -> anyhow::Result<RunOutput> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env("PIPELINE_ID", &ctx.pipeline_id)
            .env("PIPELINE_EXECUTION_ID", &ctx.execution_id)
            .env("PIPELINE_CORRELATION_ID", &ctx.correlation_id)
            .env("PIPELINE_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Aborting the run drops this future; take the child down with it.
            .kill_on_drop(true);
        for (key, value) in &ctx.parameters {
            cmd.env(format!("PIPELINE_PARAM_{}", Self::env_key(key)), value.to_env_string());
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if !output.status.success() {
            let stderr = Self::tail(&output.stderr, STDERR_TAIL_LINES);
            anyhow::bail!("'{}' exited with {}: {}", self.program, output.status, stderr);
        }

        let last_line = Self::tail(&output.stdout, 1);
        Ok(RunOutput {
            message: Some(if last_line.is_empty() {
                format!("'{}' exited successfully", self.program)
            } else {
                last_line
            }),
            log_ref: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_store::{ParamValue, Parameters};

    fn ctx(parameters: Parameters) -> RunContext {
        RunContext {
            execution_id: "e-1".to_string(),
            pipeline_id: "daily-sales".to_string(),
            correlation_id: "c-1".to_string(),
            attempt: 2,
            parameters,
        }
    }

    fn sh(script: &str) -> CommandRunner {
        CommandRunner::new(&["sh".to_string(), "-c".to_string(), script.to_string()]).unwrap()
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(CommandRunner::new(&[]).is_err());
    }

    #[test]
    fn test_env_key_is_sanitized() {
        assert_eq!(CommandRunner::env_key("run-date.v2"), "RUN_DATE_V2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parameters_reach_the_process() {
        let mut params = Parameters::new();
        params.insert("run-date".to_string(), ParamValue::from("2024-01-01"));

        let output = sh(r#"echo "$PIPELINE_ID $PIPELINE_ATTEMPT $PIPELINE_PARAM_RUN_DATE""#)
            .run(&ctx(params))
            .await
            .unwrap();
        assert_eq!(output.message.as_deref(), Some("daily-sales 2 2024-01-01"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_last_stdout_line_is_the_message() {
        let output = sh("echo 'reading'; echo; echo '120 rows loaded'")
            .run(&ctx(Parameters::new()))
            .await
            .unwrap();
        assert_eq!(output.message.as_deref(), Some("120 rows loaded"));

        let silent = sh("true").run(&ctx(Parameters::new())).await.unwrap();
        assert_eq!(silent.message.as_deref(), Some("'sh' exited successfully"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr() {
        let err = sh("echo 'table missing' >&2; exit 3")
            .run(&ctx(Parameters::new()))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("table missing"), "{message}");
    }
}
