//! Test execution.
//!
//! `TestRunner` is the seam the application uses to run a project's tests.
//! `MochaRunner` spawns the configured command inside the project directory
//! and parses the JSON report Mocha writes to stdout.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use strip_ansi_escapes::strip;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::project::RunReport;

/// Longest stderr excerpt carried in an error.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Errors that can occur while running a project's tests.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("project directory {} does not exist", .0.display())]
    MissingProject(PathBuf),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` produced no test report ({status}): {stderr}")]
    NoReport {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Runs the test suite of a project directory.
pub trait TestRunner: Send + Sync + 'static {
    fn run(&self, path: &Path) -> impl Future<Output = Result<RunReport, RunError>> + Send;
}

/// Runs Mocha (or any command emitting a Mocha-style JSON report).
#[derive(Debug, Clone)]
pub struct MochaRunner {
    cmd: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl MochaRunner {
    pub const DEFAULT_COMMAND: &'static str = "npx mocha --reporter json";

    pub fn new(cmd: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
            env,
        }
    }

    /// Builds a runner from a shell-style command line.
    pub fn from_command_line(line: &str, env: HashMap<String, String>) -> Result<Self> {
        let mut parts = shell_words::split(line)
            .with_context(|| format!("failed to parse runner command `{}`", line))?;
        if parts.is_empty() {
            return Err(anyhow!("empty runner command"));
        }
        let cmd = parts.remove(0);
        Ok(Self::new(cmd, parts, env))
    }

    /// The command line as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.cmd.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        shell_words::join(parts)
    }
}

impl Default for MochaRunner {
    fn default() -> Self {
        Self::new(
            "npx",
            vec![
                "mocha".to_string(),
                "--reporter".to_string(),
                "json".to_string(),
            ],
            HashMap::new(),
        )
    }
}

impl TestRunner for MochaRunner {
    async fn run(&self, path: &Path) -> Result<RunReport, RunError> {
        if !path.is_dir() {
            return Err(RunError::MissingProject(path.to_path_buf()));
        }
        let command_line = self.command_line();
        info!(path = %path.display(), command = %command_line, "running tests");

        let mut command = Command::new(&self.cmd);
        command.args(&self.args).current_dir(path);
        if !self.env.is_empty() {
            command.envs(&self.env);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        let output = command.output().await.map_err(|source| RunError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(
            path = %path.display(),
            code = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "test command exited"
        );

        // Mocha exits with the failure count, so a report wins over the exit status.
        match extract_report(&stdout) {
            Some(report) => Ok(report),
            None => Err(RunError::NoReport {
                command: command_line,
                status: match output.status.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                },
                stderr: stderr_tail(&output.stderr),
            }),
        }
    }
}

/// Finds the JSON report in the runner's stdout.
///
/// Tests may print before the reporter does, so besides the whole output every
/// line consisting of a lone `{` is tried as the start of the report. Anything
/// after the report is ignored.
pub fn extract_report(stdout: &str) -> Option<RunReport> {
    if let Some(report) = parse_leading_report(stdout.trim_start()) {
        return Some(report);
    }
    let mut offset = 0;
    for line in stdout.split_inclusive('\n') {
        if line.trim_end() == "{" {
            if let Some(report) = parse_leading_report(&stdout[offset..]) {
                return Some(report);
            }
        }
        offset += line.len();
    }
    None
}

fn parse_leading_report(text: &str) -> Option<RunReport> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<RunReport>()
        .next()
        .and_then(|res| res.ok())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let stripped = strip(stderr);
    let text = String::from_utf8_lossy(&stripped);
    let text = text.trim();
    if text.is_empty() {
        return "no output on stderr".to_string();
    }
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - STDERR_TAIL_CHARS).collect();
    format!("...{}", tail)
}
