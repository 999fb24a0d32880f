use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use fiscalq_queue::{ConsultationFailure, ConsultationRunner, Credentials, FailureKind, Message};

use crate::config::AutomationConfig;

const DETAIL_LIMIT: usize = 500;

/// What the automation program prints as its last stdout line.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RunnerOutput {
    Failure { error: ConsultationFailure },
    Success { messages: Vec<Message> },
}

/// [`ConsultationRunner`] backed by an external browser-automation program.
///
/// Credentials travel in `FISCALQ_LOGIN`, `FISCALQ_PASSWORD` and
/// `FISCALQ_STATE_REGISTRATION`, never on the command line. The program is killed
/// when the timeout elapses.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &AutomationConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

#[async_trait]
impl ConsultationRunner for CommandRunner {
    #[instrument(skip(self, credentials), fields(program = %self.program.display()))]
    async fn run_consultation(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Vec<Message>, ConsultationFailure> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env("FISCALQ_LOGIN", &credentials.login)
            .env("FISCALQ_PASSWORD", &credentials.password)
            .env("FISCALQ_STATE_REGISTRATION", &credentials.state_registration)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConsultationFailure::new(FailureKind::Unknown, format!("failed to start runner: {e}"))
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ConsultationFailure::new(
                    FailureKind::Unknown,
                    format!("runner i/o error: {e}"),
                ));
            }
            Err(_) => {
                return Err(ConsultationFailure::new(
                    FailureKind::Timeout,
                    format!("consultation exceeded {}s", timeout.as_secs_f64()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let parsed = parse_output(&stdout);

        match (parsed, output.status.success()) {
            (Some(RunnerOutput::Failure { error }), _) => Err(error),
            (Some(RunnerOutput::Success { messages }), true) => {
                debug!(count = messages.len(), "runner returned messages");
                Ok(messages)
            }
            (Some(RunnerOutput::Success { .. }), false) | (None, false) => {
                warn!(status = %output.status, "runner exited unsuccessfully");
                Err(ConsultationFailure::new(
                    FailureKind::Unknown,
                    format!("runner exited with {}: {}", output.status, truncate(&stderr)),
                ))
            }
            (None, true) => Err(ConsultationFailure::new(
                FailureKind::Unknown,
                format!("unparseable runner output: {}", truncate(&stdout)),
            )),
        }
    }
}

/// The last non-empty stdout line carries the result; earlier lines are logs.
fn parse_output(stdout: &str) -> Option<RunnerOutput> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}

fn truncate(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= DETAIL_LIMIT {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(DETAIL_LIMIT).collect();
    cut.push('…');
    cut
}
