//! Hand-off to an external summary generator for finished challenges.

use std::io::{self, Write};
use std::process::{Command, ExitStatus, Stdio};

use serde::Serialize;
use thiserror::Error;

use crate::app::App;
use crate::entities::{challenge, daily_log, day_task};
use crate::error::AppError;
use crate::model::ChallengeStatus;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("summary command is empty")]
    EmptyCommand,
    #[error("summary command could not be parsed: {0}")]
    Parse(String),
    #[error("summary command failed to run: {0}")]
    Io(#[from] io::Error),
    #[error("summary payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("summary command exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("summary command produced no output")]
    NoOutput,
}

/// What the generator gets to read.
#[derive(Serialize)]
pub struct SummaryRequest<'a> {
    pub challenge: &'a challenge::Model,
    pub tasks: &'a [day_task::Model],
    pub logs: &'a [daily_log::Model],
}

pub trait Summarizer {
    fn summarize(&self, request: &SummaryRequest<'_>) -> Result<String, SummaryError>;
}

/// Runs a configured command line, writes the request as JSON to its stdin
/// and takes trimmed stdout as the summary.
#[derive(Clone, Debug)]
pub struct CommandSummarizer {
    program: String,
    args: Vec<String>,
}

impl CommandSummarizer {
    pub fn from_command_line(line: &str) -> Result<Self, SummaryError> {
        let mut parts = shlex::split(line).ok_or_else(|| SummaryError::Parse(line.to_string()))?;
        if parts.is_empty() {
            return Err(SummaryError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }
}

impl Summarizer for CommandSummarizer {
    fn summarize(&self, request: &SummaryRequest<'_>) -> Result<String, SummaryError> {
        let payload = serde_json::to_vec(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // The command may finish without reading its input.
            if let Err(err) = stdin.write_all(&payload) {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    return Err(err.into());
                }
            }
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(SummaryError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let summary = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if summary.is_empty() {
            return Err(SummaryError::NoOutput);
        }
        Ok(summary)
    }
}

impl App {
    /// Builds the configured summarizer, if any.
    pub fn summarizer(&self) -> Option<CommandSummarizer> {
        let line = self.settings.summary_command.as_deref()?;
        match CommandSummarizer::from_command_line(line) {
            Ok(summarizer) => Some(summarizer),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring summary_command");
                None
            }
        }
    }

    /// Generates and stores a summary for a completed challenge. Generator
    /// failures are logged and reported as `None`; the challenge itself is
    /// left as it was.
    pub async fn refresh_ai_summary(
        &self,
        challenge_id: i64,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<challenge::Model>, AppError> {
        let detail = self.get_challenge_detail(challenge_id).await?;
        if detail.challenge.status != ChallengeStatus::Completed.as_str() {
            return Err(AppError::InvalidState(format!(
                "challenge id {challenge_id} is {}; summaries are generated after completion",
                detail.challenge.status
            )));
        }
        let request = SummaryRequest {
            challenge: &detail.challenge,
            tasks: &detail.tasks,
            logs: &detail.logs,
        };
        match summarizer.summarize(&request) {
            Ok(summary) => Ok(Some(self.set_ai_summary(challenge_id, summary).await?)),
            Err(err) => {
                tracing::warn!(challenge_id, error = %err, "summary generation failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_is_split_like_a_shell() {
        let summarizer =
            CommandSummarizer::from_command_line("llm --model 'small one' -q").expect("parse");
        assert_eq!(summarizer.program, "llm");
        assert_eq!(summarizer.args, vec!["--model", "small one", "-q"]);
    }

    #[test]
    fn blank_or_broken_command_lines_are_rejected() {
        assert!(matches!(
            CommandSummarizer::from_command_line("   "),
            Err(SummaryError::EmptyCommand)
        ));
        assert!(matches!(
            CommandSummarizer::from_command_line("llm 'unterminated"),
            Err(SummaryError::Parse(_))
        ));
    }
}
