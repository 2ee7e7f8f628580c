//! # Lazarus: Code Generation Collaborators
//!
//! The hardening loop never talks to a model directly. It asks a
//! [`Generator`] for text and treats whatever comes back as untrusted input.
//!
//! - [`ScriptedGenerator`]: replays canned responses (replay, demos, tests).
//! - [`CommandGenerator`]: pipes the prompt into an external program and reads
//!   its stdout, either raw text or an OpenAI-style chat completion document.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// System instruction sent ahead of every request.
pub const SYSTEM_PROMPT: &str = "You are a PLC Structured Text generator.";

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("generator command is empty")]
    EmptyCommand,
    #[error("failed to run generator `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error talking to generator: {0}")]
    Io(#[from] std::io::Error),
    #[error("generator exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("generator returned no text")]
    EmptyResponse,
    #[error("generator script is empty")]
    NoResponses,
}

/// Source of candidate control logic.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produces raw code for `description`. `feedback` is the rejection
    /// message of the previous attempt, absent on the first one.
    async fn generate(
        &self,
        description: &str,
        feedback: Option<&str>,
    ) -> Result<String, GenerateError>;
}

/// Renders the full prompt text handed to a generator.
pub fn build_prompt(description: &str, feedback: Option<&str>) -> String {
    let mut prompt = format!("SYSTEM: {SYSTEM_PROMPT}\n\nUSER: {description}\n");
    if let Some(feedback) = feedback {
        prompt.push_str("\nPREVIOUS ATTEMPT REJECTED:\n");
        prompt.push_str(feedback);
        prompt.push_str("\nRegenerate the logic so that it satisfies every safety rule.\n");
    }
    prompt
}

/// Replays a fixed list of responses in order; the last one repeats forever.
#[derive(Debug)]
pub struct ScriptedGenerator {
    responses: Vec<String>,
    cursor: AtomicUsize,
    feedback_log: Mutex<Vec<Option<String>>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            cursor: AtomicUsize::new(0),
            feedback_log: Mutex::new(Vec::new()),
        }
    }

    /// Number of `generate` calls served so far.
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Feedback received on each call, in call order.
    pub fn feedback_log(&self) -> Vec<Option<String>> {
        self.feedback_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        _description: &str,
        feedback: Option<&str>,
    ) -> Result<String, GenerateError> {
        if let Ok(mut log) = self.feedback_log.lock() {
            log.push(feedback.map(str::to_string));
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(index)
            .or_else(|| self.responses.last())
            .cloned()
            .ok_or(GenerateError::NoResponses)
    }
}

/// Runs an external program per request: prompt on stdin, code on stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a command line on whitespace. No shell quoting is interpreted.
    pub fn from_command_line(line: &str) -> Result<Self, GenerateError> {
        let mut parts = line.split_whitespace();
        let program = parts.next().ok_or(GenerateError::EmptyCommand)?;
        Ok(Self::new(program, parts))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(
        &self,
        description: &str,
        feedback: Option<&str>,
    ) -> Result<String, GenerateError> {
        let prompt = build_prompt(description, feedback);
        debug!(program = %self.program, bytes = prompt.len(), "invoking generator");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GenerateError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => {}
                // The program may legitimately ignore its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(program = %self.program, status = %output.status, "generator failed");
            return Err(GenerateError::Exit {
                status: output.status.to_string(),
                stderr,
            });
        }

        let text = response_text(&String::from_utf8_lossy(&output.stdout));
        if text.trim().is_empty() {
            return Err(GenerateError::EmptyResponse);
        }
        Ok(text)
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: String,
}

/// Unwraps `choices[0].message.content` from a chat completion document;
/// anything else is taken verbatim.
fn response_text(stdout: &str) -> String {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        if let Ok(completion) = serde_json::from_str::<ChatCompletion>(trimmed) {
            if let Some(choice) = completion.choices.into_iter().next() {
                return choice.message.content;
            }
        }
    }
    stdout.to_string()
}
