//! Capability trait for the LLM backend driving a debate.
//!
//! The orchestrator depends on four required operations (persona turns,
//! moderator interventions, the terminal wrap-up, consensus judging) plus
//! one optional capability, opening-speaker selection, modeled as a
//! defaulted trait method returning `Ok(None)`.  Implementations translate
//! these into provider wire calls; see [`crate::clients::openai`].
//!
//! Errors carry a retriability classification so transports can share one
//! retry loop: HTTP 429/5xx and IO-level failures are retriable, everything
//! else (4xx, decode failures, oversize bodies, cancellation) is final.

use crate::parley::persona::Persona;
use crate::parley::transcript::{Consensus, DebateStatus, Turn, Usage};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// Failure surfaced by an LLM operation.
#[derive(Debug)]
pub enum LlmError {
    /// Non-success HTTP status from the provider.
    Status { code: u16, message: String },
    /// Provider-reported error object inside a 200 response.
    Api { kind: String, message: String },
    /// IO-level failure talking to the endpoint (connect, read, timeout).
    Transport(String),
    /// The request could not be built or serialized.
    BuildRequest(String),
    /// The response body was not valid wire JSON.
    Decode(String),
    /// The response body exceeded the hard ingest cap.
    OversizeBody { limit: usize },
    /// The provider returned no usable text.
    EmptyCompletion,
    /// Structured output (judge verdict, opening pick) did not parse.
    Parse(String),
    /// The caller's cancel signal fired.
    Cancelled,
    /// The per-call or debate deadline elapsed.
    DeadlineExceeded,
}

impl LlmError {
    /// Worth another attempt after backoff?
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Status { code, .. } => *code == 429 || *code >= 500,
            LlmError::Transport(_) => true,
            _ => false,
        }
    }

    /// Cancellation and deadline errors short-circuit retries and are
    /// re-interpreted by the scheduler (duration stop) or broker (stopped).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LlmError::Cancelled | LlmError::DeadlineExceeded)
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Status { code, message } => write!(f, "http {}: {}", code, message),
            LlmError::Api { kind, message } => write!(f, "api error ({}): {}", kind, message),
            LlmError::Transport(msg) => write!(f, "transport: {}", msg),
            LlmError::BuildRequest(msg) => write!(f, "build request: {}", msg),
            LlmError::Decode(msg) => write!(f, "decode: {}", msg),
            LlmError::OversizeBody { limit } => {
                write!(f, "response body exceeded {} bytes", limit)
            }
            LlmError::EmptyCompletion => write!(f, "empty completion"),
            LlmError::Parse(msg) => write!(f, "parse: {}", msg),
            LlmError::Cancelled => write!(f, "cancelled"),
            LlmError::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl Error for LlmError {}

/// Opening speaker chosen by the backend, when it supports selection.
#[derive(Debug, Clone)]
pub struct OpeningPick {
    pub persona_id: String,
    pub reason: Option<String>,
}

/// Text plus token accounting returned by a generation operation.
pub type Generation = (String, Usage);

/// The backend capability set consumed by the orchestrator.
///
/// All operations receive the full problem statement, the normalized roster,
/// and the transcript so far; prompt assembly and windowing happen behind
/// this trait.  Implementations **must** be `Send + Sync` so a single client
/// can serve concurrent runs.
#[async_trait]
pub trait DebateLlm: Send + Sync {
    /// Produce the next persona utterance for `speaker`.
    async fn generate_turn(
        &self,
        problem: &str,
        personas: &[Persona],
        turns: &[Turn],
        speaker: &Persona,
    ) -> Result<Generation, LlmError>;

    /// Produce a moderator intervention handing off to `next_speaker`.
    async fn generate_moderator(
        &self,
        problem: &str,
        personas: &[Persona],
        turns: &[Turn],
        next_speaker: &Persona,
    ) -> Result<Generation, LlmError>;

    /// Produce the terminal moderator wrap-up.
    async fn generate_final_moderator(
        &self,
        problem: &str,
        personas: &[Persona],
        turns: &[Turn],
        consensus: &Consensus,
        status: DebateStatus,
    ) -> Result<Generation, LlmError>;

    /// Evaluate the debate for consensus and return a strict verdict.
    async fn judge_consensus(
        &self,
        problem: &str,
        personas: &[Persona],
        turns: &[Turn],
    ) -> Result<(Consensus, Usage), LlmError>;

    /// Optional capability: pick the opening speaker.
    ///
    /// The default advertises "not supported" via `Ok(None)`; the scheduler
    /// then falls back to its deterministic relevance scoring.  A returned
    /// pick is only honored when its id matches a roster persona exactly.
    async fn select_opening_speaker(
        &self,
        _problem: &str,
        _personas: &[Persona],
    ) -> Result<Option<(OpeningPick, Usage)>, LlmError> {
        Ok(None)
    }
}
