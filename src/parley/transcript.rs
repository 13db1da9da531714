//! Core transcript values shared by every subsystem.
//!
//! A debate is recorded as an append-only sequence of [`Turn`]s, produced by
//! the scheduler and never mutated afterwards.  The supporting structs cover
//! token accounting ([`Usage`], [`Metrics`]), the judge verdict
//! ([`Consensus`]), and the final [`DebateResult`] value returned by a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who authored a turn: a configured persona or the synthetic moderator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    Persona,
    Moderator,
}

/// Speaker id/name used for moderator turns.
pub const MODERATOR_ID: &str = "moderator";
pub const MODERATOR_NAME: &str = "Moderator";

/// A single utterance in the transcript.
///
/// Turns are appended by the orchestrator with a fresh monotonic index and
/// are never mutated.  `content` is trimmed and non-empty by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub index: u32,
    pub speaker_id: String,
    pub speaker_name: String,
    #[serde(rename = "type")]
    pub kind: TurnKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn is_persona(&self) -> bool {
        self.kind == TurnKind::Persona
    }

    pub fn is_moderator(&self) -> bool {
        self.kind == TurnKind::Moderator
    }
}

/// Next index for an append.
///
/// Indices normally increase by one from the last turn.  A malformed history
/// (zero indices) falls back to `max(existing) + 1` so the sequence stays
/// non-decreasing.
pub fn next_turn_index(turns: &[Turn]) -> u32 {
    match turns.last() {
        None => 1,
        Some(last) if last.index > 0 => last.index + 1,
        Some(_) => turns.iter().map(|t| t.index).max().unwrap_or(0) + 1,
    }
}

/// Per-call token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        let mut u = Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        };
        // Providers occasionally omit the total; only then is it derived.
        if u.total_tokens == 0 {
            u.total_tokens = u.prompt_tokens + u.completion_tokens;
        }
        u
    }

    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Aggregated run metrics, mutated by additive accumulation after each call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Metrics {
    pub fn absorb(&mut self, usage: Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
    }
}

/// The judge's latest verdict.  Overwritten by each judge call and finalized
/// (non-empty summary guaranteed) before the terminal moderator turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Consensus {
    pub reached: bool,
    pub score: f64,
    pub summary: String,
    pub rationale: String,
}

impl Consensus {
    /// Build a verdict with the score clamped into `[0, 1]`.
    pub fn clamped(reached: bool, score: f64, summary: String, rationale: String) -> Self {
        let score = if score.is_nan() {
            0.0
        } else {
            score.max(0.0).min(1.0)
        };
        Consensus {
            reached,
            score,
            summary,
            rationale,
        }
    }

    /// Satisfied iff the judge says reached and the score clears `threshold`.
    pub fn satisfies(&self, threshold: f64) -> bool {
        self.reached && self.score >= threshold
    }
}

/// Why a debate stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    ConsensusReached,
    MaxTurnsReached,
    DurationLimitReached,
    TokenLimitReached,
    NoProgressReached,
    Error,
}

impl DebateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebateStatus::ConsensusReached => "consensus_reached",
            DebateStatus::MaxTurnsReached => "max_turns_reached",
            DebateStatus::DurationLimitReached => "duration_limit_reached",
            DebateStatus::TokenLimitReached => "token_limit_reached",
            DebateStatus::NoProgressReached => "no_progress_reached",
            DebateStatus::Error => "error",
        }
    }
}

impl fmt::Display for DebateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete outcome of one debate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateResult {
    pub problem: String,
    pub personas: Vec<crate::parley::persona::Persona>,
    pub turns: Vec<Turn>,
    pub consensus: Consensus,
    pub status: DebateStatus,
    pub metrics: Metrics,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(index: u32) -> Turn {
        Turn {
            index,
            speaker_id: "a".to_string(),
            speaker_name: "A".to_string(),
            kind: TurnKind::Persona,
            content: "hello".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn next_index_of_empty_history_is_one() {
        assert_eq!(next_turn_index(&[]), 1);
    }

    #[test]
    fn next_index_follows_last_turn() {
        let ts = vec![turn(1), turn(2), turn(3)];
        assert_eq!(next_turn_index(&ts), 4);
    }

    #[test]
    fn next_index_recovers_from_zeroed_tail() {
        let ts = vec![turn(5), turn(0)];
        assert_eq!(next_turn_index(&ts), 6);
    }

    #[test]
    fn usage_derives_missing_total() {
        let u = Usage::new(10, 5, 0);
        assert_eq!(u.total_tokens, 15);
    }

    #[test]
    fn usage_keeps_provider_total_when_it_disagrees() {
        let u = Usage::new(10, 5, 17);
        assert_eq!(u.total_tokens, 17);
    }

    #[test]
    fn consensus_score_is_clamped() {
        assert_eq!(
            Consensus::clamped(true, 1.7, "s".into(), "r".into()).score,
            1.0
        );
        assert_eq!(
            Consensus::clamped(false, -0.3, "s".into(), "r".into()).score,
            0.0
        );
    }

    #[test]
    fn status_vocabulary_is_stable() {
        assert_eq!(DebateStatus::ConsensusReached.as_str(), "consensus_reached");
        assert_eq!(DebateStatus::TokenLimitReached.as_str(), "token_limit_reached");
        assert_eq!(
            serde_json::to_string(&DebateStatus::NoProgressReached).unwrap(),
            "\"no_progress_reached\""
        );
    }
}
