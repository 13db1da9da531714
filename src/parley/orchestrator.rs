//! The debate scheduler.
//!
//! [`Orchestrator::run`] owns the whole lifecycle of one debate: it selects
//! the opening speaker, interleaves persona turns with moderator
//! interventions, invokes the consensus judge on a fixed cadence, enforces
//! the stop conditions, and always closes the transcript with a terminal
//! moderator turn, even under hard caps or backend failure.
//!
//! The loop is single-threaded and cooperative: one blocking LLM call at a
//! time, each wrapped in a deadline derived from the debate duration cap and
//! raced against the caller's cancel token.  The optional observer is
//! invoked synchronously once per appended turn, so observation order always
//! equals append order.

use crate::parley::client::{DebateLlm, LlmError};
use crate::parley::hooks::{Clock, SystemClock};
use crate::parley::persona::{normalize_personas, Persona, PersonaError};
use crate::parley::prompts::clip;
use crate::parley::signals::{resolve_next_speaker, TerminationTracker};
use crate::parley::transcript::{
    next_turn_index, Consensus, DebateResult, DebateStatus, Metrics, Turn, TurnKind, MODERATOR_ID,
    MODERATOR_NAME,
};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Tuning knobs for a run.  Out-of-range values fall back to the defaults.
#[derive(Debug, Clone, Copy)]
pub struct DebateConfig {
    /// Maximum persona turns; 0 means unbounded.
    pub max_turns: u32,
    /// Judge score required for a consensus confirmation, in `[0, 1]`.
    pub consensus_threshold: f64,
    /// Wall-clock budget for the whole debate.
    pub max_duration: Duration,
    /// Token budget across every LLM call of the run.
    pub max_total_tokens: u64,
    /// Consecutive non-improving judge verdicts before giving up.
    pub max_no_progress_judges: u32,
    /// Score improvement below this margin counts as no progress.
    pub no_progress_epsilon: f64,
}

pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.90;
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_MAX_TOTAL_TOKENS: u64 = 120_000;
pub const DEFAULT_MAX_NO_PROGRESS_JUDGES: u32 = 6;
pub const DEFAULT_NO_PROGRESS_EPSILON: f64 = 0.01;

impl Default for DebateConfig {
    fn default() -> Self {
        DebateConfig {
            max_turns: 0,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
            max_duration: DEFAULT_MAX_DURATION,
            max_total_tokens: DEFAULT_MAX_TOTAL_TOKENS,
            max_no_progress_judges: DEFAULT_MAX_NO_PROGRESS_JUDGES,
            no_progress_epsilon: DEFAULT_NO_PROGRESS_EPSILON,
        }
    }
}

impl DebateConfig {
    /// Replace out-of-range values with the defaults.
    pub fn normalized(mut self) -> Self {
        if !(0.0..=1.0).contains(&self.consensus_threshold) || self.consensus_threshold.is_nan() {
            self.consensus_threshold = DEFAULT_CONSENSUS_THRESHOLD;
        }
        if self.max_duration.as_millis() == 0 {
            self.max_duration = DEFAULT_MAX_DURATION;
        }
        if self.max_total_tokens == 0 {
            self.max_total_tokens = DEFAULT_MAX_TOTAL_TOKENS;
        }
        if self.max_no_progress_judges == 0 {
            self.max_no_progress_judges = DEFAULT_MAX_NO_PROGRESS_JUDGES;
        }
        if self.no_progress_epsilon.is_nan() || self.no_progress_epsilon < 0.0 {
            self.no_progress_epsilon = DEFAULT_NO_PROGRESS_EPSILON;
        }
        self
    }
}

/// Fatal failure of a run.  The finalized result (status `error`, terminal
/// moderator turn included) always accompanies it inside [`DebateOutcome`].
#[derive(Debug)]
pub enum DebateError {
    EmptyProblem,
    InvalidPersonas(PersonaError),
    Llm { stage: &'static str, source: LlmError },
}

impl DebateError {
    /// Did the run die to a cancel/deadline signal rather than a real fault?
    pub fn is_cancellation(&self) -> bool {
        match self {
            DebateError::Llm { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

impl fmt::Display for DebateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebateError::EmptyProblem => write!(f, "problem statement is empty"),
            DebateError::InvalidPersonas(e) => write!(f, "invalid personas: {}", e),
            DebateError::Llm { stage, source } => write!(f, "llm failure during {}: {}", stage, source),
        }
    }
}

impl Error for DebateError {}

/// What a run produced.  `result` is always well-formed (non-empty
/// transcript ending in a moderator turn, non-empty consensus summary);
/// `error` is set iff `result.status` is [`DebateStatus::Error`].
#[derive(Debug)]
pub struct DebateOutcome {
    pub result: DebateResult,
    pub error: Option<DebateError>,
}

/// Judge after every full persona round, and before a max-turns stop.
pub(crate) fn should_judge(i: u64, roster_size: usize, max_turns: u32) -> bool {
    let n = roster_size as u64;
    if n > 0 && (i + 1) % n == 0 {
        return true;
    }
    max_turns > 0 && i + 1 >= u64::from(max_turns)
}

/// Consecutive confirmations required before declaring consensus.
pub(crate) fn required_confirmations(roster_size: usize) -> u32 {
    if roster_size <= 1 {
        1
    } else {
        2
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn compact(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn overlap(field: &str, problem_words: &HashSet<String>) -> i64 {
    tokenize(field)
        .iter()
        .filter(|w| problem_words.contains(*w))
        .count() as i64
}

/// Deterministic relevance score of a persona against the problem text.
fn opening_score(p: &Persona, problem_words: &HashSet<String>, compact_problem: &str) -> i64 {
    let mut score = 0i64;
    score += 12 * overlap(&p.role, problem_words);
    for e in &p.expertise {
        score += 9 * overlap(e, problem_words);
    }
    for lens in &p.signature_lens {
        score += 7 * overlap(lens, problem_words);
    }
    for c in &p.constraints {
        score += 4 * overlap(c, problem_words);
    }
    if let Some(style) = &p.style {
        score += 3 * overlap(style, problem_words);
    }
    score += 3 * overlap(&p.stance, problem_words);
    score += 2 * overlap(&p.name, problem_words);
    if let Some(master) = &p.master_name {
        score += 2 * overlap(master, problem_words);
    }
    score += overlap(&p.id, problem_words);

    let compact_id = compact(&p.id);
    if !compact_id.is_empty() && compact_problem.contains(&compact_id) {
        score += 20;
    }
    let compact_name = compact(&p.name);
    if !compact_name.is_empty() && compact_problem.contains(&compact_name) {
        score += 10;
    }
    if let Some(master) = &p.master_name {
        let compact_master = compact(master);
        if !compact_master.is_empty() && compact_problem.contains(&compact_master) {
            score += 6;
        }
    }
    score
}

/// Index of the highest-scoring persona; ties keep roster order.
pub(crate) fn default_opening_index(personas: &[Persona], problem: &str) -> usize {
    let words = tokenize(problem);
    let compact_problem = compact(problem);
    let mut best = 0usize;
    let mut best_score = i64::MIN;
    for (idx, p) in personas.iter().enumerate() {
        let score = opening_score(p, &words, &compact_problem);
        if score > best_score {
            best = idx;
            best_score = score;
        }
    }
    best
}

/// Runs debates against a [`DebateLlm`] backend.
pub struct Orchestrator {
    llm: Arc<dyn DebateLlm>,
    config: DebateConfig,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn DebateLlm>) -> Self {
        Orchestrator {
            llm,
            config: DebateConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: DebateConfig) -> Self {
        self.config = config.normalized();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    fn remaining(&self, started: Instant) -> Duration {
        self.config
            .max_duration
            .checked_sub(started.elapsed())
            .unwrap_or_default()
    }

    /// Race one LLM call against the cancel token and the debate deadline.
    async fn bounded_call<T, F>(
        &self,
        cancel: &CancellationToken,
        started: Instant,
        fut: F,
    ) -> Result<T, LlmError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        let remaining = self.remaining(started);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            out = tokio::time::timeout(remaining, fut) => match out {
                Ok(r) => r,
                Err(_) => Err(LlmError::DeadlineExceeded),
            },
        }
    }

    /// Duration breach coincident with a cancel/deadline signal is a
    /// legitimate stop; anything else is fatal.
    fn classify_call_error(
        &self,
        stage: &'static str,
        err: LlmError,
        started: Instant,
    ) -> (DebateStatus, Option<DebateError>) {
        if err.is_cancellation() && started.elapsed() >= self.config.max_duration {
            (DebateStatus::DurationLimitReached, None)
        } else {
            (
                DebateStatus::Error,
                Some(DebateError::Llm { stage, source: err }),
            )
        }
    }

    fn over_token_cap(&self, metrics: &Metrics) -> bool {
        metrics.total_tokens >= self.config.max_total_tokens
    }

    /// Execute one debate to completion.
    ///
    /// The returned outcome always carries a finalized result; see
    /// [`DebateOutcome`].  Cancellation via `cancel` surfaces as an error
    /// outcome whose `is_cancellation()` is true, letting a broker
    /// re-interpret it as a user stop.
    pub async fn run<'a>(
        &self,
        cancel: &CancellationToken,
        problem: &str,
        personas: Vec<Persona>,
        observer: Option<Box<dyn FnMut(&Turn) + Send + 'a>>,
    ) -> DebateOutcome {
        let started = Instant::now();
        let mut observer = observer;
        let mut result = DebateResult {
            problem: problem.trim().to_string(),
            personas: Vec::new(),
            turns: Vec::new(),
            consensus: Consensus::default(),
            status: DebateStatus::Error,
            metrics: Metrics::default(),
            started_at: self.clock.now_utc(),
            ended_at: self.clock.now_utc(),
        };

        if result.problem.is_empty() {
            self.finalize(cancel, started, &mut result, &mut observer, true).await;
            return DebateOutcome {
                result,
                error: Some(DebateError::EmptyProblem),
            };
        }

        let personas = match normalize_personas(personas) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("debate rejected: {}", e);
                self.finalize(cancel, started, &mut result, &mut observer, true).await;
                return DebateOutcome {
                    result,
                    error: Some(DebateError::InvalidPersonas(e)),
                };
            }
        };
        result.personas = personas;
        let n = result.personas.len();
        let mut tracker = TerminationTracker::new(n);

        // Opening speaker: deterministic scoring, optionally overridden by
        // the backend when it advertises selection.
        let mut speaker_idx = default_opening_index(&result.personas, &result.problem);
        let opening = self
            .bounded_call(
                cancel,
                started,
                self.llm
                    .select_opening_speaker(&result.problem, &result.personas),
            )
            .await;
        match opening {
            Ok(Some((pick, usage))) => {
                result.metrics.absorb(usage);
                match result.personas.iter().position(|p| p.id == pick.persona_id) {
                    Some(pos) => {
                        log::debug!(
                            "opening speaker overridden to '{}' ({})",
                            pick.persona_id,
                            pick.reason.as_deref().unwrap_or("no reason given")
                        );
                        speaker_idx = pos;
                    }
                    None => log::warn!(
                        "opening selection returned unknown id '{}'; keeping score-based pick",
                        pick.persona_id
                    ),
                }
            }
            Ok(None) => {}
            Err(e) if e.is_cancellation() => {
                let (status, error) = self.classify_call_error("opening_selection", e, started);
                result.status = status;
                self.finalize(cancel, started, &mut result, &mut observer, false).await;
                return DebateOutcome { result, error };
            }
            Err(e) => {
                // Optional capability: degrade to the deterministic pick.
                log::warn!("opening selection failed, using score-based pick: {}", e);
            }
        }

        let mut status = DebateStatus::Error;
        let mut fatal: Option<DebateError> = None;

        if self.over_token_cap(&result.metrics) {
            status = DebateStatus::TokenLimitReached;
        } else {
            let mut confirmations = 0u32;
            let mut no_progress = 0u32;
            let mut prev_score: Option<f64> = None;
            let mut i: u64 = 0;

            loop {
                if self.config.max_turns > 0 && i >= u64::from(self.config.max_turns) {
                    status = DebateStatus::MaxTurnsReached;
                    break;
                }
                if started.elapsed() >= self.config.max_duration {
                    status = DebateStatus::DurationLimitReached;
                    break;
                }

                let speaker = result.personas[speaker_idx].clone();
                let turn_call = self
                    .bounded_call(
                        cancel,
                        started,
                        self.llm.generate_turn(
                            &result.problem,
                            &result.personas,
                            &result.turns,
                            &speaker,
                        ),
                    )
                    .await;
                match turn_call {
                    Ok((content, usage)) => {
                        result.metrics.absorb(usage);
                        self.push_turn(
                            &mut result,
                            &mut observer,
                            &speaker.id,
                            speaker.display_name(),
                            TurnKind::Persona,
                            content,
                        );
                        if let Some(turn) = result.turns.last() {
                            tracker.observe(turn);
                        }
                    }
                    Err(e) => {
                        let (s, err) = self.classify_call_error("persona_turn", e, started);
                        status = s;
                        fatal = err;
                        break;
                    }
                }

                if self.over_token_cap(&result.metrics) {
                    status = DebateStatus::TokenLimitReached;
                    break;
                }

                if should_judge(i, n, self.config.max_turns) {
                    let judge_call = self
                        .bounded_call(
                            cancel,
                            started,
                            self.llm.judge_consensus(
                                &result.problem,
                                &result.personas,
                                &result.turns,
                            ),
                        )
                        .await;
                    match judge_call {
                        Ok((consensus, usage)) => {
                            result.metrics.absorb(usage);
                            log::debug!(
                                "judge: reached={} score={:.3}",
                                consensus.reached,
                                consensus.score
                            );
                            result.consensus = consensus;
                            if self.over_token_cap(&result.metrics) {
                                status = DebateStatus::TokenLimitReached;
                                break;
                            }
                            if result.consensus.satisfies(self.config.consensus_threshold) {
                                confirmations += 1;
                            } else {
                                confirmations = 0;
                            }
                            if confirmations >= required_confirmations(n) {
                                status = DebateStatus::ConsensusReached;
                                break;
                            }
                            let score = result.consensus.score;
                            if let Some(prev) = prev_score {
                                if score <= prev + self.config.no_progress_epsilon {
                                    no_progress += 1;
                                } else {
                                    no_progress = 0;
                                }
                            }
                            prev_score = Some(score);
                            if no_progress >= self.config.max_no_progress_judges {
                                status = DebateStatus::NoProgressReached;
                                break;
                            }
                        }
                        Err(e) => {
                            let (s, err) = self.classify_call_error("judge", e, started);
                            status = s;
                            fatal = err;
                            break;
                        }
                    }
                    if tracker.suggests_stop() {
                        // Advisory: the personas voted to close and the debate
                        // has stagnated.  The judge cadence stays authoritative.
                        log::debug!("termination tracker suggests stopping");
                    }
                }

                if self.config.max_turns > 0 && i + 1 >= u64::from(self.config.max_turns) {
                    status = DebateStatus::MaxTurnsReached;
                    break;
                }

                // Handoff: honor an explicit or implied NEXT signal from the
                // turn just appended, else continue round-robin.
                let next_idx = result
                    .turns
                    .last()
                    .filter(|t| t.is_persona())
                    .and_then(|t| resolve_next_speaker(&t.content, &result.personas, &speaker.id))
                    .and_then(|id| result.personas.iter().position(|p| p.id == id))
                    .unwrap_or((speaker_idx + 1) % n);
                let next_speaker = result.personas[next_idx].clone();

                let moderator_call = self
                    .bounded_call(
                        cancel,
                        started,
                        self.llm.generate_moderator(
                            &result.problem,
                            &result.personas,
                            &result.turns,
                            &next_speaker,
                        ),
                    )
                    .await;
                match moderator_call {
                    Ok((content, usage)) => {
                        result.metrics.absorb(usage);
                        self.push_turn(
                            &mut result,
                            &mut observer,
                            MODERATOR_ID,
                            MODERATOR_NAME,
                            TurnKind::Moderator,
                            content,
                        );
                    }
                    Err(e) => {
                        let (s, err) = self.classify_call_error("moderator", e, started);
                        status = s;
                        fatal = err;
                        break;
                    }
                }

                if self.over_token_cap(&result.metrics) {
                    status = DebateStatus::TokenLimitReached;
                    break;
                }

                speaker_idx = next_idx;
                i += 1;
            }
        }

        result.status = status;
        self.finalize(cancel, started, &mut result, &mut observer, false).await;
        DebateOutcome {
            result,
            error: fatal,
        }
    }

    fn push_turn<'a>(
        &self,
        result: &mut DebateResult,
        observer: &mut Option<Box<dyn FnMut(&Turn) + Send + 'a>>,
        speaker_id: &str,
        speaker_name: &str,
        kind: TurnKind,
        content: String,
    ) {
        let turn = Turn {
            index: next_turn_index(&result.turns),
            speaker_id: speaker_id.to_string(),
            speaker_name: speaker_name.to_string(),
            kind,
            content: content.trim().to_string(),
            timestamp: self.clock.now_utc(),
        };
        result.turns.push(turn);
        if let (Some(obs), Some(turn)) = (observer.as_mut(), result.turns.last()) {
            obs(turn);
        }
    }

    /// Close the transcript: guarantee a consensus summary, append the
    /// terminal moderator turn (LLM-backed unless a hard cap forbids it),
    /// apply the final-call token downgrade, and stamp the end time.
    async fn finalize<'a>(
        &self,
        cancel: &CancellationToken,
        started: Instant,
        result: &mut DebateResult,
        observer: &mut Option<Box<dyn FnMut(&Turn) + Send + 'a>>,
        force_fallback: bool,
    ) {
        if result.consensus.summary.trim().is_empty() {
            result.consensus.summary = match result.turns.last() {
                Some(t) => format!(
                    "Discussion ended without explicit consensus. Last statement by {}: {}",
                    t.speaker_name,
                    clip(&t.content, 240)
                ),
                None => "Discussion ended without explicit consensus.".to_string(),
            };
        }

        let skip_llm = force_fallback
            || self.over_token_cap(&result.metrics)
            || matches!(
                result.status,
                DebateStatus::DurationLimitReached | DebateStatus::TokenLimitReached
            );

        let mut content = None;
        if !skip_llm {
            let final_call = self
                .bounded_call(
                    cancel,
                    started,
                    self.llm.generate_final_moderator(
                        &result.problem,
                        &result.personas,
                        &result.turns,
                        &result.consensus,
                        result.status,
                    ),
                )
                .await;
            match final_call {
                Ok((text, usage)) => {
                    result.metrics.absorb(usage);
                    // The final call is allowed to run even close to the cap;
                    // crossing it here downgrades the status.
                    if self.over_token_cap(&result.metrics) {
                        result.status = DebateStatus::TokenLimitReached;
                    }
                    content = Some(text);
                }
                Err(e) => log::warn!("final moderator call failed, using fallback: {}", e),
            }
        }
        let content = content.unwrap_or_else(|| {
            format!(
                "Final recap: {}\nOverall assessment: status={}, consensus_score={:.2}.",
                result.consensus.summary, result.status, result.consensus.score
            )
        });

        self.push_turn(
            result,
            observer,
            MODERATOR_ID,
            MODERATOR_NAME,
            TurnKind::Moderator,
            content,
        );
        result.ended_at = self.clock.now_utc();
        result.metrics.latency_ms = started.elapsed().as_millis() as u64;
        log::debug!(
            "debate finished: status={} turns={} tokens={}",
            result.status,
            result.turns.len(),
            result.metrics.total_tokens
        );
    }
}
