use async_trait::async_trait;
use parley::client::{DebateLlm, Generation, LlmError, OpeningPick};
use parley::orchestrator::{DebateConfig, DebateError, Orchestrator};
use parley::persona::Persona;
use parley::transcript::{Consensus, DebateStatus, Turn, TurnKind, Usage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type JudgeFn = Box<dyn Fn(usize, &[Turn]) -> (bool, f64) + Send + Sync>;
type TurnFn = Box<dyn Fn(&Persona, &[Turn]) -> String + Send + Sync>;

#[derive(Default, Clone, Debug)]
struct CallCounts {
    turns: usize,
    moderators: usize,
    finals: usize,
    judges: usize,
}

/// Scripted backend: fixed latency and usage per call, judge verdicts and
/// turn content driven by closures.
struct ScriptedLlm {
    usage: Usage,
    latency: Duration,
    judge: JudgeFn,
    turn_content: TurnFn,
    fail_turn_call: Option<usize>,
    opening_pick: Option<OpeningPick>,
    counts: Mutex<CallCounts>,
    turn_speakers: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new() -> Self {
        ScriptedLlm {
            usage: Usage::new(10, 5, 0),
            latency: Duration::from_millis(0),
            judge: Box::new(|_, _| (false, 0.3)),
            turn_content: Box::new(|speaker, turns| {
                format!(
                    "Argument {} from {} citing [1].",
                    turns.len() + 1,
                    speaker.id
                )
            }),
            fail_turn_call: None,
            opening_pick: None,
            counts: Mutex::new(CallCounts::default()),
            turn_speakers: Mutex::new(Vec::new()),
        }
    }

    fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.usage = Usage::new(prompt, completion, 0);
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_judge(mut self, judge: JudgeFn) -> Self {
        self.judge = judge;
        self
    }

    fn with_turn_content(mut self, turn_content: TurnFn) -> Self {
        self.turn_content = turn_content;
        self
    }

    fn counts(&self) -> CallCounts {
        self.counts.lock().unwrap().clone()
    }

    fn turn_speakers(&self) -> Vec<String> {
        self.turn_speakers.lock().unwrap().clone()
    }
}

#[async_trait]
impl DebateLlm for ScriptedLlm {
    async fn generate_turn(
        &self,
        _problem: &str,
        _personas: &[Persona],
        turns: &[Turn],
        speaker: &Persona,
    ) -> Result<Generation, LlmError> {
        if self.latency > Duration::from_millis(0) {
            tokio::time::sleep(self.latency).await;
        }
        let call_number = {
            let mut counts = self.counts.lock().unwrap();
            counts.turns += 1;
            counts.turns
        };
        if self.fail_turn_call == Some(call_number) {
            return Err(LlmError::Status {
                code: 400,
                message: "scripted failure".to_string(),
            });
        }
        self.turn_speakers.lock().unwrap().push(speaker.id.clone());
        Ok(((self.turn_content)(speaker, turns), self.usage))
    }

    async fn generate_moderator(
        &self,
        _problem: &str,
        _personas: &[Persona],
        turns: &[Turn],
        next_speaker: &Persona,
    ) -> Result<Generation, LlmError> {
        if self.latency > Duration::from_millis(0) {
            tokio::time::sleep(self.latency).await;
        }
        self.counts.lock().unwrap().moderators += 1;
        Ok((
            format!(
                "Synthesis over {} turns; {} should answer next.",
                turns.len(),
                next_speaker.id
            ),
            self.usage,
        ))
    }

    async fn generate_final_moderator(
        &self,
        _problem: &str,
        _personas: &[Persona],
        _turns: &[Turn],
        consensus: &Consensus,
        status: DebateStatus,
    ) -> Result<Generation, LlmError> {
        self.counts.lock().unwrap().finals += 1;
        Ok((
            format!("Closing wrap-up ({}, score {:.2}).", status, consensus.score),
            self.usage,
        ))
    }

    async fn judge_consensus(
        &self,
        _problem: &str,
        _personas: &[Persona],
        turns: &[Turn],
    ) -> Result<(Consensus, Usage), LlmError> {
        let call_number = {
            let mut counts = self.counts.lock().unwrap();
            counts.judges += 1;
            counts.judges
        };
        let (reached, score) = (self.judge)(call_number, turns);
        Ok((
            Consensus::clamped(
                reached,
                score,
                "judged state of the debate".to_string(),
                "compared positions across speakers".to_string(),
            ),
            self.usage,
        ))
    }

    async fn select_opening_speaker(
        &self,
        _problem: &str,
        _personas: &[Persona],
    ) -> Result<Option<(OpeningPick, Usage)>, LlmError> {
        match &self.opening_pick {
            Some(pick) => Ok(Some((pick.clone(), self.usage))),
            None => Ok(None),
        }
    }
}

fn two_personas() -> Vec<Persona> {
    vec![
        Persona::new("a", "Ada", "architect"),
        Persona::new("o", "Ola", "operator"),
    ]
}

fn assert_invariants(result: &parley::transcript::DebateResult) {
    assert!(!result.turns.is_empty());
    assert_eq!(
        result.turns.last().map(|t| t.kind),
        Some(TurnKind::Moderator),
        "transcript must end with a moderator turn"
    );
    assert!(!result.consensus.summary.trim().is_empty());
    let mut prev_index = 0;
    for turn in &result.turns {
        assert!(!turn.content.trim().is_empty());
        assert!(turn.index >= prev_index, "indices must be non-decreasing");
        prev_index = turn.index;
    }
}

// Scenario: consensus confirmed twice once three turns exist.
#[tokio::test]
async fn consensus_is_reached_after_two_confirmations() {
    let llm = Arc::new(
        ScriptedLlm::new().with_judge(Box::new(|_, turns| (turns.len() >= 3, 0.9))),
    );
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 8,
        consensus_threshold: 0.75,
        ..DebateConfig::default()
    });

    let observed: Arc<Mutex<Vec<Turn>>> = Arc::new(Mutex::new(Vec::new()));
    let observer_log = Arc::clone(&observed);
    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(
            &cancel,
            "Should we shard the database?",
            two_personas(),
            Some(Box::new(move |t: &Turn| {
                observer_log.lock().unwrap().push(t.clone())
            })),
        )
        .await;

    assert!(outcome.error.is_none());
    let result = outcome.result;
    assert_invariants(&result);
    assert_eq!(result.status, DebateStatus::ConsensusReached);
    assert_eq!(result.turns.len(), 8);

    let counts = llm.counts();
    assert_eq!(counts.turns, 4);
    assert_eq!(counts.moderators, 3);
    assert_eq!(counts.finals, 1);
    assert_eq!(counts.judges, 2);

    // Observer sees every turn, in append order, with monotonic indices.
    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), result.turns.len());
    for (seen, kept) in observed.iter().zip(result.turns.iter()) {
        assert_eq!(seen.index, kept.index);
        assert_eq!(seen.content, kept.content);
    }
    let indices: Vec<u32> = observed.iter().map(|t| t.index).collect();
    assert_eq!(indices, (1..=8).collect::<Vec<u32>>());
}

// Scenario: the judge never approves and the turn cap closes the debate.
#[tokio::test]
async fn max_turns_stops_the_debate() {
    let llm = Arc::new(ScriptedLlm::new());
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 4,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "Pick a caching strategy.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    let result = outcome.result;
    assert_invariants(&result);
    assert_eq!(result.status, DebateStatus::MaxTurnsReached);
    // 4 persona + 3 interleaved moderator + 1 final moderator.
    assert_eq!(result.turns.len(), 8);
    let persona_turns = result.turns.iter().filter(|t| t.is_persona()).count();
    assert_eq!(persona_turns, 4);

    let counts = llm.counts();
    assert_eq!(counts.finals, 1);
    assert_eq!(counts.moderators, 3);
}

// Scenario: the very first turn blows the token budget.
#[tokio::test]
async fn token_limit_short_circuits_to_the_fallback_terminal() {
    let llm = Arc::new(ScriptedLlm::new().with_usage(10, 5));
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_total_tokens: 10,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "Trim the budget.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    let result = outcome.result;
    assert_invariants(&result);
    assert_eq!(result.status, DebateStatus::TokenLimitReached);
    assert_eq!(result.turns.len(), 2);
    assert!(result.turns[0].is_persona());
    assert!(result.turns[1].is_moderator());
    assert!(result.turns[1].content.starts_with("Final recap:"));

    let counts = llm.counts();
    assert_eq!(counts.moderators, 0);
    assert_eq!(counts.finals, 0);
}

// Scenario: every call outlasts the debate duration budget.
#[tokio::test]
async fn duration_limit_yields_only_the_fallback_terminal() {
    let llm = Arc::new(ScriptedLlm::new().with_latency(Duration::from_millis(40)));
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_duration: Duration::from_millis(10),
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "Beat the clock.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    let result = outcome.result;
    assert_invariants(&result);
    assert_eq!(result.status, DebateStatus::DurationLimitReached);
    assert_eq!(result.turns.len(), 1);
    assert!(result.turns[0].is_moderator());
    assert!(result.turns[0].content.starts_with("Final recap:"));
    assert_eq!(llm.counts().finals, 0);
}

// Scenario: the judge's score never improves.
#[tokio::test]
async fn stagnant_judge_scores_stop_the_debate() {
    let llm = Arc::new(ScriptedLlm::new().with_judge(Box::new(|_, _| (false, 0.2))));
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_no_progress_judges: 2,
        no_progress_epsilon: 1e-6,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "Find common ground.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    let result = outcome.result;
    assert_invariants(&result);
    assert_eq!(result.status, DebateStatus::NoProgressReached);
    let persona_turns = result.turns.iter().filter(|t| t.is_persona()).count();
    assert!(persona_turns >= 6, "got {} persona turns", persona_turns);
    // First judge sample only seeds prev_score; two stagnant samples follow.
    assert_eq!(llm.counts().judges, 3);
}

#[tokio::test]
async fn single_confirmation_is_not_consensus_for_two_personas() {
    // Judge approves exactly once (call 2), then withdraws.
    let llm = Arc::new(ScriptedLlm::new().with_judge(Box::new(|call, _| {
        if call == 2 {
            (true, 0.95)
        } else {
            (false, 0.4)
        }
    })));
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 8,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "Agree on anything.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.status, DebateStatus::MaxTurnsReached);
}

#[tokio::test]
async fn explicit_next_directive_reorders_the_rotation() {
    let personas = vec![
        Persona::new("a", "Ada", "architect"),
        Persona::new("b", "Bo", "operator"),
        Persona::new("c", "Cho", "economist"),
    ];
    // Every speaker hands off to "c" explicitly.
    let llm = Arc::new(
        ScriptedLlm::new().with_turn_content(Box::new(|speaker, _| {
            format!("Point from {}.\nNEXT: c\nCLOSE: no\nNEW_POINT: yes", speaker.id)
        })),
    );
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 3,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "An architect should open this.", personas, None)
        .await;

    assert!(outcome.error.is_none());
    let speakers = llm.turn_speakers();
    assert_eq!(speakers.len(), 3);
    // The opener follows deterministic scoring; afterwards the explicit
    // handoff pins the rotation to "c" (who then hands off elsewhere since
    // self-handoffs are ignored, falling back to round-robin).
    assert_eq!(speakers[0], "a");
    assert_eq!(speakers[1], "c");
    assert_ne!(speakers[2], "c");
}

#[tokio::test]
async fn llm_opening_pick_overrides_deterministic_scoring() {
    let mut llm = ScriptedLlm::new();
    llm.opening_pick = Some(OpeningPick {
        persona_id: "o".to_string(),
        reason: Some("operations problem".to_string()),
    });
    let llm = Arc::new(llm);
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 1,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "An architect should open this.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    assert_eq!(llm.turn_speakers(), vec!["o".to_string()]);
}

#[tokio::test]
async fn unknown_opening_pick_keeps_the_scored_default() {
    let mut llm = ScriptedLlm::new();
    llm.opening_pick = Some(OpeningPick {
        persona_id: "ghost".to_string(),
        reason: None,
    });
    let llm = Arc::new(llm);
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 1,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "An architect should open this.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    assert_eq!(llm.turn_speakers(), vec!["a".to_string()]);
}

#[tokio::test]
async fn empty_problem_finalizes_as_error() {
    let llm = Arc::new(ScriptedLlm::new());
    let orchestrator = Orchestrator::new(llm.clone());

    let cancel = CancellationToken::new();
    let outcome = orchestrator.run(&cancel, "   ", two_personas(), None).await;

    assert!(matches!(outcome.error, Some(DebateError::EmptyProblem)));
    let result = outcome.result;
    assert_eq!(result.status, DebateStatus::Error);
    assert_invariants(&result);
    assert_eq!(result.turns.len(), 1);
    assert_eq!(llm.counts().turns, 0);
}

#[tokio::test]
async fn invalid_roster_finalizes_as_error() {
    let llm = Arc::new(ScriptedLlm::new());
    let orchestrator = Orchestrator::new(llm.clone());

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(
            &cancel,
            "A problem.",
            vec![Persona::new("solo", "Solo", "thinker")],
            None,
        )
        .await;

    assert!(matches!(
        outcome.error,
        Some(DebateError::InvalidPersonas(_))
    ));
    assert_eq!(outcome.result.status, DebateStatus::Error);
    assert_invariants(&outcome.result);
}

#[tokio::test]
async fn fatal_llm_error_surfaces_with_a_terminal_turn() {
    let mut llm = ScriptedLlm::new();
    llm.fail_turn_call = Some(2);
    let llm = Arc::new(llm);
    let orchestrator = Orchestrator::new(llm.clone());

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "A problem.", two_personas(), None)
        .await;

    let error = outcome.error.expect("expected a fatal error");
    assert!(matches!(error, DebateError::Llm { stage: "persona_turn", .. }));
    assert!(!error.is_cancellation());
    assert_eq!(outcome.result.status, DebateStatus::Error);
    assert_invariants(&outcome.result);
}

#[tokio::test]
async fn cancellation_surfaces_as_a_cancellation_error() {
    let llm = Arc::new(ScriptedLlm::new().with_latency(Duration::from_millis(50)));
    let orchestrator = Orchestrator::new(llm.clone());

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        run_cancel.cancel();
    });

    let outcome = orchestrator
        .run(&cancel, "A problem.", two_personas(), None)
        .await;

    let error = outcome.error.expect("expected a cancellation error");
    assert!(error.is_cancellation());
    assert_eq!(outcome.result.status, DebateStatus::Error);
    assert_invariants(&outcome.result);
}

#[tokio::test]
async fn usage_accumulates_into_metrics() {
    let llm = Arc::new(ScriptedLlm::new().with_usage(7, 3));
    let orchestrator = Orchestrator::new(llm.clone()).with_config(DebateConfig {
        max_turns: 2,
        ..DebateConfig::default()
    });

    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .run(&cancel, "Count the tokens.", two_personas(), None)
        .await;

    assert!(outcome.error.is_none());
    let metrics = outcome.result.metrics;
    // 2 persona + 1 moderator + 1 judge + 1 final = 5 calls of 10 tokens.
    assert_eq!(metrics.total_tokens, 50);
    assert_eq!(metrics.prompt_tokens, 35);
    assert_eq!(metrics.completion_tokens, 15);
    assert_eq!(
        metrics.prompt_tokens + metrics.completion_tokens,
        metrics.total_tokens
    );
}
