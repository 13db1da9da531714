//! Prompt assembly for every backend operation.
//!
//! Pure functions from `(problem, roster, transcript, speaker)` to system
//! and user prompt strings.  Long debates are kept coherent by a
//! [`PromptBudget`]: a compression level that shrinks the recent-log window,
//! per-turn summary lengths, and the breadth of the interaction memory
//! snapshot, each with a floor so short debates stay fully readable.

use crate::parley::persona::Persona;
use crate::parley::transcript::{Consensus, DebateStatus, Turn, TurnKind};
use std::collections::HashSet;

/// Compression level derived from debate length and roster size.
///
/// Level increments at turn counts 12, 24, and 40 and once more for rosters
/// of 8 or more personas, saturating at 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    level: usize,
}

impl PromptBudget {
    pub fn for_debate(turn_count: usize, persona_count: usize) -> Self {
        let mut level = 0;
        for threshold in &[12usize, 24, 40] {
            if turn_count >= *threshold {
                level += 1;
            }
        }
        if persona_count >= 8 {
            level += 1;
        }
        PromptBudget {
            level: level.min(4),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Recent-log window for persona-turn prompts (base 10 turns).
    pub fn persona_window(&self) -> usize {
        (10usize).saturating_sub(2 * self.level).max(4)
    }

    /// Recent-log window for moderator prompts (base 12 turns).
    pub fn moderator_window(&self) -> usize {
        (12usize).saturating_sub(2 * self.level).max(5)
    }

    /// Recent-log window for judge prompts (base 24 turns).
    pub fn judge_window(&self) -> usize {
        (24usize).saturating_sub(4 * self.level).max(8)
    }

    /// Per-turn summary cap (runes) in persona-turn prompts.
    pub fn persona_summary_runes(&self) -> usize {
        (180usize).saturating_sub(25 * self.level).max(80)
    }

    /// Per-turn summary cap (runes) in moderator prompts.
    pub fn moderator_summary_runes(&self) -> usize {
        (200usize).saturating_sub(25 * self.level).max(100)
    }

    /// Per-turn summary cap (runes) in judge prompts.
    pub fn judge_summary_runes(&self) -> usize {
        (220usize).saturating_sub(30 * self.level).max(100)
    }

    /// Memory-anchor turns quoted in the moderator snapshot.
    pub fn anchor_count(&self) -> usize {
        const ANCHORS: [usize; 5] = [4, 4, 3, 3, 2];
        ANCHORS[self.level]
    }

    /// Speakers covered by the latest-claim list.
    pub fn claim_count(&self) -> usize {
        const CLAIMS: [usize; 5] = [6, 5, 4, 3, 3];
        CLAIMS[self.level]
    }

    /// Per-claim cap (runes) in memory snapshots.
    pub fn claim_runes(&self) -> usize {
        (160usize).saturating_sub(20 * self.level).max(70)
    }
}

/// Collapse whitespace and clip to `max_runes` characters.
pub fn clip(text: &str, max_runes: usize) -> String {
    let mut out = String::new();
    let mut last_was_space = false;
    for ch in text.chars() {
        let ch = if ch.is_whitespace() { ' ' } else { ch };
        if ch == ' ' {
            if last_was_space || out.is_empty() {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = false;
        }
        out.push(ch);
    }
    let trimmed = out.trim_end();
    if trimmed.chars().count() <= max_runes {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(max_runes).collect();
    clipped.push_str("...");
    clipped
}

fn speaker_label(turn: &Turn) -> String {
    match turn.kind {
        TurnKind::Persona => format!("{} ({})", turn.speaker_name, turn.speaker_id),
        TurnKind::Moderator => turn.speaker_name.clone(),
    }
}

/// Render the last `window` turns, one summarized line each.
fn render_log(turns: &[Turn], window: usize, summary_runes: usize) -> String {
    if turns.is_empty() {
        return "(no turns yet)".to_string();
    }
    let start = turns.len().saturating_sub(window);
    let mut out = String::new();
    if start > 0 {
        out.push_str(&format!("({} earlier turns omitted)\n", start));
    }
    for turn in &turns[start..] {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            turn.index,
            speaker_label(turn),
            clip(&turn.content, summary_runes)
        ));
    }
    out
}

fn participants_listing(personas: &[Persona]) -> String {
    let mut out = String::new();
    for p in personas {
        out.push_str(&format!("- {} ({}): {}", p.display_name(), p.id, p.role));
        if let Some(master) = &p.master_name {
            out.push_str(&format!(" | master_name={}", master));
        }
        out.push('\n');
    }
    out
}

fn speaker_profile(speaker: &Persona) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "id: {}\nname: {}\nrole: {}\nstance: {}\n",
        speaker.id,
        speaker.display_name(),
        speaker.role,
        speaker.stance
    ));
    if let Some(style) = &speaker.style {
        out.push_str(&format!("style: {}\n", style));
    }
    if let Some(master) = &speaker.master_name {
        out.push_str(&format!(
            "master_name: {} (argue in this thinker's manner; never claim to be them)\n",
            master
        ));
    }
    if !speaker.expertise.is_empty() {
        out.push_str(&format!("expertise: {}\n", speaker.expertise.join(", ")));
    }
    if !speaker.signature_lens.is_empty() {
        out.push_str(&format!(
            "signature_lens: {}\n",
            speaker.signature_lens.join(", ")
        ));
    }
    if !speaker.constraints.is_empty() {
        out.push_str(&format!("constraints: {}\n", speaker.constraints.join(", ")));
    }
    out
}

/// Latest persona turn authored by `speaker_id`, if any.
fn latest_claim_of<'a>(turns: &'a [Turn], speaker_id: &str) -> Option<&'a Turn> {
    turns
        .iter()
        .rev()
        .find(|t| t.is_persona() && t.speaker_id == speaker_id)
}

/// Latest persona turn authored by anyone but `speaker_id`.
fn latest_peer_claim<'a>(turns: &'a [Turn], speaker_id: &str) -> Option<&'a Turn> {
    turns
        .iter()
        .rev()
        .find(|t| t.is_persona() && t.speaker_id != speaker_id)
}

fn latest_moderator_ask(turns: &[Turn]) -> Option<&Turn> {
    turns.iter().rev().find(|t| t.is_moderator())
}

/// Newest claim per distinct persona speaker, newest first, capped at `max`.
fn latest_claims(turns: &[Turn], max: usize) -> Vec<&Turn> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for turn in turns.iter().rev() {
        if !turn.is_persona() {
            continue;
        }
        if seen.insert(turn.speaker_id.as_str()) {
            out.push(turn);
            if out.len() >= max {
                break;
            }
        }
    }
    out
}

/// `A (claim) vs B (claim)` with the latest persona speaker as one pole.
fn tension_candidate(turns: &[Turn], claim_runes: usize) -> Option<String> {
    let latest = turns.iter().rev().find(|t| t.is_persona())?;
    let opposing = latest_peer_claim(turns, &latest.speaker_id)?;
    Some(format!(
        "{} ({}) vs {} ({})",
        latest.speaker_name,
        clip(&latest.content, claim_runes),
        opposing.speaker_name,
        clip(&opposing.content, claim_runes)
    ))
}

/// The prior moderator ask and the first persona response that followed it.
fn loop_status(turns: &[Turn], claim_runes: usize) -> String {
    let ask_pos = match turns.iter().rposition(|t| t.is_moderator()) {
        Some(pos) => pos,
        None => return "No moderator question has been asked yet.".to_string(),
    };
    let mut out = format!(
        "Previous moderator ask: {}\n",
        clip(&turns[ask_pos].content, claim_runes)
    );
    match turns[ask_pos + 1..].iter().find(|t| t.is_persona()) {
        Some(response) => out.push_str(&format!(
            "First response ({}): {}\n",
            response.speaker_name,
            clip(&response.content, claim_runes)
        )),
        None => out.push_str("No persona has responded to it yet.\n"),
    }
    out.push_str("State whether that ask is now answered, partially answered, or still open.");
    out
}

// ---------------------------------------------------------------------------
// Persona turn
// ---------------------------------------------------------------------------

pub fn persona_system_prompt(speaker: &Persona) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are {}, speaking as the persona '{}' in a structured multi-persona debate.\n",
        speaker.display_name(),
        speaker.id
    ));
    out.push_str("Always answer in the same language as the problem statement.\n");
    out.push_str(
        "Make exactly one concrete argument, structured as \
         core claim -> reason/mechanism -> practical implication.\n",
    );
    out.push_str("Address at least one counterpoint from another participant, naming them.\n");
    out.push_str("Cite 1-2 prior turns by [index].\n");
    out.push_str(
        "If the moderator asked you a question, answer it in your first sentence.\n",
    );
    if let Some(master) = &speaker.master_name {
        out.push_str(&format!(
            "Channel the reasoning style of {}, but never claim to be the real person \
             and never fabricate specific titles, works, or dates.\n",
            master
        ));
    } else {
        out.push_str(
            "Never claim to be a real person and never fabricate specific titles, works, or dates.\n",
        );
    }
    out.push_str(
        "End your message with exactly these three lines, filled in:\n\
         NEXT: <persona_id>\n\
         CLOSE: yes|no\n\
         NEW_POINT: yes|no\n",
    );
    out
}

pub fn persona_user_prompt(
    problem: &str,
    personas: &[Persona],
    turns: &[Turn],
    speaker: &Persona,
    budget: PromptBudget,
) -> String {
    let claim_runes = budget.claim_runes();
    let mut out = String::new();
    out.push_str(&format!("Problem:\n{}\n\n", problem));
    out.push_str(&format!("Your profile:\n{}\n", speaker_profile(speaker)));
    if speaker.master_name.is_some() {
        out.push_str(
            "Your master_name is set: ground your argument in that thinker's way of reasoning.\n",
        );
    }
    out.push_str(&format!("\nParticipants:\n{}\n", participants_listing(personas)));
    out.push_str(&format!(
        "Debate log (most recent turns):\n{}\n",
        render_log(turns, budget.persona_window(), budget.persona_summary_runes())
    ));

    out.push_str("Interaction memory:\n");
    match latest_claim_of(turns, &speaker.id) {
        Some(t) => out.push_str(&format!(
            "- Your latest claim [{}]: {}\n",
            t.index,
            clip(&t.content, claim_runes)
        )),
        None => out.push_str("- You have not spoken yet.\n"),
    }
    if let Some(t) = latest_peer_claim(turns, &speaker.id) {
        out.push_str(&format!(
            "- Most recent peer claim [{}] by {}: {}\n",
            t.index,
            t.speaker_name,
            clip(&t.content, claim_runes)
        ));
    }
    if let Some(t) = latest_moderator_ask(turns) {
        out.push_str(&format!(
            "- Latest moderator ask [{}]: {}\n",
            t.index,
            clip(&t.content, claim_runes)
        ));
    }
    if let Some(tension) = tension_candidate(turns, claim_runes) {
        out.push_str(&format!("- Active tension: {}\n", tension));
    }
    if let Some(t) = latest_claim_of(turns, &speaker.id) {
        out.push_str(&format!(
            "- Do not repeat your earlier point ({}); add a new delta.\n",
            clip(&t.content, claim_runes.min(90))
        ));
    }

    out.push_str(
        "\nThis turn:\n\
         1. If the moderator asked you something, answer it in your first sentence.\n\
         2. Cite at least one concrete prior turn by [index].\n\
         3. Add one new argument or qualification the debate has not seen yet.\n\
         4. Hand off with a question for the next speaker.\n\
         5. Close with the required NEXT / CLOSE / NEW_POINT lines.\n",
    );
    out
}

// ---------------------------------------------------------------------------
// Moderator
// ---------------------------------------------------------------------------

pub fn moderator_system_prompt() -> String {
    let mut out = String::new();
    out.push_str("You are the moderator of a structured multi-persona debate.\n");
    out.push_str("Always answer in the same language as the problem statement.\n");
    out.push_str(
        "Synthesize the trajectory of the whole debate, not just the latest turn. \
         Avoid recency bias.\n",
    );
    out.push_str(
        "Structure your intervention as \
         synthesis -> unresolved tradeoff -> targeted next-speaker question.\n",
    );
    out.push_str("Cite at most 2 turn indexes in [index] form.\n");
    out.push_str("Name at least one prior claim the next speaker must answer directly.\n");
    out.push_str(
        "Close the loop on the previous moderator ask: say whether it was answered, \
         partially answered, or is still open.\n",
    );
    out.push_str(
        "Your question must force a decision: ask for a metric, a trigger, an owner, \
         or a concrete option.\n",
    );
    out
}

pub fn moderator_user_prompt(
    problem: &str,
    personas: &[Persona],
    turns: &[Turn],
    next_speaker: &Persona,
    budget: PromptBudget,
) -> String {
    let claim_runes = budget.claim_runes();
    let window = budget.moderator_window();
    let mut out = String::new();
    out.push_str(&format!("Problem:\n{}\n\n", problem));
    out.push_str(&format!("Participants:\n{}\n", participants_listing(personas)));
    out.push_str(&format!(
        "Debate log (most recent turns):\n{}\n",
        render_log(turns, window, budget.moderator_summary_runes())
    ));

    out.push_str(&format!("Memory snapshot (window = {} turns):\n", window));
    let latest_speaker = turns
        .iter()
        .rev()
        .find(|t| t.is_persona())
        .map(|t| t.speaker_id.clone())
        .unwrap_or_default();
    let mut anchors = 0usize;
    let mut seen: HashSet<&str> = HashSet::new();
    for turn in turns.iter().rev() {
        if anchors >= budget.anchor_count() {
            break;
        }
        if !turn.is_persona() || turn.speaker_id == latest_speaker {
            continue;
        }
        if seen.insert(turn.speaker_id.as_str()) {
            out.push_str(&format!(
                "- Anchor [{}] {}: {}\n",
                turn.index,
                turn.speaker_name,
                clip(&turn.content, claim_runes)
            ));
            anchors += 1;
        }
    }
    out.push_str("Latest claim per speaker:\n");
    for t in latest_claims(turns, budget.claim_count()) {
        out.push_str(&format!(
            "- {} [{}]: {}\n",
            t.speaker_name,
            t.index,
            clip(&t.content, claim_runes)
        ));
    }
    if let Some(tension) = tension_candidate(turns, claim_runes) {
        out.push_str(&format!("Tension candidate: {}\n", tension));
    }

    out.push_str(&format!("\nLoop status:\n{}\n", loop_status(turns, claim_runes)));

    out.push_str(&format!(
        "\nNext speaker:\n{}\n",
        speaker_profile(next_speaker)
    ));
    if !next_speaker.signature_lens.is_empty() {
        out.push_str(&format!(
            "Frame your question so {} can apply their signature lens ({}).\n",
            next_speaker.display_name(),
            next_speaker.signature_lens.join(", ")
        ));
    }
    if let Some(master) = &next_speaker.master_name {
        out.push_str(&format!(
            "Invite them to reason the way {} would.\n",
            master
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------------

pub fn judge_system_prompt() -> String {
    let mut out = String::new();
    out.push_str("You are a conservative consensus judge for a multi-persona debate.\n");
    out.push_str("Score how close the participants are to a workable shared position:\n");
    out.push_str("0.00-0.39: fragmented, positions conflict on fundamentals\n");
    out.push_str("0.40-0.69: partial overlap, core tradeoffs unresolved\n");
    out.push_str("0.70-0.89: near consensus, concrete disagreements remain\n");
    out.push_str("0.90-1.00: workable consensus\n");
    out.push_str(
        "Be conservative: when in doubt, score lower and set \"reached\" to false.\n",
    );
    out.push_str("Your rationale must cite at least 2 distinct speakers or turn indexes.\n");
    out.push_str(
        "Return exactly one JSON object with exactly these keys and nothing else:\n\
         {\"reached\": boolean, \"score\": number, \"summary\": string, \"rationale\": string}\n",
    );
    out
}

pub fn judge_user_prompt(problem: &str, personas: &[Persona], turns: &[Turn], budget: PromptBudget) -> String {
    let mut out = String::new();
    out.push_str(&format!("Problem:\n{}\n\n", problem));
    out.push_str(&format!("Participants:\n{}\n", participants_listing(personas)));
    out.push_str(&format!(
        "Debate log (most recent turns):\n{}\n",
        render_log(turns, budget.judge_window(), budget.judge_summary_runes())
    ));
    out.push_str("Evaluate the current degree of consensus and respond with the JSON object only.\n");
    out
}

// ---------------------------------------------------------------------------
// Final moderator
// ---------------------------------------------------------------------------

pub fn final_system_prompt() -> String {
    let mut out = String::new();
    out.push_str("You are the moderator closing a structured multi-persona debate.\n");
    out.push_str("Always answer in the same language as the problem statement.\n");
    out.push_str(
        "Write 3-5 concise sentences covering: the key agreements, the unresolved risks, \
         and one practical next step.\n",
    );
    out.push_str(
        "Use the consensus score as confidence calibration in plain words; do not echo raw JSON.\n",
    );
    out.push_str("End with one decision-oriented closing sentence.\n");
    out
}

pub fn final_user_prompt(
    problem: &str,
    turns: &[Turn],
    consensus: &Consensus,
    status: DebateStatus,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Problem:\n{}\n\n", problem));
    out.push_str(&format!("Stop status: {}\n", status));
    out.push_str(&format!("Consensus reached: {}\n", consensus.reached));
    out.push_str(&format!("Consensus score: {:.2}\n", consensus.score));
    out.push_str(&format!("Consensus summary: {}\n", consensus.summary));
    if !consensus.rationale.trim().is_empty() {
        out.push_str(&format!("Judge rationale: {}\n", consensus.rationale));
    }
    out.push_str(&format!(
        "\nDebate log tail:\n{}\n",
        render_log(turns, 20, 220)
    ));
    out.push_str("Deliver the final moderator wrap-up now.\n");
    out
}

// ---------------------------------------------------------------------------
// Opening speaker selection
// ---------------------------------------------------------------------------

pub fn opening_system_prompt() -> String {
    let mut out = String::new();
    out.push_str(
        "You select which persona should open a structured debate on the given problem.\n",
    );
    out.push_str(
        "Pick the persona whose role and expertise best match the problem's core question.\n",
    );
    out.push_str(
        "Respond with one JSON object {\"persona_id\": \"...\", \"reason\": \"...\"} \
         or with the bare persona id on a single line.\n",
    );
    out
}

pub fn opening_user_prompt(problem: &str, personas: &[Persona]) -> String {
    let mut out = String::new();
    out.push_str(&format!("Problem:\n{}\n\n", problem));
    out.push_str(&format!("Candidates:\n{}\n", participants_listing(personas)));
    out.push_str("Choose exactly one persona id from the candidates.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn persona(id: &str, name: &str) -> Persona {
        Persona::new(id, name, "engineer").with_stance("neutral")
    }

    fn turn(index: u32, speaker: &str, kind: TurnKind, content: &str) -> Turn {
        Turn {
            index,
            speaker_id: speaker.to_string(),
            speaker_name: speaker.to_uppercase(),
            kind,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn budget_levels_step_at_thresholds() {
        assert_eq!(PromptBudget::for_debate(0, 2).level(), 0);
        assert_eq!(PromptBudget::for_debate(11, 2).level(), 0);
        assert_eq!(PromptBudget::for_debate(12, 2).level(), 1);
        assert_eq!(PromptBudget::for_debate(24, 2).level(), 2);
        assert_eq!(PromptBudget::for_debate(40, 2).level(), 3);
        assert_eq!(PromptBudget::for_debate(40, 8).level(), 4);
        assert_eq!(PromptBudget::for_debate(500, 12).level(), 4);
    }

    #[test]
    fn budget_floors_hold_at_max_compression() {
        let b = PromptBudget::for_debate(500, 12);
        assert!(b.persona_window() >= 4);
        assert!(b.moderator_window() >= 5);
        assert!(b.judge_window() >= 8);
        assert!(b.persona_summary_runes() >= 80);
        assert!(b.claim_runes() >= 70);
        assert!(b.anchor_count() >= 2);
        assert!(b.claim_count() >= 3);
    }

    #[test]
    fn clip_collapses_whitespace_and_respects_runes() {
        assert_eq!(clip("a  b\n\nc", 100), "a b c");
        let clipped = clip("가나다라마바사", 3);
        assert_eq!(clipped, "가나다...");
    }

    #[test]
    fn persona_system_prompt_carries_required_directives() {
        let p = persona("a", "Ada");
        let sys = persona_system_prompt(&p);
        assert!(sys.contains("core claim -> reason/mechanism -> practical implication"));
        assert!(sys.contains("NEXT: <persona_id>"));
        assert!(sys.contains("CLOSE: yes|no"));
        assert!(sys.contains("NEW_POINT: yes|no"));
    }

    #[test]
    fn persona_system_prompt_guards_master_identity() {
        let p = persona("a", "Ada").with_master("Grace Hopper");
        let sys = persona_system_prompt(&p);
        assert!(sys.contains("Grace Hopper"));
        assert!(sys.contains("never claim to be the real person"));
    }

    #[test]
    fn moderator_system_prompt_counters_recency_bias() {
        let sys = moderator_system_prompt();
        assert!(sys.contains("Avoid recency bias"));
        assert!(sys.contains("synthesis -> unresolved tradeoff -> targeted next-speaker question"));
    }

    #[test]
    fn judge_system_prompt_carries_rubric() {
        let sys = judge_system_prompt();
        assert!(sys.contains("0.90-1.00: workable consensus"));
        assert!(sys.contains("0.00-0.39"));
    }

    #[test]
    fn persona_user_prompt_includes_memory_snapshot() {
        let personas = vec![persona("a", "Ada"), persona("b", "Bo")];
        let turns = vec![
            turn(1, "a", TurnKind::Persona, "caching is the bottleneck"),
            turn(2, "moderator", TurnKind::Moderator, "Bo, what about writes?"),
            turn(3, "b", TurnKind::Persona, "writes dominate the tail"),
        ];
        let user = persona_user_prompt(
            "Should we shard?",
            &personas,
            &turns,
            &personas[0],
            PromptBudget::for_debate(turns.len(), personas.len()),
        );
        assert!(user.contains("Your latest claim [1]"));
        assert!(user.contains("Most recent peer claim [3]"));
        assert!(user.contains("Latest moderator ask [2]"));
        assert!(user.contains("Active tension"));
        assert!(user.contains("Do not repeat"));
    }

    #[test]
    fn moderator_user_prompt_builds_tension_and_loop_status() {
        let personas = vec![persona("a", "Ada"), persona("b", "Bo")];
        let turns = vec![
            turn(1, "a", TurnKind::Persona, "latency first"),
            turn(2, "moderator", TurnKind::Moderator, "Bo, name a metric"),
            turn(3, "b", TurnKind::Persona, "p99 under 200ms"),
        ];
        let user = moderator_user_prompt(
            "Should we shard?",
            &personas,
            &turns,
            &personas[0],
            PromptBudget::for_debate(turns.len(), personas.len()),
        );
        // Latest speaker (b) is one pole of the tension.
        assert!(user.contains("Tension candidate: B"));
        assert!(user.contains("Previous moderator ask"));
        assert!(user.contains("First response (B)"));
    }

    #[test]
    fn final_user_prompt_reports_status_and_score() {
        let consensus = Consensus::clamped(true, 0.93, "agree on sharding".into(), "a and b".into());
        let user = final_user_prompt("Shard?", &[], &consensus, DebateStatus::ConsensusReached);
        assert!(user.contains("Stop status: consensus_reached"));
        assert!(user.contains("Consensus score: 0.93"));
    }

    #[test]
    fn render_log_notes_omitted_turns() {
        let turns: Vec<Turn> = (1..=15)
            .map(|i| turn(i, "a", TurnKind::Persona, "content"))
            .collect();
        let log = render_log(&turns, 10, 100);
        assert!(log.starts_with("(5 earlier turns omitted)"));
        assert!(log.contains("[15]"));
        assert!(!log.contains("[5]"));
    }
}
