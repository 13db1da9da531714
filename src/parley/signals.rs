//! Structural signals embedded in turn content.
//!
//! Personas close each utterance with trailing directive lines:
//!
//! ```text
//! NEXT: <persona_id>
//! CLOSE: yes|no
//! NEW_POINT: yes|no
//! ```
//!
//! [`resolve_next_speaker`] honors an explicit `NEXT:` handoff, falls back to
//! alias-mention matching in the last line/sentence, and otherwise yields
//! `None` so the scheduler keeps round-robin order.  [`TerminationTracker`]
//! folds the `CLOSE`/`NEW_POINT` votes into an advisory stop suggestion; the
//! authoritative stop conditions live in the orchestrator.

use crate::parley::persona::Persona;
use crate::parley::transcript::Turn;
use std::collections::HashMap;

/// Korean addressing suffixes that mark an alias as a direct mention.
const KOREAN_ADDRESS_SUFFIXES: &[&str] = &[
    "에게", "한테", "께", "님", "씨", "이", "가", "은", "는", "을", "를", "와", "과", "도",
];

/// Punctuation trimmed off the tail of a `NEXT:` token.
const TOKEN_TRAILERS: &[char] = &[
    '"', '\'', '`', '.', ',', ';', ':', '!', '?', ')', ']', '}', '>',
];

fn last_nonempty_lines(content: &str, max: usize) -> Vec<&str> {
    content
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(max)
        .collect()
}

fn strip_ascii_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    // Byte-wise compare: the prefixes are pure ASCII, so a match can never
    // land inside a multi-byte character.
    let (lb, pb) = (line.as_bytes(), prefix.as_bytes());
    if lb.len() >= pb.len() && lb[..pb.len()].eq_ignore_ascii_case(pb) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// Is this one of the trailing structural lines (`NEXT`, `CLOSE`,
/// `NEW_POINT`, `다음 화자`)?
fn is_directive_line(line: &str) -> bool {
    next_directive_token(line).is_some()
        || directive_value(line, "CLOSE").is_some()
        || directive_value(line, "NEW_POINT").is_some()
}

/// Extract the persona id from an explicit `NEXT:` style directive line.
fn next_directive_token(line: &str) -> Option<String> {
    let rest = strip_ascii_prefix(line, "NEXT:")
        .or_else(|| strip_ascii_prefix(line, "NEXT="))
        .or_else(|| strip_ascii_prefix(line, "NEXT_SPEAKER:"))
        .or_else(|| line.strip_prefix("다음 화자:"))?;
    let rest = rest.trim();
    let rest = strip_ascii_prefix(rest, "persona_id=").unwrap_or(rest).trim();
    let token = rest.split_whitespace().next()?;
    let token = token.trim_start_matches('@').trim_end_matches(TOKEN_TRAILERS);
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '-'
}

/// All byte offsets where `needle` occurs in `haystack`.
fn occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        out.push(from + pos);
        from += pos + needle.len().max(1);
        if from >= haystack.len() {
            break;
        }
    }
    out
}

fn boundary_before(segment: &str, pos: usize) -> bool {
    segment[..pos].chars().next_back().map_or(true, |c| !is_word_char(c))
}

fn boundary_after(segment: &str, end: usize) -> bool {
    segment[end..].chars().next().map_or(true, |c| !is_word_char(c))
}

/// Does `segment` mention `alias` directly?
///
/// A hit needs `@alias`, a Korean addressing suffix right after the alias, or
/// a plain word-boundary occurrence.  Aliases of two runes or fewer are too
/// collision-prone for the boundary rule and require `@` or a suffix.
fn alias_mentioned(segment: &str, alias: &str) -> bool {
    if alias.is_empty() {
        return false;
    }
    let short = alias.chars().count() <= 2;
    for pos in occurrences(segment, alias) {
        let end = pos + alias.len();
        let at_marked = segment[..pos].ends_with('@');
        let korean_suffixed = boundary_before(segment, if at_marked { pos - 1 } else { pos })
            && KOREAN_ADDRESS_SUFFIXES
                .iter()
                .any(|s| segment[end..].starts_with(s));
        if at_marked && (korean_suffixed || boundary_after(segment, end)) {
            return true;
        }
        if korean_suffixed {
            return true;
        }
        if !short && boundary_before(segment, pos) && boundary_after(segment, end) {
            return true;
        }
    }
    false
}

fn last_sentence(content: &str) -> &str {
    let trimmed = content.trim_end();
    let mut last_start = 0;
    let mut last_nonempty = trimmed;
    for (pos, ch) in trimmed.char_indices() {
        if matches!(ch, '.' | '!' | '?' | '\n' | '。' | '！' | '？') {
            let candidate = trimmed[last_start..pos].trim();
            if !candidate.is_empty() {
                last_nonempty = candidate;
            }
            last_start = pos + ch.len_utf8();
        }
    }
    let tail = trimmed[last_start..].trim();
    if tail.is_empty() {
        last_nonempty
    } else {
        tail
    }
}

/// Resolve the persona the current speaker handed off to, if any.
///
/// Returns the id of a persona **other than** `current_id`, or `None` when
/// no unambiguous handoff was found (the scheduler then keeps round-robin
/// order).  Ambiguous segments mentioning several personas are rejected.
pub fn resolve_next_speaker(
    content: &str,
    personas: &[Persona],
    current_id: &str,
) -> Option<String> {
    // Explicit directive in the last three non-empty lines.
    for line in last_nonempty_lines(content, 3) {
        if let Some(token) = next_directive_token(line) {
            if let Some(p) = personas
                .iter()
                .find(|p| p.id.eq_ignore_ascii_case(&token))
            {
                if p.id != current_id {
                    return Some(p.id.clone());
                }
            }
        }
    }

    // Alias mention in the last prose line, then the last prose sentence.
    // Directive lines are structural, not prose, and are skipped.
    let prose: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_directive_line(l))
        .collect();
    let prose = prose.join("\n");
    let mut segments: Vec<&str> = Vec::new();
    if let Some(line) = prose.lines().rev().find(|l| !l.trim().is_empty()) {
        segments.push(line);
    }
    segments.push(last_sentence(&prose));

    for segment in segments {
        let mut hits: Vec<&Persona> = Vec::new();
        for p in personas.iter().filter(|p| p.id != current_id) {
            if p.aliases().iter().any(|a| alias_mentioned(segment, a)) {
                hits.push(p);
            }
        }
        match hits.len() {
            1 => return Some(hits[0].id.clone()),
            0 => continue,
            // Several personas addressed at once: leave the order alone.
            _ => return None,
        }
    }
    None
}

fn parse_vote(raw: &str) -> Option<bool> {
    let token = raw
        .trim()
        .split_whitespace()
        .next()?
        .trim_end_matches(TOKEN_TRAILERS)
        .to_lowercase();
    match token.as_str() {
        "yes" | "y" | "true" | "예" | "네" | "종료" | "있음" => Some(true),
        "no" | "n" | "false" | "아니오" | "아니요" | "계속" | "없음" => Some(false),
        _ => None,
    }
}

fn directive_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    strip_ascii_prefix(line, &format!("{}:", name))
        .or_else(|| strip_ascii_prefix(line, &format!("{}=", name)))
}

/// `CLOSE` and `NEW_POINT` votes found in one turn's trailing lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnVotes {
    pub close: Option<bool>,
    pub new_point: Option<bool>,
}

/// Parse the trailing `CLOSE`/`NEW_POINT` directives of a content block.
pub fn parse_turn_votes(content: &str) -> TurnVotes {
    let mut votes = TurnVotes::default();
    for line in last_nonempty_lines(content, 3) {
        if votes.close.is_none() {
            if let Some(raw) = directive_value(line, "CLOSE") {
                votes.close = parse_vote(raw);
            }
        }
        if votes.new_point.is_none() {
            if let Some(raw) = directive_value(line, "NEW_POINT") {
                votes.new_point = parse_vote(raw);
            }
        }
    }
    votes
}

/// Advisory stop signal built from per-speaker `CLOSE` votes and the
/// `NEW_POINT` stagnation streak.
#[derive(Debug)]
pub struct TerminationTracker {
    roster_size: usize,
    latest_close: HashMap<String, bool>,
    no_new_point_streak: usize,
}

impl TerminationTracker {
    pub fn new(roster_size: usize) -> Self {
        TerminationTracker {
            roster_size,
            latest_close: HashMap::new(),
            no_new_point_streak: 0,
        }
    }

    /// Observe an appended turn.  Moderator turns are ignored.
    pub fn observe(&mut self, turn: &Turn) {
        if !turn.is_persona() {
            return;
        }
        let votes = parse_turn_votes(&turn.content);
        if let Some(close) = votes.close {
            // Last vote wins per speaker.
            self.latest_close.insert(turn.speaker_id.clone(), close);
        }
        match votes.new_point {
            Some(true) => self.no_new_point_streak = 0,
            Some(false) => self.no_new_point_streak += 1,
            // Missing directive preserves the streak.
            None => {}
        }
    }

    pub fn no_new_point_streak(&self) -> usize {
        self.no_new_point_streak
    }

    /// True when a quorum of latest CLOSE votes is yes and the stagnation
    /// streak spans the roster.  Advisory only.
    pub fn suggests_stop(&self) -> bool {
        let n = self.roster_size;
        if n == 0 {
            return false;
        }
        let observed = self.latest_close.len();
        let yes = self.latest_close.values().filter(|v| **v).count();
        let quorum = (2 * n + 2) / 3;
        observed >= n && yes >= quorum && self.no_new_point_streak >= n.max(2)
    }
}
