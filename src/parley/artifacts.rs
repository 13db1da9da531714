//! Filesystem persistence of finished debates.
//!
//! [`FileResultSink`] writes two artifacts per result into its target
//! directory: the full [`DebateResult`] as JSON and a human-readable
//! Markdown transcript.  Drivers that want different persistence implement
//! [`ResultSink`](crate::hooks::ResultSink) themselves.

use crate::parley::hooks::{ResultSink, SavedArtifacts};
use crate::parley::transcript::{DebateResult, TurnKind};
use std::error::Error;
use std::path::PathBuf;

/// Writes `debate-<utc-stamp>.json` and `debate-<utc-stamp>.md`.
pub struct FileResultSink {
    dir: PathBuf,
}

impl FileResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileResultSink { dir: dir.into() }
    }

    fn render_markdown(result: &DebateResult) -> String {
        let mut out = String::new();
        out.push_str("# Debate transcript\n\n");
        out.push_str(&format!("**Problem.** {}\n\n", result.problem));
        out.push_str(&format!(
            "**Status.** {} | consensus score {:.2} ({})\n\n",
            result.status,
            result.consensus.score,
            if result.consensus.reached {
                "reached"
            } else {
                "not reached"
            }
        ));
        out.push_str(&format!("**Summary.** {}\n\n", result.consensus.summary));
        if !result.consensus.rationale.trim().is_empty() {
            out.push_str(&format!("**Rationale.** {}\n\n", result.consensus.rationale));
        }
        out.push_str(&format!(
            "**Metrics.** {} tokens ({} prompt / {} completion), {} ms\n\n",
            result.metrics.total_tokens,
            result.metrics.prompt_tokens,
            result.metrics.completion_tokens,
            result.metrics.latency_ms
        ));
        out.push_str("## Participants\n\n");
        for p in &result.personas {
            out.push_str(&format!("- **{}** ({}): {}\n", p.display_name(), p.id, p.role));
        }
        out.push_str("\n## Turns\n\n");
        for turn in &result.turns {
            let label = match turn.kind {
                TurnKind::Persona => format!("{} ({})", turn.speaker_name, turn.speaker_id),
                TurnKind::Moderator => turn.speaker_name.clone(),
            };
            out.push_str(&format!("### [{}] {}\n\n{}\n\n", turn.index, label, turn.content));
        }
        out
    }
}

impl ResultSink for FileResultSink {
    fn save(&self, result: &DebateResult) -> Result<SavedArtifacts, Box<dyn Error + Send + Sync>> {
        std::fs::create_dir_all(&self.dir)?;
        let stamp = result.started_at.format("%Y%m%d-%H%M%S");
        let json_path = self.dir.join(format!("debate-{}.json", stamp));
        let markdown_path = self.dir.join(format!("debate-{}.md", stamp));

        let json = serde_json::to_vec_pretty(result)?;
        std::fs::write(&json_path, json)?;
        std::fs::write(&markdown_path, Self::render_markdown(result))?;
        log::debug!("saved debate artifacts at {}", json_path.display());

        Ok(SavedArtifacts {
            json_path,
            markdown_path,
        })
    }
}
