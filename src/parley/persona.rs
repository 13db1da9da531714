//! Persona profiles and roster validation.
//!
//! A [`Persona`] is a configured speaker: an id the scheduler addresses it
//! by, a display name, a role, and optional stylistic hints (`master_name`,
//! `signature_lens`, ...).  Personas arrive from an external loader, are
//! normalized once at the boundary, and are immutable inside the core.
//!
//! # Example
//!
//! ```rust
//! use parley::persona::{normalize_personas, Persona};
//!
//! let roster = vec![
//!     Persona::new("architect", "Architect", "systems architect"),
//!     Persona::new("operator", "Operator", "production operator"),
//! ];
//! let roster = normalize_personas(roster).unwrap();
//! assert_eq!(roster[0].stance, "neutral");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::Path;

/// Minimum and maximum roster size accepted by the orchestrator.
pub const MIN_PERSONAS: usize = 2;
pub const MAX_PERSONAS: usize = 12;

/// A configured speaker profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    /// Defaults to `"neutral"` during normalization.
    #[serde(default)]
    pub stance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expertise: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature_lens: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

impl Persona {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Persona {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            stance: String::new(),
            style: None,
            master_name: None,
            expertise: Vec::new(),
            signature_lens: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn with_stance(mut self, stance: impl Into<String>) -> Self {
        self.stance = stance.into();
        self
    }

    pub fn with_master(mut self, master_name: impl Into<String>) -> Self {
        self.master_name = Some(master_name.into());
        self
    }

    pub fn with_expertise(mut self, expertise: Vec<String>) -> Self {
        self.expertise = expertise;
        self
    }

    pub fn with_signature_lens(mut self, signature_lens: Vec<String>) -> Self {
        self.signature_lens = signature_lens;
        self
    }

    /// Name shown in transcripts; falls back to the id when unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Distinct strings a speaker may be addressed by: id, name, display name.
    pub fn aliases(&self) -> Vec<&str> {
        let mut out: Vec<&str> = vec![self.id.as_str()];
        if !self.name.trim().is_empty() && self.name != self.id {
            out.push(self.name.as_str());
        }
        let display = self.display_name();
        if !out.contains(&display) {
            out.push(display);
        }
        out
    }
}

/// Why a roster was rejected.
#[derive(Debug, Clone)]
pub enum PersonaError {
    TooFew(usize),
    TooMany(usize),
    MissingId(usize),
    DuplicateId(String),
    Io(String),
    Parse(String),
}

impl fmt::Display for PersonaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonaError::TooFew(n) => {
                write!(f, "need at least {} personas, got {}", MIN_PERSONAS, n)
            }
            PersonaError::TooMany(n) => {
                write!(f, "need at most {} personas, got {}", MAX_PERSONAS, n)
            }
            PersonaError::MissingId(pos) => write!(f, "persona at position {} has an empty id", pos),
            PersonaError::DuplicateId(id) => write!(f, "duplicate persona id: {}", id),
            PersonaError::Io(msg) => write!(f, "persona file io: {}", msg),
            PersonaError::Parse(msg) => write!(f, "persona file parse: {}", msg),
        }
    }
}

impl Error for PersonaError {}

fn trim_in_place(s: &mut String) {
    let trimmed = s.trim();
    if trimmed.len() != s.len() {
        *s = trimmed.to_string();
    }
}

fn strip_blank(list: &mut Vec<String>) {
    list.iter_mut().for_each(trim_in_place);
    list.retain(|item| !item.is_empty());
}

/// Trim every field, default the stance, strip blank list entries, and
/// enforce the roster invariants (size in `[2, 12]`, unique non-empty ids).
pub fn normalize_personas(mut personas: Vec<Persona>) -> Result<Vec<Persona>, PersonaError> {
    if personas.len() < MIN_PERSONAS {
        return Err(PersonaError::TooFew(personas.len()));
    }
    if personas.len() > MAX_PERSONAS {
        return Err(PersonaError::TooMany(personas.len()));
    }

    let mut seen: HashSet<String> = HashSet::new();
    for (pos, p) in personas.iter_mut().enumerate() {
        trim_in_place(&mut p.id);
        trim_in_place(&mut p.name);
        trim_in_place(&mut p.role);
        trim_in_place(&mut p.stance);
        if let Some(style) = p.style.take() {
            let style = style.trim().to_string();
            if !style.is_empty() {
                p.style = Some(style);
            }
        }
        if let Some(master) = p.master_name.take() {
            let master = master.trim().to_string();
            if !master.is_empty() {
                p.master_name = Some(master);
            }
        }
        strip_blank(&mut p.expertise);
        strip_blank(&mut p.signature_lens);
        strip_blank(&mut p.constraints);

        if p.id.is_empty() {
            return Err(PersonaError::MissingId(pos));
        }
        if p.stance.is_empty() {
            p.stance = "neutral".to_string();
        }
        if !seen.insert(p.id.clone()) {
            return Err(PersonaError::DuplicateId(p.id.clone()));
        }
    }

    Ok(personas)
}

/// Parse a JSON persona file: either a bare array or `{"personas": [...]}`.
pub fn parse_personas_json(text: &str) -> Result<Vec<Persona>, PersonaError> {
    #[derive(Deserialize)]
    struct Wrapped {
        personas: Vec<Persona>,
    }

    let trimmed = text.trim_start();
    let parsed = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<Persona>>(text)
    } else {
        serde_json::from_str::<Wrapped>(text).map(|w| w.personas)
    };
    let personas = parsed.map_err(|e| PersonaError::Parse(e.to_string()))?;
    normalize_personas(personas)
}

/// Load and normalize a persona roster from a JSON file on disk.
pub fn load_personas(path: &Path) -> Result<Vec<Persona>, PersonaError> {
    let text = std::fs::read_to_string(path).map_err(|e| PersonaError::Io(e.to_string()))?;
    parse_personas_json(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_defaults_stance_and_strips_blanks() {
        let personas = vec![
            Persona {
                id: "  a  ".to_string(),
                name: " Ada ".to_string(),
                role: "engineer".to_string(),
                stance: "  ".to_string(),
                style: Some("   ".to_string()),
                master_name: Some(" Hopper ".to_string()),
                expertise: vec!["".to_string(), " systems ".to_string()],
                signature_lens: vec![],
                constraints: vec![],
            },
            Persona::new("b", "Bo", "critic").with_stance("contrarian"),
        ];
        let out = normalize_personas(personas).unwrap();
        assert_eq!(out[0].id, "a");
        assert_eq!(out[0].stance, "neutral");
        assert_eq!(out[0].style, None);
        assert_eq!(out[0].master_name.as_deref(), Some("Hopper"));
        assert_eq!(out[0].expertise, vec!["systems".to_string()]);
        assert_eq!(out[1].stance, "contrarian");
    }

    #[test]
    fn roster_size_is_bounded() {
        assert!(matches!(
            normalize_personas(vec![Persona::new("a", "", "")]),
            Err(PersonaError::TooFew(1))
        ));
        let big: Vec<Persona> = (0..13)
            .map(|i| Persona::new(format!("p{}", i), "", ""))
            .collect();
        assert!(matches!(
            normalize_personas(big),
            Err(PersonaError::TooMany(13))
        ));
    }

    #[test]
    fn ids_must_be_unique_after_trimming() {
        let personas = vec![Persona::new("x", "", ""), Persona::new(" x ", "", "")];
        assert!(matches!(
            normalize_personas(personas),
            Err(PersonaError::DuplicateId(_))
        ));
    }

    #[test]
    fn parses_bare_array_and_wrapped_object() {
        let arr = r#"[{"id":"a","role":"r"},{"id":"b"}]"#;
        let out = parse_personas_json(arr).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].stance, "neutral");

        let wrapped = r#"{"personas":[{"id":"a"},{"id":"b","name":"Bee"}]}"#;
        let out = parse_personas_json(wrapped).unwrap();
        assert_eq!(out[1].display_name(), "Bee");
    }

    #[test]
    fn aliases_cover_id_and_name() {
        let p = Persona::new("ada", "Ada L", "eng");
        let aliases = p.aliases();
        assert!(aliases.contains(&"ada"));
        assert!(aliases.contains(&"Ada L"));
    }
}
