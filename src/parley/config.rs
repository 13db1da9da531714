//! Environment-driven configuration.
//!
//! Reads the process environment into the client and debate settings.  The
//! only fatal condition is a missing `OPENAI_API_KEY`; every other variable
//! falls back to its default when absent or out of range, with a warning so
//! misconfigurations are visible in logs.
//!
//! Recognized variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `OPENAI_API_KEY` | Bearer key (required) |
//! | `OPENAI_BASE_URL` | Endpoint base, normalized per the transport rules |
//! | `OPENAI_MODEL` | Model id (default `gpt-5.2`) |
//! | `OPENAI_REQUEST_TIMEOUT` | Per-call timeout, duration string |
//! | `OPENAI_API_MAX_RETRIES` | Transient-failure retries per call |
//! | `DEBATE_MAX_TURNS` | Persona-turn cap; 0 = unbounded |
//! | `DEBATE_CONSENSUS_THRESHOLD` | Judge score threshold in `[0, 1]` |
//! | `DEBATE_MAX_DURATION` | Debate wall-clock budget, duration string |
//! | `DEBATE_MAX_TOTAL_TOKENS` | Debate token budget |
//! | `DEBATE_MAX_NO_PROGRESS_JUDGE` | Stagnant judge verdicts before stopping |

use crate::parley::clients::openai::OpenAIConfig;
use crate::parley::orchestrator::DebateConfig;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Configuration failure surfaced at startup.
#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingKey(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingKey(name) => write!(f, "missing required env var {}", name),
        }
    }
}

impl Error for ConfigError {}

/// Everything the process needs to run debates.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub client: OpenAIConfig,
    pub debate: DebateConfig,
}

impl EnvConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through an arbitrary lookup function (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENAI_API_KEY")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingKey("OPENAI_API_KEY"))?;

        let mut client = OpenAIConfig {
            api_key,
            ..OpenAIConfig::default()
        };
        if let Some(base_url) = lookup("OPENAI_BASE_URL") {
            client.base_url = base_url.trim().to_string();
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            let model = model.trim().to_string();
            if !model.is_empty() {
                client.model = model;
            }
        }
        if let Some(raw) = lookup("OPENAI_REQUEST_TIMEOUT") {
            match parse_duration(&raw) {
                Some(d) if d > Duration::from_secs(0) => client.request_timeout = d,
                _ => log::warn!("ignoring invalid OPENAI_REQUEST_TIMEOUT={:?}", raw),
            }
        }
        if let Some(raw) = lookup("OPENAI_API_MAX_RETRIES") {
            match raw.trim().parse::<u32>() {
                Ok(n) => client.max_retries = n,
                Err(_) => log::warn!("ignoring invalid OPENAI_API_MAX_RETRIES={:?}", raw),
            }
        }

        let mut debate = DebateConfig::default();
        if let Some(raw) = lookup("DEBATE_MAX_TURNS") {
            match raw.trim().parse::<u32>() {
                Ok(n) => debate.max_turns = n,
                Err(_) => log::warn!("ignoring invalid DEBATE_MAX_TURNS={:?}", raw),
            }
        }
        if let Some(raw) = lookup("DEBATE_CONSENSUS_THRESHOLD") {
            match raw.trim().parse::<f64>() {
                Ok(v) => debate.consensus_threshold = v,
                Err(_) => log::warn!("ignoring invalid DEBATE_CONSENSUS_THRESHOLD={:?}", raw),
            }
        }
        if let Some(raw) = lookup("DEBATE_MAX_DURATION") {
            match parse_duration(&raw) {
                Some(d) => debate.max_duration = d,
                None => log::warn!("ignoring invalid DEBATE_MAX_DURATION={:?}", raw),
            }
        }
        if let Some(raw) = lookup("DEBATE_MAX_TOTAL_TOKENS") {
            match raw.trim().parse::<u64>() {
                Ok(n) => debate.max_total_tokens = n,
                Err(_) => log::warn!("ignoring invalid DEBATE_MAX_TOTAL_TOKENS={:?}", raw),
            }
        }
        if let Some(raw) = lookup("DEBATE_MAX_NO_PROGRESS_JUDGE") {
            match raw.trim().parse::<u32>() {
                Ok(n) => debate.max_no_progress_judges = n,
                Err(_) => log::warn!("ignoring invalid DEBATE_MAX_NO_PROGRESS_JUDGE={:?}", raw),
            }
        }

        Ok(EnvConfig {
            client,
            debate: debate.normalized(),
        })
    }
}

/// Parse a duration string: `250ms`, `90s`, `20m`, `1h`, or bare seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (number, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(pos) => (&raw[..pos], raw[pos..].trim()),
        None => (raw, "s"),
    };
    let value: f64 = number.trim().parse().ok()?;
    if value < 0.0 || !value.is_finite() {
        return None;
    }
    let millis = match unit {
        "ms" => value,
        "s" | "sec" | "" => value * 1_000.0,
        "m" | "min" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parley::orchestrator::{
        DEFAULT_CONSENSUS_THRESHOLD, DEFAULT_MAX_DURATION, DEFAULT_MAX_TOTAL_TOKENS,
    };
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn api_key_is_required() {
        let err = EnvConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("OPENAI_API_KEY")));
    }

    #[test]
    fn defaults_apply_when_only_the_key_is_set() {
        let cfg = EnvConfig::from_lookup(lookup_from(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(cfg.client.model, "gpt-5.2");
        assert_eq!(cfg.client.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.debate.max_turns, 0);
        assert_eq!(cfg.debate.consensus_threshold, DEFAULT_CONSENSUS_THRESHOLD);
        assert_eq!(cfg.debate.max_duration, DEFAULT_MAX_DURATION);
        assert_eq!(cfg.debate.max_total_tokens, DEFAULT_MAX_TOTAL_TOKENS);
    }

    #[test]
    fn every_variable_is_honored() {
        let cfg = EnvConfig::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "https://proxy.local/v1"),
            ("OPENAI_MODEL", "gpt-5.2-pro"),
            ("OPENAI_REQUEST_TIMEOUT", "90s"),
            ("OPENAI_API_MAX_RETRIES", "5"),
            ("DEBATE_MAX_TURNS", "16"),
            ("DEBATE_CONSENSUS_THRESHOLD", "0.75"),
            ("DEBATE_MAX_DURATION", "5m"),
            ("DEBATE_MAX_TOTAL_TOKENS", "50000"),
            ("DEBATE_MAX_NO_PROGRESS_JUDGE", "4"),
        ]))
        .unwrap();
        assert_eq!(cfg.client.base_url, "https://proxy.local/v1");
        assert_eq!(cfg.client.model, "gpt-5.2-pro");
        assert_eq!(cfg.client.request_timeout, Duration::from_secs(90));
        assert_eq!(cfg.client.max_retries, 5);
        assert_eq!(cfg.debate.max_turns, 16);
        assert_eq!(cfg.debate.consensus_threshold, 0.75);
        assert_eq!(cfg.debate.max_duration, Duration::from_secs(300));
        assert_eq!(cfg.debate.max_total_tokens, 50_000);
        assert_eq!(cfg.debate.max_no_progress_judges, 4);
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults() {
        let cfg = EnvConfig::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("DEBATE_CONSENSUS_THRESHOLD", "1.7"),
            ("DEBATE_MAX_TOTAL_TOKENS", "0"),
            ("DEBATE_MAX_DURATION", "bogus"),
        ]))
        .unwrap();
        assert_eq!(cfg.debate.consensus_threshold, DEFAULT_CONSENSUS_THRESHOLD);
        assert_eq!(cfg.debate.max_total_tokens, DEFAULT_MAX_TOTAL_TOKENS);
        assert_eq!(cfg.debate.max_duration, DEFAULT_MAX_DURATION);
    }

    #[test]
    fn duration_strings_cover_common_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("20m"), Some(Duration::from_secs(1200)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration("-5s"), None);
    }
}
