//! Integration seams injected into the core.
//!
//! The orchestrator and streaming server never touch the process clock, the
//! filesystem, or persona files directly; they go through the small traits
//! below so drivers and tests can substitute their own implementations.

use crate::parley::persona::Persona;
use crate::parley::transcript::DebateResult;
use chrono::{DateTime, Utc};
use std::error::Error;
use std::path::{Path, PathBuf};

/// Source of timestamps for turns and result bookkeeping.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The process clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Loads a persona roster from a path supplied by a driver.
pub trait PersonaLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Vec<Persona>, Box<dyn Error + Send + Sync>>;
}

/// Loader for JSON persona files (a bare array or `{"personas": [...]}`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPersonaLoader;

impl PersonaLoader for JsonPersonaLoader {
    fn load(&self, path: &Path) -> Result<Vec<Persona>, Box<dyn Error + Send + Sync>> {
        crate::parley::persona::load_personas(path).map_err(|e| Box::new(e) as _)
    }
}

/// Where a finished result landed on disk.
#[derive(Debug, Clone)]
pub struct SavedArtifacts {
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
}

/// Persists a finished [`DebateResult`] and reports where it was written.
pub trait ResultSink: Send + Sync {
    fn save(&self, result: &DebateResult) -> Result<SavedArtifacts, Box<dyn Error + Send + Sync>>;
}
