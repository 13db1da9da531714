// src/parley/mod.rs

pub mod artifacts;
pub mod broker;
pub mod client;
pub mod clients;
pub mod config;
pub mod hooks;
pub mod orchestrator;
pub mod persona;
pub mod prompts;
#[cfg(feature = "stream-server")]
pub mod server;
pub mod signals;
pub mod transcript;

// Export the scheduler entry points at the module root so callers reach
// them as parley::Orchestrator instead of parley::orchestrator::Orchestrator.
pub use orchestrator::{DebateConfig, DebateError, DebateOutcome, Orchestrator};
