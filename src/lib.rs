// src/lib.rs

// Import the top-level `parley` module.
pub mod parley;

// Re-exporting key items for easier external access.
pub use parley::artifacts;
pub use parley::broker;
pub use parley::client;
pub use parley::clients;
pub use parley::config;
pub use parley::hooks;
pub use parley::orchestrator;
pub use parley::persona;
pub use parley::prompts;
#[cfg(feature = "stream-server")]
pub use parley::server;
pub use parley::signals;
pub use parley::transcript;

pub use parley::{DebateConfig, DebateError, DebateOutcome, Orchestrator};
