pub mod agent;
pub mod breaker;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod process;
pub mod reader;
pub mod runner;
pub mod state;
pub mod stream;
pub mod validation;

/// Marker the agent must print for a run to count as successful,
/// independent of the process exit code.
pub const EXIT_SIGNAL: &str = "EXIT_SIGNAL: true";

/// Poll interval for cancellation checks (reader loop and process wait).
pub const POLL_INTERVAL_MS: u64 = 100;
