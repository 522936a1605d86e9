//! RCON client interface consumed by action steps and the script host
//!
//! The protocol client is external; the engine only needs a thread-safe
//! execute call. A recording implementation is provided for tests and for
//! running the worker without a live server.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use garrison_domain::ServerId;

/// RCON errors surfaced to steps
#[derive(Debug, Error, Clone)]
pub enum RconError {
    /// Connection-level failure
    #[error("rcon connection failed: {0}")]
    Connection(String),

    /// Server rejected or failed the command
    #[error("rcon command failed: {0}")]
    Command(String),
}

/// Trait for RCON clients. Implementations must be thread-safe.
#[async_trait]
pub trait RconClient: Send + Sync {
    /// Execute a console command against a server, returning its response
    async fn execute(&self, server_id: &ServerId, command: &str) -> Result<String, RconError>;
}

// =============================================================================
// Recording Client
// =============================================================================

/// RCON client that records commands and replays scripted outcomes.
///
/// With no scripted outcomes every command succeeds with an empty response.
#[derive(Default)]
pub struct RecordingRconClient {
    commands: Mutex<Vec<(ServerId, String)>>,
    scripted: Mutex<Vec<Result<String, RconError>>>,
}

impl RecordingRconClient {
    /// Create a new recording client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next command (FIFO)
    pub fn script(&self, outcome: Result<String, RconError>) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.push(outcome);
        }
    }

    /// Queue `n` consecutive failures
    pub fn script_failures(&self, n: usize, message: &str) {
        for _ in 0..n {
            self.script(Err(RconError::Command(message.to_string())));
        }
    }

    /// All commands executed so far
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.iter().map(|(_, cmd)| cmd.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RconClient for RecordingRconClient {
    async fn execute(&self, server_id: &ServerId, command: &str) -> Result<String, RconError> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push((*server_id, command.to_string()));
        }
        let next = self
            .scripted
            .lock()
            .ok()
            .and_then(|mut s| if s.is_empty() { None } else { Some(s.remove(0)) });
        next.unwrap_or_else(|| Ok(String::new()))
    }
}
