//! Error taxonomy shared by every layer.
//!
//! Each variant carries a short, already-sanitized message. The HTTP layer
//! only looks at [`SimError::kind`] to pick a status code, so the kinds are
//! part of the wire contract.

use crate::session::SessionId;
use thiserror::Error;

/// Longest message we ever hand back to a caller.
pub const MAX_MESSAGE_LEN: usize = 512;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid upload: {0}")]
    Validation(String),

    #[error("Simulator unavailable: {0}")]
    Precondition(String),

    #[error("Failed to start simulator: {0}")]
    ProcessSpawn(String),

    #[error("Simulator did not respond within {0:?}")]
    ProcessTimeout(std::time::Duration),

    #[error("Simulator exited with status {code:?}: {stderr}")]
    ProcessCrash { code: Option<i32>, stderr: String },

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Simulator I/O failed: {0}")]
    Io(String),

    #[error("Session {0} was stopped while a step was in flight")]
    Cancelled(SessionId),

    #[error("Build failed: {0}")]
    Build(String),
}

impl SimError {
    /// Stable identifier for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            SimError::Validation(_) => "validation",
            SimError::Precondition(_) => "precondition",
            SimError::ProcessSpawn(_) => "spawn",
            SimError::ProcessTimeout(_) => "timeout",
            SimError::ProcessCrash { .. } => "crash",
            SimError::NotFound(_) => "not_found",
            SimError::Io(_) => "io",
            SimError::Cancelled(_) => "cancelled",
            SimError::Build(_) => "build",
        }
    }

    /// Build a crash error, capping whatever the simulator wrote to stderr.
    pub fn crash(code: Option<i32>, stderr: &str) -> Self {
        SimError::ProcessCrash {
            code,
            stderr: sanitize(stderr),
        }
    }

    /// Caller-facing message: the display text, sanitized and capped.
    pub fn public_message(&self) -> String {
        sanitize(&self.to_string())
    }
}

impl From<std::io::Error> for SimError {
    fn from(err: std::io::Error) -> Self {
        SimError::Io(sanitize(&err.to_string()))
    }
}

/// Strip control characters (keeping newlines and tabs) and cap the length
/// at [`MAX_MESSAGE_LEN`] bytes on a char boundary.
pub fn sanitize(text: &str) -> String {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    if cleaned.len() <= MAX_MESSAGE_LEN {
        return cleaned;
    }

    let mut end = MAX_MESSAGE_LEN;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &cleaned[..end])
}
