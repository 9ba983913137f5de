//! Per-session state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::StepDecoder;
use crate::driver::SimulatorProcess;
use crate::image::UploadedImage;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of a session. `Terminated` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Stepping,
    Terminated,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Stepping => "stepping",
            SessionState::Terminated => "terminated",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything a command needs exclusive access to.
///
/// Lives behind the session's command slot, so holding the slot guard is the
/// only way to touch the process.
#[derive(Debug, Default)]
pub struct SessionResources {
    pub process: Option<SimulatorProcess>,
    pub image: Option<UploadedImage>,
    pub decoder: StepDecoder,
}

/// One interactive run of the simulator.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Exclusive command slot
    pub slot: tokio::sync::Mutex<SessionResources>,
    /// Cancels in-flight reads when the session is being stopped
    pub cancel: CancellationToken,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
}

impl Session {
    /// A new session in `Starting`, with no process attached yet.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            slot: tokio::sync::Mutex::new(SessionResources::default()),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Starting),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`. Returns false (and changes nothing) once the session
    /// has reached a final state.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}
