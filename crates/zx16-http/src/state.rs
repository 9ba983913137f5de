//! Shared state for the HTTP server.

use std::sync::Arc;

use zx16_core::Supervisor;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct SharedState {
    /// Owner of every simulator session.
    pub supervisor: Arc<Supervisor>,
}

impl SharedState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}
