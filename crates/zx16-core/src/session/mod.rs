//! Session lifecycle management.

mod registry;
mod state;

pub use registry::SessionRegistry;
pub use state::{Session, SessionId, SessionResources, SessionState};
