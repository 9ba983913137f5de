//! # zx16-core
//!
//! Session management for the ZX16 simulator service.
//!
//! This crate is framework-agnostic and can be used by:
//! - the HTTP API (`zx16-http`)
//! - the standalone daemon (`zx16-daemon`)
//!
//! ## Key Concepts
//!
//! - **Session**: One interactive run of the simulator, stepped one instruction at a time
//! - **Step**: A single `next_step` command and the output it produced
//! - **Supervisor**: Owns every session and the only path that ends one

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod image;
pub mod logging;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use codec::{RegisterFile, StepResult};
pub use config::SimulatorConfig;
pub use error::SimError;
pub use gateway::{BuildCapability, CompilationGateway, LocalToolchain};
pub use session::{Session, SessionId, SessionRegistry, SessionState};
pub use supervisor::{
    CapabilityReport, RunMode, SimulationOutcome, StopReport, StopStatus, Supervisor,
};
