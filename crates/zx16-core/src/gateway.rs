//! Compilation gateway.
//!
//! The session core only needs two things from the build side: a status
//! snapshot and a one-shot build. [`LocalToolchain`] implements both by
//! looking at the filesystem and shelling out to a C++ compiler once.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

use crate::config::SimulatorConfig;

/// Read-only snapshot of what is available for running the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildCapability {
    pub executable_found: bool,
    pub source_found: bool,
    pub compiler_available: bool,
    pub executable_path: String,
}

/// Result of a single build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildOutcome {
    pub success: bool,
    pub message: String,
}

/// The build collaborator consumed by the supervisor.
pub trait CompilationGateway: Send + Sync {
    /// Side-effect-free status read.
    fn capability(&self) -> BuildCapability;

    /// Compile the simulator once, synchronously.
    fn build(&self) -> BuildOutcome;
}

/// Builds `z16sim` from source with a locally installed compiler.
#[derive(Debug, Clone)]
pub struct LocalToolchain {
    executable_path: PathBuf,
    source_path: PathBuf,
    compiler: String,
}

impl LocalToolchain {
    pub fn new(
        executable_path: impl Into<PathBuf>,
        source_path: impl Into<PathBuf>,
        compiler: impl Into<String>,
    ) -> Self {
        Self {
            executable_path: executable_path.into(),
            source_path: source_path.into(),
            compiler: compiler.into(),
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(
            config.executable_path.clone(),
            config.source_path.clone(),
            config.compiler.clone(),
        )
    }
}

impl CompilationGateway for LocalToolchain {
    fn capability(&self) -> BuildCapability {
        BuildCapability {
            executable_found: self.executable_path.is_file(),
            source_found: self.source_path.is_file(),
            compiler_available: find_in_path(&self.compiler).is_some(),
            executable_path: self.executable_path.display().to_string(),
        }
    }

    fn build(&self) -> BuildOutcome {
        log::info!(
            "Building {} from {} with {}",
            self.executable_path.display(),
            self.source_path.display(),
            self.compiler
        );

        let output = Command::new(&self.compiler)
            .arg("-std=c++17")
            .arg("-O2")
            .arg("-o")
            .arg(&self.executable_path)
            .arg(&self.source_path)
            .output();

        match output {
            Ok(out) if out.status.success() => BuildOutcome {
                success: true,
                message: format!("Built {}", self.executable_path.display()),
            },
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                log::warn!("Build failed: {}", stderr);
                BuildOutcome {
                    success: false,
                    message: crate::error::sanitize(&stderr),
                }
            }
            Err(err) => BuildOutcome {
                success: false,
                message: format!("Failed to run {}: {}", self.compiler, err),
            },
        }
    }
}

/// Resolve a program name against `PATH` (paths containing a separator are
/// checked directly).
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}
