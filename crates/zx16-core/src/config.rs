//! Runtime configuration for the simulator service.

use std::path::PathBuf;
use std::time::Duration;

/// Line the simulator prints when it is waiting for the next step command.
pub const READY_MARKER: &str = "READY_FOR_STEP";

/// Configuration for driving the simulator executable.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Path to the compiled simulator
    pub executable_path: PathBuf,
    /// Path to the simulator's C++ source, used by the build step
    pub source_path: PathBuf,
    /// Compiler binary used by the build step
    pub compiler: String,
    /// Flag that puts the simulator in step-by-step mode
    pub interactive_flag: String,
    /// Line written to stdin to execute one instruction
    pub step_token: String,
    /// Line written to stdin to ask the simulator to quit
    pub quit_token: String,
    /// End-of-step marker. `None` falls back to quiescence detection.
    pub ready_marker: Option<String>,
    /// Silence after which a step is considered complete (quiescence mode only)
    pub quiet_period: Duration,
    /// Deadline for the simulator to become ready after launch
    pub spawn_timeout: Duration,
    /// Deadline for a single step
    pub step_timeout: Duration,
    /// Deadline for a full run
    pub run_timeout: Duration,
    /// Most simulator output kept for one step or one full run
    pub max_output_bytes: usize,
    /// Time allowed for a graceful exit before the process is killed
    pub grace_period: Duration,
    /// Sessions idle longer than this are evicted
    pub idle_timeout: Duration,
    /// How often the eviction loop sweeps the registry
    pub sweep_interval: Duration,
    /// Directory for uploaded images
    pub upload_dir: PathBuf,
    /// Directory for per-session transcripts (disabled when `None`)
    pub log_dir: Option<PathBuf>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from("./z16sim"),
            source_path: PathBuf::from("./z16sim.cpp"),
            compiler: "g++".to_string(),
            interactive_flag: "-i".to_string(),
            step_token: "s".to_string(),
            quit_token: "q".to_string(),
            ready_marker: Some(READY_MARKER.to_string()),
            quiet_period: Duration::from_millis(200),
            spawn_timeout: Duration::from_secs(5),
            step_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
            grace_period: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            upload_dir: std::env::temp_dir(),
            log_dir: None,
        }
    }
}

impl SimulatorConfig {
    /// Create a config pointing at the given simulator executable.
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            ..Self::default()
        }
    }

    /// Set the simulator source path.
    pub fn source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = path.into();
        self
    }

    /// Set the compiler used by the build step.
    pub fn compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    /// Use a different end-of-step marker, or `None` for quiescence detection.
    pub fn ready_marker(mut self, marker: Option<String>) -> Self {
        self.ready_marker = marker;
        self
    }

    /// Set the quiescence window.
    pub fn quiet_period(mut self, period: Duration) -> Self {
        self.quiet_period = period;
        self
    }

    /// Set the spawn and step deadlines.
    pub fn command_timeouts(mut self, spawn: Duration, step: Duration) -> Self {
        self.spawn_timeout = spawn;
        self.step_timeout = step;
        self
    }

    /// Set the full-run deadline.
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Set the graceful shutdown window.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Cap the output collected for one step or one full run.
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Set idle eviction timing.
    pub fn idle_timeout(mut self, idle: Duration, sweep_interval: Duration) -> Self {
        self.idle_timeout = idle;
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the upload directory.
    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    /// Enable per-session transcripts in the given directory.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}
