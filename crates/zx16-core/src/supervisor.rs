//! Lifecycle supervisor.
//!
//! Entry point for every operation the HTTP layer exposes. It enforces the
//! per-command deadlines, serializes commands per session through the
//! session's command slot, evicts idle sessions, and runs the single
//! teardown path that every ending (finish, stop, timeout, crash, eviction)
//! goes through: terminate the process if alive, delete the image, mark the
//! final state, drop the session from the registry.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{parse_registers, Boundary, ProcessStatus, RegisterFile, StepResult};
use crate::config::SimulatorConfig;
use crate::driver::{run_to_completion, Termination};
use crate::error::SimError;
use crate::gateway::{BuildCapability, CompilationGateway};
use crate::image::UploadedImage;
use crate::session::{Session, SessionId, SessionRegistry, SessionResources, SessionState};

/// How an uploaded image should be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    Step,
}

impl FromStr for RunMode {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "full" => Ok(RunMode::Full),
            "step" => Ok(RunMode::Step),
            other => Err(SimError::Validation(format!("Unknown mode '{}'", other))),
        }
    }
}

/// Response to a start request, tagged by mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SimulationOutcome {
    Full {
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        registers: Option<RegisterFile>,
    },
    Step {
        session_id: SessionId,
        initial_output: String,
    },
}

/// Capability check plus live session count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    #[serde(flatten)]
    pub capability: BuildCapability,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    AlreadyStopped,
}

/// Result of a stop request. Never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub status: StopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u64>,
}

impl StopReport {
    fn already_stopped() -> Self {
        Self {
            status: StopStatus::AlreadyStopped,
            step_count: None,
        }
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Finished,
    Stopped,
    Evicted,
    Failed(&'static str),
}

impl Ending {
    fn final_state(self) -> SessionState {
        match self {
            Ending::Failed(_) => SessionState::Failed,
            _ => SessionState::Terminated,
        }
    }
}

/// Owns the session registry and enforces session lifetimes.
pub struct Supervisor {
    config: Arc<SimulatorConfig>,
    registry: Arc<SessionRegistry>,
    gateway: Arc<dyn CompilationGateway>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("active_sessions", &self.registry.len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(config: SimulatorConfig, gateway: Arc<dyn CompilationGateway>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            gateway,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Capability check. Never fails.
    pub fn capability(&self) -> CapabilityReport {
        CapabilityReport {
            capability: self.gateway.capability(),
            active_sessions: self.registry.len(),
        }
    }

    /// Compile the simulator. Blocking; call from a blocking context.
    pub fn build(&self) -> Result<String, SimError> {
        let capability = self.gateway.capability();
        if !capability.source_found {
            return Err(SimError::Precondition(
                "simulator source not found".to_string(),
            ));
        }
        if !capability.compiler_available {
            return Err(SimError::Precondition("compiler not available".to_string()));
        }

        let outcome = self.gateway.build();
        if outcome.success {
            Ok(outcome.message)
        } else {
            Err(SimError::Build(outcome.message))
        }
    }

    /// Validate an upload and run it in the requested mode.
    pub async fn simulate(
        &self,
        file_name: &str,
        bytes: &[u8],
        mode: RunMode,
    ) -> Result<SimulationOutcome, SimError> {
        match mode {
            RunMode::Full => self.run_full(file_name, bytes).await,
            RunMode::Step => {
                let (session_id, initial_output) = self.start_session(file_name, bytes).await?;
                Ok(SimulationOutcome::Step {
                    session_id,
                    initial_output,
                })
            }
        }
    }

    /// Run an image to completion and return the transcript.
    pub async fn run_full(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<SimulationOutcome, SimError> {
        let image = self.accept_upload(file_name, bytes)?;
        let result = run_to_completion(Arc::clone(&self.config), image.path()).await;
        image.discard();

        let run = result?;
        let registers = parse_registers(&run.stdout);
        Ok(SimulationOutcome::Full {
            output: run.stdout,
            registers,
        })
    }

    /// Start a stepping session.
    pub async fn start_session(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(SessionId, String), SimError> {
        let image = self.accept_upload(file_name, bytes)?;
        self.registry.create(Arc::clone(&self.config), image).await
    }

    /// Execute one instruction in a session.
    ///
    /// Commands queue on the session's slot. A command that acquires the slot
    /// after the session ended sees `NotFound`. The step runs on its own task,
    /// so a caller that goes away mid-step never leaves output unread.
    pub async fn next_step(&self, session_id: &SessionId) -> Result<StepResult, SimError> {
        let session = self.registry.get(session_id)?;
        session.touch();

        let task = tokio::spawn(step_session(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            session,
        ));
        task.await.map_err(|err| {
            log::error!("Step task for session {} failed: {}", session_id, err);
            SimError::Io(format!("Step task failed: {}", err))
        })?
    }

    /// Stop a session. Unknown or already-ended sessions report
    /// `already_stopped` and are never killed twice.
    ///
    /// Like steps, the stop runs on its own task and finishes even if the
    /// caller is dropped.
    pub async fn stop(&self, session_id: &SessionId) -> StopReport {
        let Ok(session) = self.registry.get(session_id) else {
            return StopReport::already_stopped();
        };

        let task = tokio::spawn(end_session(
            Arc::clone(&self.registry),
            session,
            Ending::Stopped,
        ));
        match task.await {
            Ok(report) => report,
            Err(err) => {
                log::error!("Stop task for session {} failed: {}", session_id, err);
                StopReport::already_stopped()
            }
        }
    }

    /// Terminate sessions idle longer than the configured timeout.
    ///
    /// Returns the number of sessions evicted. Sessions with a command in
    /// flight or queued are skipped.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = 0;

        for session in self.registry.snapshot() {
            if session.idle_for() <= idle_timeout {
                continue;
            }
            let Ok(mut slot) = session.slot.try_lock() else {
                continue;
            };
            // A command may have arrived between the snapshot and the lock.
            let idle_for = session.idle_for();
            if slot.process.is_none() || idle_for <= idle_timeout {
                continue;
            }

            log::info!("Evicting session {} after {:?} idle", session.id, idle_for);
            teardown(&self.registry, &session, &mut slot, Ending::Evicted).await;
            evicted += 1;
        }

        evicted
    }

    /// Run [`Self::evict_idle`] every sweep interval until shutdown.
    pub fn spawn_eviction_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let interval = supervisor.config.sweep_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let evicted = supervisor.evict_idle().await;
                        if evicted > 0 {
                            log::info!("Evicted {} idle sessions", evicted);
                        }
                    }
                    _ = supervisor.shutdown.cancelled() => {
                        log::info!("Eviction loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the eviction loop and tear down every live session.
    pub async fn shutdown(&self) {
        log::info!("Shutting down {} sessions", self.registry.len());
        self.shutdown.cancel();
        for id in self.registry.ids() {
            self.stop(&id).await;
        }
    }

    fn accept_upload(&self, file_name: &str, bytes: &[u8]) -> Result<UploadedImage, SimError> {
        crate::image::validate(file_name, bytes)?;

        let capability = self.gateway.capability();
        if !capability.executable_found {
            return Err(SimError::Precondition(format!(
                "simulator executable not found at {}",
                capability.executable_path
            )));
        }

        UploadedImage::store(&self.config.upload_dir, file_name, bytes)
    }
}

/// Run one step with the session's slot held, tearing down on the way out.
async fn step_session(
    config: Arc<SimulatorConfig>,
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
) -> Result<StepResult, SimError> {
    let mut slot = session.slot.lock().await;

    if slot.process.is_none() || session.state().is_terminal() {
        return Err(SimError::NotFound(session.id.clone()));
    }

    session.touch();
    session.set_state(SessionState::Stepping);

    let outcome = step_locked(&config, &session, &mut slot).await;

    match outcome {
        Ok(result) if result.terminated => {
            log::info!(
                "Session {} finished after {} steps",
                session.id,
                result.step_count
            );
            teardown(&registry, &session, &mut slot, Ending::Finished).await;
            Ok(result)
        }
        Ok(result) => {
            session.set_state(SessionState::Ready);
            session.touch();
            Ok(result)
        }
        // A concurrent stop owns the teardown; it is waiting for this slot.
        Err(err @ SimError::Cancelled(_)) => Err(err),
        Err(err) => {
            log::warn!("Session {} failed: {}", session.id, err);
            teardown(&registry, &session, &mut slot, Ending::Failed(err.kind())).await;
            Err(err)
        }
    }
}

async fn step_locked(
    config: &SimulatorConfig,
    session: &Session,
    slot: &mut SessionResources,
) -> Result<StepResult, SimError> {
    let process = slot
        .process
        .as_mut()
        .ok_or_else(|| SimError::NotFound(session.id.clone()))?;

    let raw = process
        .send_step(config.step_timeout, &session.cancel)
        .await?;
    let status = process.status();

    if raw.boundary == Boundary::Exited && status == ProcessStatus::Running {
        return Err(SimError::Io(
            "Simulator closed its output but is still running".to_string(),
        ));
    }

    slot.decoder.decode(raw, status)
}

async fn end_session(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    ending: Ending,
) -> StopReport {
    // Interrupt an in-flight step so the slot frees up promptly.
    session.cancel.cancel();
    let mut slot = session.slot.lock().await;

    if slot.process.is_none() {
        return StopReport::already_stopped();
    }

    let step_count = slot.decoder.step_count();
    teardown(&registry, &session, &mut slot, ending).await;
    StopReport {
        status: StopStatus::Stopped,
        step_count: Some(step_count),
    }
}

/// The one cleanup path. Caller holds the session's slot.
async fn teardown(
    registry: &SessionRegistry,
    session: &Session,
    slot: &mut SessionResources,
    ending: Ending,
) {
    let termination = match slot.process.take() {
        Some(mut process) => Some(process.terminate().await),
        None => None,
    };
    if let Some(image) = slot.image.take() {
        image.discard();
    }
    session.set_state(ending.final_state());
    registry.remove(&session.id);

    match termination {
        Some(Termination::Killed) => {
            log::warn!("Session {} ended ({:?}), process killed", session.id, ending)
        }
        _ => log::info!("Session {} ended ({:?})", session.id, ending),
    }
}
