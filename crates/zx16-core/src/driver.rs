//! Simulator process driver.
//!
//! Owns the raw interaction with one simulator child:
//! - spawning it in interactive mode against an image
//! - forwarding stdout chunks and stderr lines from background tasks
//! - writing step commands to stdin
//! - reading until the step boundary, the process exits, or the deadline
//! - graceful-then-forced termination
//!
//! Reads never block the caller's task on a pipe: the background readers push
//! into a channel and [`SimulatorProcess::send_step`] selects over that
//! channel, a deadline and a cancellation token.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::codec::{Boundary, ProcessStatus, RawStep, StepBuffer};
use crate::config::SimulatorConfig;
use crate::error::SimError;
use crate::logging::{Direction, Transcript};
use crate::session::SessionId;

/// Most stderr we keep around for error reports.
const STDERR_KEEP: usize = 4096;

/// How long to wait for trailing stderr once stdout has closed.
const STDERR_DRAIN: Duration = Duration::from_millis(100);

/// Events forwarded by the reader tasks.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A chunk of stdout, split wherever the pipe happened to split it
    Stdout(Vec<u8>),
    /// A line of stderr
    Stderr(String),
    StdoutClosed,
    StderrClosed,
}

/// How [`SimulatorProcess::terminate`] ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited; nothing was sent
    AlreadyExited(Option<i32>),
    /// The process exited within the grace period
    Exited(Option<i32>),
    /// The process had to be killed
    Killed,
}

/// Output of a full run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A running interactive simulator.
pub struct SimulatorProcess {
    session_id: SessionId,
    config: Arc<SimulatorConfig>,
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    buffer: StepBuffer,
    stderr: String,
    stdout_closed: bool,
    stderr_closed: bool,
    terminated: bool,
    transcript: Transcript,
}

impl std::fmt::Debug for SimulatorProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorProcess")
            .field("session_id", &self.session_id)
            .field("pid", &self.child.id())
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl SimulatorProcess {
    /// Launch the simulator in interactive mode and read its initial output.
    ///
    /// The initial output is everything printed before the first step
    /// boundary (banner and initial register dump). If the process exits or
    /// the spawn deadline passes first, it is torn down and an error returned.
    pub async fn spawn(
        session_id: SessionId,
        config: Arc<SimulatorConfig>,
        image: &Path,
        transcript: Transcript,
        cancel: &CancellationToken,
    ) -> Result<(Self, String), SimError> {
        let mut cmd = Command::new(&config.executable_path);
        cmd.arg(&config.interactive_flag)
            .arg(image)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&config.executable_path, e))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SimError::ProcessSpawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SimError::ProcessSpawn("Failed to capture stderr".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let tx_stdout = tx.clone();
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx_stdout.send(ProcessEvent::Stdout(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = tx_stdout.send(ProcessEvent::StdoutClosed);
        });

        let tx_stderr = tx;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_stderr.send(ProcessEvent::Stderr(line)).is_err() {
                    break;
                }
            }
            let _ = tx_stderr.send(ProcessEvent::StderrClosed);
        });

        log::info!(
            "Spawned simulator for session {} (pid {:?})",
            session_id,
            child.id()
        );
        transcript.record(
            Direction::Event,
            &format!(
                "spawn {} {} {}",
                config.executable_path.display(),
                config.interactive_flag,
                image.display()
            ),
        );

        let mut process = Self {
            buffer: StepBuffer::new(config.ready_marker.clone()),
            session_id,
            config,
            child,
            stdin,
            events: rx,
            stderr: String::new(),
            stdout_closed: false,
            stderr_closed: false,
            terminated: false,
            transcript,
        };

        let deadline = process.config.spawn_timeout;
        let initial = match process.read_step(deadline, cancel).await {
            Ok(raw) if raw.boundary == Boundary::Exited => {
                let status = process.status();
                process.terminate().await;
                return Err(SimError::ProcessSpawn(format!(
                    "Simulator exited before it was ready ({:?}): {}",
                    status,
                    crate::error::sanitize(&process.stderr)
                )));
            }
            Ok(raw) => raw.output,
            Err(err) => {
                process.terminate().await;
                return Err(err);
            }
        };

        Ok((process, initial))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Execute one instruction and collect its output.
    pub async fn send_step(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<RawStep, SimError> {
        let token = self.config.step_token.clone();
        self.write_line(&token).await?;
        self.read_step(deadline, cancel).await
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Sample the exit status without waiting.
    pub fn status(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited(status.code()),
            Err(err) => {
                log::warn!("try_wait failed for session {}: {}", self.session_id, err);
                ProcessStatus::Exited(None)
            }
        }
    }

    /// Captured stderr so far (capped).
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Shut the process down.
    ///
    /// Sends the quit command and closes stdin, then escalates to SIGTERM and
    /// finally SIGKILL if the process is still around after each half of the
    /// grace period. Safe to call repeatedly and on an exited process.
    pub async fn terminate(&mut self) -> Termination {
        if let ProcessStatus::Exited(code) = self.status() {
            self.terminated = true;
            self.stdin.take();
            return Termination::AlreadyExited(code);
        }
        self.terminated = true;

        let half_grace = self.config.grace_period / 2;

        if let Some(mut stdin) = self.stdin.take() {
            let quit = format!("{}\n", self.config.quit_token);
            let _ = timeout(half_grace, stdin.write_all(quit.as_bytes())).await;
            self.transcript.record(Direction::Stdin, &self.config.quit_token);
        }

        if let Ok(Ok(status)) = timeout(half_grace, self.child.wait()).await {
            log::debug!("Session {} exited after quit", self.session_id);
            return Termination::Exited(status.code());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid belongs to a child we still own and have not reaped.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if let Ok(Ok(status)) = timeout(half_grace, self.child.wait()).await {
                log::debug!("Session {} exited after SIGTERM", self.session_id);
                return Termination::Exited(status.code());
            }
        }

        log::warn!(
            "Session {} did not exit within {:?}, killing",
            self.session_id,
            self.config.grace_period
        );
        if let Err(err) = self.child.kill().await {
            log::warn!("Failed to kill session {}: {}", self.session_id, err);
        }
        self.transcript.record(Direction::Event, "killed");
        Termination::Killed
    }

    async fn write_line(&mut self, data: &str) -> Result<(), SimError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SimError::Io("Simulator stdin is closed".to_string()))?;
        self.transcript.record(Direction::Stdin, data);
        stdin.write_all(format!("{}\n", data).as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read until a step boundary.
    ///
    /// Boundaries: the ready marker (marker mode), a quiet period after at
    /// least one byte (quiescence mode), or stdout closing. The deadline
    /// expiring first is a timeout regardless of partial output.
    async fn read_step(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<RawStep, SimError> {
        let deadline_at = Instant::now() + deadline;
        let quiescence = self.config.ready_marker.is_none();

        loop {
            if self.buffer.has_marker() {
                return Ok(self.take(Boundary::Marker));
            }
            if self.buffer.len() > self.config.max_output_bytes {
                log::warn!("Session {} exceeded the output limit", self.session_id);
                self.transcript.record(Direction::Event, "output limit exceeded");
                return Err(output_limit(self.config.max_output_bytes));
            }
            if self.stdout_closed {
                self.wait_for_exit(deadline_at).await;
                return Ok(self.take(Boundary::Exited));
            }

            let waiting_for_quiet = quiescence && !self.buffer.is_empty();
            let wake_at = if waiting_for_quiet {
                (Instant::now() + self.config.quiet_period).min(deadline_at)
            } else {
                deadline_at
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SimError::Cancelled(self.session_id.clone()));
                }
                event = self.events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => self.stdout_closed = true,
                },
                _ = sleep_until(wake_at) => {
                    if waiting_for_quiet && Instant::now() < deadline_at {
                        return Ok(self.take(Boundary::Quiescent));
                    }
                    log::warn!("Session {} timed out after {:?}", self.session_id, deadline);
                    self.transcript
                        .record(Direction::Event, &format!("timeout after {:?}", deadline));
                    return Err(SimError::ProcessTimeout(deadline));
                }
            }
        }
    }

    fn apply(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(chunk) => {
                self.transcript.record(Direction::Stdout, &String::from_utf8_lossy(&chunk));
                self.buffer.push(&chunk);
            }
            ProcessEvent::Stderr(line) => {
                log::debug!("simulator stderr [{}]: {}", self.session_id, line);
                self.transcript.record(Direction::Stderr, &line);
                if self.stderr.len() < STDERR_KEEP {
                    self.stderr.push_str(&line);
                    self.stderr.push('\n');
                }
            }
            ProcessEvent::StdoutClosed => self.stdout_closed = true,
            ProcessEvent::StderrClosed => self.stderr_closed = true,
        }
    }

    /// stdout is closed: reap the process and collect trailing stderr.
    async fn wait_for_exit(&mut self, deadline_at: Instant) {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if timeout(remaining, self.child.wait()).await.is_err() {
            log::warn!(
                "Session {} closed stdout but is still running",
                self.session_id
            );
        }

        let drain_until = Instant::now() + STDERR_DRAIN;
        while !self.stderr_closed {
            match timeout(
                drain_until.saturating_duration_since(Instant::now()),
                self.events.recv(),
            )
            .await
            {
                Ok(Some(event)) => self.apply(event),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn take(&mut self, boundary: Boundary) -> RawStep {
        self.transcript.flush();
        RawStep {
            output: self.buffer.take_step(),
            stderr: self.stderr.clone(),
            boundary,
        }
    }
}

/// Run an image to completion by stepping the simulator until it exits.
///
/// Only interactive mode dumps registers, so the run drives it step by step
/// and the transcript ends with the final register state. The run is bounded
/// by `run_timeout` and `max_output_bytes`; crossing either kills the process.
pub async fn run_to_completion(
    config: Arc<SimulatorConfig>,
    image: &Path,
) -> Result<RunOutput, SimError> {
    let run_id = SessionId::new();
    let transcript = Transcript::open(config.log_dir.as_deref(), &format!("run-{}", run_id));
    let cancel = CancellationToken::new();
    let deadline_at = Instant::now() + config.run_timeout;

    log::info!("Running {} to completion", image.display());
    let (mut process, mut stdout) =
        SimulatorProcess::spawn(run_id, Arc::clone(&config), image, transcript, &cancel).await?;

    let result = loop {
        if stdout.len() > config.max_output_bytes {
            break Err(output_limit(config.max_output_bytes));
        }
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Err(SimError::ProcessTimeout(config.run_timeout));
        }

        let raw = match process.send_step(remaining, &cancel).await {
            Ok(raw) => raw,
            Err(SimError::ProcessTimeout(_)) => {
                break Err(SimError::ProcessTimeout(config.run_timeout))
            }
            Err(err) => break Err(err),
        };
        stdout.push_str(&raw.output);

        if raw.boundary == Boundary::Exited {
            break match process.status() {
                ProcessStatus::Exited(Some(0)) => Ok(()),
                ProcessStatus::Exited(code) => Err(SimError::crash(code, &raw.stderr)),
                ProcessStatus::Running => Err(SimError::Io(
                    "Simulator closed its output but is still running".to_string(),
                )),
            };
        }
    };

    if let Err(err) = &result {
        log::warn!("Full run of {} failed: {}", image.display(), err);
    }
    process.terminate().await;

    result.map(|()| RunOutput {
        stdout,
        stderr: process.stderr().to_string(),
    })
}

fn output_limit(limit: usize) -> SimError {
    SimError::Io(format!("Simulator output exceeded {} bytes", limit))
}

fn spawn_error(path: &Path, err: std::io::Error) -> SimError {
    match err.kind() {
        std::io::ErrorKind::NotFound => SimError::ProcessSpawn(format!(
            "Simulator executable not found at {}",
            path.display()
        )),
        std::io::ErrorKind::PermissionDenied => SimError::ProcessSpawn(format!(
            "Simulator at {} is not executable",
            path.display()
        )),
        _ => SimError::ProcessSpawn(format!("Failed to spawn {}: {}", path.display(), err)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
