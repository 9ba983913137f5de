//! Step protocol codec.
//!
//! The simulator writes an unframed byte stream. In interactive mode it
//! prints `READY_FOR_STEP` on its own line whenever it is waiting for the
//! next command, so that line is the primary step boundary. Without a marker
//! the driver falls back to quiescence, and whatever accumulated becomes the
//! step's output.
//!
//! This module is pure: it never touches a process. The driver feeds it
//! chunks and tells it how the read ended.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::error::SimError;

static REGISTER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([a-z][a-z0-9]*) \(x([0-7])\): 0x([0-9a-fA-F]{1,4})").unwrap()
});

const REGISTER_HEADER: &str = "--- Registers ---";

/// ABI names of the eight ZX16 registers, indexed by register number.
pub const REGISTER_NAMES: [&str; 8] = ["t0", "ra", "sp", "s0", "s1", "t1", "a0", "a1"];

/// How a read of simulator output came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// The simulator printed its ready marker
    Marker,
    /// No new bytes arrived for the quiet period
    Quiescent,
    /// stdout closed because the process exited
    Exited,
}

/// Output collected for one step, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStep {
    pub output: String,
    pub stderr: String,
    pub boundary: Boundary,
}

/// Liveness of the simulator, sampled right after the read finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exited with the given code (`None` when killed by a signal)
    Exited(Option<i32>),
}

/// Decoded result of one `next_step` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub output: String,
    pub step_count: u64,
    pub terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<RegisterFile>,
}

/// Snapshot of the register file taken from a `--- Registers ---` dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegisterFile {
    pub values: [u16; 8],
}

impl RegisterFile {
    /// Look up a register by ABI name (`a0`) or numeric name (`x6`).
    pub fn get(&self, name: &str) -> Option<u16> {
        if let Some(idx) = REGISTER_NAMES.iter().position(|n| *n == name) {
            return Some(self.values[idx]);
        }
        let idx: usize = name.strip_prefix('x')?.parse().ok()?;
        self.values.get(idx).copied()
    }
}

/// Accumulates chunks until a step boundary is reached.
///
/// Chunks may split lines (or UTF-8 sequences) anywhere; the buffer keeps raw
/// bytes and only decodes text when a step is taken.
#[derive(Debug, Default)]
pub struct StepBuffer {
    bytes: Vec<u8>,
    marker: Option<String>,
}

impl StepBuffer {
    pub fn new(marker: Option<String>) -> Self {
        Self {
            bytes: Vec::new(),
            marker,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes buffered since the last step was taken.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds a complete marker line.
    pub fn has_marker(&self) -> bool {
        self.marker_span().is_some()
    }

    /// Remove and return this step's output.
    ///
    /// With a marker present, everything before the marker line is returned
    /// and anything after it stays buffered for the next step. Otherwise the
    /// whole buffer is drained.
    pub fn take_step(&mut self) -> String {
        match self.marker_span() {
            Some((start, end)) => {
                let rest = self.bytes.split_off(end);
                self.bytes.truncate(start);
                let step = std::mem::replace(&mut self.bytes, rest);
                String::from_utf8_lossy(&step).into_owned()
            }
            None => {
                let step = std::mem::take(&mut self.bytes);
                String::from_utf8_lossy(&step).into_owned()
            }
        }
    }

    /// Byte range of the first complete marker line, newline included.
    fn marker_span(&self) -> Option<(usize, usize)> {
        let marker = self.marker.as_deref()?.as_bytes();
        let mut start = 0;
        while let Some(offset) = self.bytes[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = &self.bytes[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line == marker {
                return Some((start, end + 1));
            }
            start = end + 1;
        }
        None
    }
}

/// Turns raw step output into [`StepResult`]s and owns the step counter.
#[derive(Debug, Default)]
pub struct StepDecoder {
    step_count: u64,
}

impl StepDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Decode one step.
    ///
    /// A clean exit after the final chunk terminates the session normally; any
    /// other exit is a crash and does not count as a step.
    pub fn decode(&mut self, raw: RawStep, status: ProcessStatus) -> Result<StepResult, SimError> {
        let terminated = match status {
            ProcessStatus::Running => false,
            ProcessStatus::Exited(Some(0)) => true,
            ProcessStatus::Exited(code) => return Err(SimError::crash(code, &raw.stderr)),
        };

        self.step_count += 1;
        let registers = parse_registers(&raw.output);
        Ok(StepResult {
            output: raw.output,
            step_count: self.step_count,
            terminated,
            registers,
        })
    }
}

/// Return the last complete register dump in `text`, if any.
pub fn parse_registers(text: &str) -> Option<RegisterFile> {
    let mut last = None;
    let mut current: Option<(RegisterFile, u8)> = None;

    for line in text.lines() {
        if line.trim() == REGISTER_HEADER {
            current = Some((RegisterFile::default(), 0));
            continue;
        }
        let Some((file, seen)) = current.as_mut() else {
            continue;
        };
        match REGISTER_LINE.captures(line) {
            Some(caps) => {
                let idx: usize = caps[2].parse().unwrap_or(0);
                if let Ok(value) = u16::from_str_radix(&caps[3], 16) {
                    file.values[idx] = value;
                    *seen |= 1 << idx;
                }
            }
            None => {
                if *seen == u8::MAX {
                    last = Some(*file);
                }
                current = None;
            }
        }
    }

    if let Some((file, seen)) = current {
        if seen == u8::MAX {
            last = Some(file);
        }
    }
    last
}
