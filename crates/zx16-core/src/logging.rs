//! Per-session transcript files.
//!
//! When a log directory is configured every exchange with a simulator is
//! appended to `{log_dir}/{session_id}.log`, one timestamped entry per line.
//! Without a directory the transcript is a no-op. Entries are buffered and
//! reach the disk on lifecycle events, on [`Transcript::flush`] and on drop.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

/// Which side of the conversation an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stdin,
    Stdout,
    Stderr,
    /// Lifecycle events (spawn, timeout, kill)
    Event,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Stdin => "STDIN",
            Direction::Stdout => "STDOUT",
            Direction::Stderr => "STDERR",
            Direction::Event => "EVENT",
        }
    }
}

/// Append-only transcript of one simulator process.
#[derive(Debug, Default)]
pub struct Transcript {
    file: Mutex<Option<BufWriter<File>>>,
}

impl Transcript {
    /// A transcript that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open `{dir}/{id}.log` for appending. Falls back to a disabled
    /// transcript when `dir` is `None` or the file cannot be created.
    pub fn open(dir: Option<&Path>, id: &str) -> Self {
        let file = dir.and_then(|dir| {
            if let Err(err) = std::fs::create_dir_all(dir) {
                log::warn!("Cannot create log dir {}: {}", dir.display(), err);
                return None;
            }
            let path = dir.join(format!("{}.log", id));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(err) => {
                    log::warn!("Cannot open transcript {}: {}", path.display(), err);
                    None
                }
            }
        });
        Self {
            file: Mutex::new(file),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Record `data`, one entry per line.
    pub fn record(&self, direction: Direction, data: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        let Some(file) = guard.as_mut() else {
            return;
        };

        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for line in data.lines() {
            let _ = writeln!(file, "[{}] {}: {}", ts, direction.tag(), line);
        }
        if direction == Direction::Event {
            let _ = file.flush();
        }
    }

    pub fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
        }
    }
}
