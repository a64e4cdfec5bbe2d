// src/session/log_router.rs
//
// Capture log routing for one session.
// Lines go to a per-session fallback file until the device identity is known,
// then to an identified log that starts with every line buffered so far.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::io::IoError;

/// Prefix of identified capture logs (the upload job scans for it).
pub const IDENTIFIED_PREFIX: &str = "serial_log_";
/// Prefix of pre-identity capture logs.
pub const FALLBACK_PREFIX: &str = "unknown_";

/// A line as captured, with its capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedLine {
    pub at: DateTime<Local>,
    pub text: String,
}

impl CapturedLine {
    pub fn now(text: impl Into<String>) -> Self {
        CapturedLine {
            at: Local::now(),
            text: text.into(),
        }
    }

    /// On-disk form: `YYYY-mm-dd HH:MM:SS - text`
    fn render(&self) -> String {
        format!("{} - {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.text)
    }
}

/// An open capture file. Every write is flushed.
struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    fn create(path: PathBuf) -> Result<Self, IoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IoError::file(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| IoError::file(&path, e))?;
        Ok(LogFile { path, file })
    }

    fn write(&mut self, line: &CapturedLine) -> Result<(), IoError> {
        writeln!(self.file, "{}", line.render())
            .and_then(|_| self.file.flush())
            .map_err(|e| IoError::file(&self.path, e))
    }
}

enum RouterState {
    /// Identity unknown. `complete` stays true while every fallback line is
    /// also in `pending`.
    Buffering {
        fallback: Option<LogFile>,
        pending: Vec<CapturedLine>,
        complete: bool,
    },
    Identified {
        identity: String,
        log: LogFile,
    },
    Closed,
}

/// Per-session capture log state machine: `Buffering` -> `Identified`.
pub struct LogRouter {
    root: PathBuf,
    session_id: u64,
    started: DateTime<Local>,
    /// Fallback path, remembered after the file is closed
    fallback_path: Option<PathBuf>,
    state: RouterState,
}

impl LogRouter {
    pub fn new(root: impl Into<PathBuf>, session_id: u64, started: DateTime<Local>) -> Self {
        LogRouter {
            root: root.into(),
            session_id,
            started,
            fallback_path: None,
            state: RouterState::Buffering {
                fallback: None,
                pending: Vec::new(),
                complete: true,
            },
        }
    }

    /// Path of this session's fallback file (whether or not it exists yet).
    /// Scoped to the session so identification never deletes another
    /// session's lines.
    pub fn fallback_file_path(&self) -> PathBuf {
        let date = self.started.format("%Y-%m-%d");
        self.root.join(date.to_string()).join(format!(
            "{}{}_{}_s{}.log",
            FALLBACK_PREFIX,
            date,
            self.started.format("%H%M%S"),
            self.session_id
        ))
    }

    /// Path for an identified log created at `at`.
    pub fn identified_file_path(&self, identity: &str, host: &str, at: DateTime<Local>) -> PathBuf {
        self.root.join(at.format("%Y-%m-%d").to_string()).join(format!(
            "{}{}_{}_{}.log",
            IDENTIFIED_PREFIX,
            sanitize(identity),
            sanitize(host),
            at.format("%Y%m%d_%H%M%S")
        ))
    }

    /// Write a captured line to the current target.
    ///
    /// While buffering, `buffer` says whether identity detection is still
    /// running. Once a line arrives with `buffer == false` the pending lines
    /// are dropped and the fallback file becomes this session's permanent log.
    pub fn capture(&mut self, line: &CapturedLine, buffer: bool) -> Result<(), IoError> {
        let fallback_path = self.fallback_file_path();
        match &mut self.state {
            RouterState::Buffering {
                fallback,
                pending,
                complete,
            } => {
                if buffer && *complete {
                    pending.push(line.clone());
                } else if *complete {
                    *complete = false;
                    pending.clear();
                    pending.shrink_to_fit();
                }

                if fallback.is_none() {
                    let file = LogFile::create(fallback_path)?;
                    tlog!(
                        "[router:s{}] Fallback log opened: {}",
                        self.session_id,
                        file.path.display()
                    );
                    self.fallback_path = Some(file.path.clone());
                    *fallback = Some(file);
                }
                match fallback {
                    Some(file) => file.write(line),
                    None => Ok(()),
                }
            }
            RouterState::Identified { log, .. } => log.write(line),
            RouterState::Closed => Ok(()),
        }
    }

    /// Switch to the identified log for `identity`.
    ///
    /// Creates the identified file, replays the pending lines in order with
    /// their capture timestamps, then closes the fallback file and deletes it
    /// if every line in it was replayed. Returns the identified log path.
    /// Does nothing (returns `Ok(None)`) unless currently buffering.
    pub fn identify(&mut self, identity: &str, host: &str) -> Result<Option<PathBuf>, IoError> {
        if !matches!(self.state, RouterState::Buffering { .. }) {
            return Ok(None);
        }

        let path = self.identified_file_path(identity, host, Local::now());
        // On failure stay in Buffering so capture continues into the fallback
        let mut log = LogFile::create(path)?;

        let old = std::mem::replace(&mut self.state, RouterState::Closed);
        let RouterState::Buffering {
            fallback,
            pending,
            complete,
        } = old
        else {
            return Ok(None);
        };

        let mut replay_error = None;
        for line in &pending {
            if let Err(e) = log.write(line) {
                replay_error.get_or_insert(e);
            }
        }
        tlog!(
            "[router:s{}] Identity {} -> {} ({} buffered lines migrated)",
            self.session_id,
            identity,
            log.path.display(),
            pending.len()
        );

        // Close before deleting
        drop(fallback);
        if let Some(fallback_path) = self.fallback_path.as_deref() {
            if complete && replay_error.is_none() {
                remove_fallback(self.session_id, fallback_path);
            } else {
                tlog!(
                    "[router:s{}] Keeping fallback log {} (not every line was migrated)",
                    self.session_id,
                    fallback_path.display()
                );
            }
        }

        let identified_path = log.path.clone();
        self.state = RouterState::Identified {
            identity: identity.to_string(),
            log,
        };

        match replay_error {
            Some(e) => Err(e),
            None => Ok(Some(identified_path)),
        }
    }

    /// Close every file. Later captures are ignored. Idempotent.
    pub fn close(&mut self) {
        if !matches!(self.state, RouterState::Closed) {
            self.state = RouterState::Closed;
            tlog!("[router:s{}] Capture logs closed", self.session_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, RouterState::Closed)
    }

    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            RouterState::Identified { identity, .. } => Some(identity.as_str()),
            _ => None,
        }
    }

    /// Fallback file path once it has been created.
    pub fn fallback_path(&self) -> Option<&Path> {
        self.fallback_path.as_deref()
    }

    pub fn identified_path(&self) -> Option<&Path> {
        match &self.state {
            RouterState::Identified { log, .. } => Some(log.path.as_path()),
            _ => None,
        }
    }

    /// Number of lines waiting for migration.
    pub fn pending_len(&self) -> usize {
        match &self.state {
            RouterState::Buffering { pending, .. } => pending.len(),
            _ => 0,
        }
    }
}

/// Best-effort delete; another process may still hold the file open.
fn remove_fallback(session_id: u64, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tlog!("[router:s{}] Fallback log removed: {}", session_id, path.display()),
        Err(e) => tlog!(
            "[router:s{}] Failed to remove fallback log {}: {}",
            session_id,
            path.display(),
            e
        ),
    }
}

/// Keep file names portable: anything but ASCII alphanumerics, `-` and `.` becomes `-`.
fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
