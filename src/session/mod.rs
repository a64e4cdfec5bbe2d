// src/session/mod.rs
//
// A capture session: the binding between one open port and one logical
// capture run. Owns the port's write handle, the capture logs, the identity
// detector, and the recent-lines window. The reader thread feeds it lines;
// the validator and the operator send commands through it.

pub mod identity;
pub mod log_router;
pub mod recent;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Local;
use once_cell::sync::OnceCell;

use crate::events::EventQueue;
use crate::io::{IoError, SerialLink};
use identity::{is_identity_request, Detection, IdentityDetector, IdentitySettings};
use log_router::{CapturedLine, LogRouter};
use recent::RecentLines;

pub use identity::{extract_identity, IdentityStrategy};

/// Per-session settings derived from the application settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Root of the capture log tree
    pub log_dir: PathBuf,
    /// Host identifier written into identified log names
    pub host_id: String,
    pub recent_capacity: usize,
    pub identity: IdentitySettings,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Session {
    id: u64,
    port_name: String,
    config: SessionConfig,
    /// Capture running; cleared on stop or when the reader hits a fatal error
    active: AtomicBool,
    /// Teardown done; guards against double teardown
    closed: AtomicBool,
    identity: OnceCell<String>,
    detector: IdentityDetector,
    router: Mutex<LogRouter>,
    recent: RecentLines,
    /// Write direction of the port. The lock serialises concurrent writers.
    writer: Mutex<Option<Box<dyn SerialLink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: EventQueue,
}

impl Session {
    /// Create a session over `writer`. Identity detection starts now.
    pub fn new(
        id: u64,
        port_name: &str,
        writer: Box<dyn SerialLink>,
        config: SessionConfig,
        events: EventQueue,
    ) -> Self {
        let started = Local::now();
        let detector = IdentityDetector::new(id, Instant::now(), config.identity.window());
        let router = LogRouter::new(config.log_dir.clone(), id, started);
        let recent = RecentLines::new(config.recent_capacity);
        Session {
            id,
            port_name: port_name.to_string(),
            config,
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            identity: OnceCell::new(),
            detector,
            router: Mutex::new(router),
            recent,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(None),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolved device identity. Immutable once set.
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn is_detecting_identity(&self) -> bool {
        self.identity.get().is_none() && self.detector.is_detecting(Instant::now())
    }

    pub fn recent(&self) -> &RecentLines {
        &self.recent
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Current fallback and identified capture log paths.
    pub fn log_paths(&self) -> (Option<PathBuf>, Option<PathBuf>) {
        let router = lock(&self.router);
        (
            router.fallback_path().map(PathBuf::from),
            router.identified_path().map(PathBuf::from),
        )
    }

    /// Lines held for migration to the identified log.
    pub fn pending_lines(&self) -> usize {
        lock(&self.router).pending_len()
    }

    pub(crate) fn attach_reader(&self, handle: JoinHandle<()>) {
        *lock(&self.reader) = Some(handle);
    }

    /// Route one framed line: capture log, identity detection, recent
    /// window, then the display queue. Ignored after teardown.
    pub fn ingest_line(&self, text: String) {
        let line = CapturedLine::now(text);
        let now = Instant::now();
        {
            let mut router = lock(&self.router);
            if router.is_closed() {
                return;
            }

            // A known identity whose log could not be created keeps buffering
            // so the next attempt still migrates every line.
            let identity = self.identity.get();
            let awaiting_log = identity.is_some() && router.identity().is_none();
            let detecting = identity.is_none() && self.detector.is_detecting(now);
            if let Err(e) = router.capture(&line, detecting || awaiting_log) {
                tlog!("[session:{}] Capture write failed: {}", self.id, e);
            }

            if detecting {
                if let Detection::Matched(identity) = self.detector.offer(&line.text, now) {
                    self.resolve_identity(&mut router, identity);
                }
            } else if let Some(identity) = identity.filter(|_| awaiting_log) {
                // Failure already logged; the next line retries
                let _ = self.migrate(&mut router, identity);
            }
        }

        self.recent.push(line.text.clone());
        self.events.push_line(line.text);
    }

    fn resolve_identity(&self, router: &mut LogRouter, identity: String) {
        if self.identity.set(identity.clone()).is_err() {
            return;
        }
        if let Err(e) = self.migrate(router, &identity) {
            self.events
                .push_line(format!("IMEI detected: {} - log file error: {}", identity, e));
        }
    }

    /// Move capture to the identified log. On failure capture stays on the
    /// fallback and is retried with the next line.
    fn migrate(&self, router: &mut LogRouter, identity: &str) -> Result<(), IoError> {
        match router.identify(identity, &self.config.host_id) {
            Ok(Some(path)) => {
                self.events.push_line(format!(
                    "IMEI detected: {} - Log file: {}",
                    identity,
                    path.display()
                ));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                tlog!(
                    "[session:{}] Identified log unavailable, staying on fallback: {}",
                    self.id,
                    e
                );
                Err(e)
            }
        }
    }

    fn transmit(&self, command: &str) -> Result<(), IoError> {
        {
            let mut writer = lock(&self.writer);
            let link = writer
                .as_mut()
                .ok_or_else(|| IoError::closed(&self.port_name))?;
            link.write_all(format!("{}\n", command).as_bytes())?;
        }

        tlog!("[session:{}] Sent command: {}", self.id, command);
        self.events.push_line(format!("Sent command: {}", command));
        Ok(())
    }

    /// Identity request from the active strategy. Does not touch the
    /// detection window.
    pub(crate) fn send_identity_request(&self, command: &str) -> Result<(), IoError> {
        self.transmit(command)
    }

    /// Transmit `command` verbatim with a trailing newline. An identity
    /// request on an unidentified session re-arms detection.
    pub fn send_command(&self, command: &str) -> Result<(), IoError> {
        self.transmit(command)?;

        if self.identity.get().is_none() && is_identity_request(command) {
            if self
                .detector
                .rearm(Instant::now(), self.config.identity.rearm_window())
            {
                tlog!("[session:{}] Identity detection re-armed by {}", self.id, command);
            }
        }
        Ok(())
    }

    /// Send each line of `text` that starts with `*`. Returns how many were sent.
    pub fn send_lines(&self, text: &str) -> Result<usize, IoError> {
        let mut sent = 0;
        for line in text.lines().map(str::trim).filter(|l| l.starts_with('*')) {
            self.send_command(line)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Stop the reader loop without tearing down (fatal read error).
    pub(crate) fn mark_lost(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tlog!("[session:{}] Link on {} lost", self.id, self.port_name);
        }
    }

    /// Tear the session down: stop the reader, close logs and the port.
    /// Idempotent and safe to call from any thread.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);

        // Reader checks `active` between reads; wait for it before closing files
        let reader = lock(&self.reader).take();
        if let Some(handle) = reader {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        lock(&self.router).close();
        lock(&self.writer).take();
        tlog!("[session:{}] Session on {} stopped", self.id, self.port_name);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
