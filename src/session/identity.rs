// src/session/identity.rs
//
// Device identity (IMEI/UIN) detection from captured lines.
//
// Detection runs inside a bounded window. The passive strategy only scans
// lines; the active strategy also sends identity-request commands spaced
// `command_interval` apart while it scans. When the window closes without a
// match the session stays on its fallback log.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 14-17 digits next to an identity marker. The trailing group rejects longer digit runs.
static IDENTITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:IMEI\s*[:\-=#]?\s*|STATUS#UIN#)(\d{14,17})(?:\D|$)")
        .expect("identity pattern is valid")
});

/// Extract a device identity from a single line, if it carries one.
pub fn extract_identity(line: &str) -> Option<String> {
    IDENTITY_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether an outbound command asks the device for its identity.
pub fn is_identity_request(command: &str) -> bool {
    let c = command.trim().to_ascii_uppercase();
    c.starts_with('*') && (c.contains("IMEI") || c.contains("#UIN"))
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStrategy {
    /// Scan lines only
    Passive,
    /// Send identity-request commands and scan the responses
    #[default]
    Active,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentitySettings {
    #[serde(default)]
    pub strategy: IdentityStrategy,
    /// Request commands for the active strategy, tried in order
    #[serde(default = "default_identity_commands")]
    pub commands: Vec<String>,
    #[serde(default = "default_command_interval_ms")]
    pub command_interval_ms: u64,
    /// Detection window for the passive strategy (0 = only when the operator asks)
    #[serde(default = "default_passive_window_secs")]
    pub passive_window_secs: u64,
    /// Window opened when the operator sends an identity request by hand
    #[serde(default = "default_rearm_window_secs")]
    pub rearm_window_secs: u64,
}

fn default_identity_commands() -> Vec<String> {
    vec!["*GET#IMEI#".to_string(), "*GET#UIN#".to_string()]
}
fn default_command_interval_ms() -> u64 {
    2000
}
fn default_passive_window_secs() -> u64 {
    60
}
fn default_rearm_window_secs() -> u64 {
    10
}

impl Default for IdentitySettings {
    fn default() -> Self {
        IdentitySettings {
            strategy: IdentityStrategy::default(),
            commands: default_identity_commands(),
            command_interval_ms: default_command_interval_ms(),
            passive_window_secs: default_passive_window_secs(),
            rearm_window_secs: default_rearm_window_secs(),
        }
    }
}

impl IdentitySettings {
    pub fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms)
    }

    /// Total detection window for the configured strategy.
    /// Active: one interval per command plus one more for the last reply.
    pub fn window(&self) -> Duration {
        match self.strategy {
            IdentityStrategy::Passive => Duration::from_secs(self.passive_window_secs),
            IdentityStrategy::Active => {
                self.command_interval() * (self.commands.len() as u32 + 1)
            }
        }
    }

    pub fn rearm_window(&self) -> Duration {
        Duration::from_secs(self.rearm_window_secs)
    }
}

// ============================================================================
// Detector
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionPhase {
    Detecting { deadline: Instant },
    GaveUp,
    Resolved(String),
}

/// Result of offering a line to the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Not detecting; nothing to buffer
    Idle,
    /// Still detecting, no identity in this line
    Pending,
    /// This line resolved the identity
    Matched(String),
}

/// Per-session identity detector. Resolves at most once.
///
/// Times are passed in by the caller so the window can be tested without
/// waiting on a real clock.
pub struct IdentityDetector {
    session_id: u64,
    phase: Mutex<DetectionPhase>,
}

impl IdentityDetector {
    /// A detector whose window closes at `now + window`.
    pub fn new(session_id: u64, now: Instant, window: Duration) -> Self {
        let phase = if window.is_zero() {
            DetectionPhase::GaveUp
        } else {
            DetectionPhase::Detecting {
                deadline: now + window,
            }
        };
        IdentityDetector {
            session_id,
            phase: Mutex::new(phase),
        }
    }

    fn guard(&self) -> MutexGuard<'_, DetectionPhase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the window once its deadline has passed.
    fn expire(&self, phase: &mut DetectionPhase, now: Instant) {
        if let DetectionPhase::Detecting { deadline } = phase {
            if now >= *deadline {
                *phase = DetectionPhase::GaveUp;
                tlog!(
                    "[identity:s{}] No identity seen, continuing on fallback log",
                    self.session_id
                );
            }
        }
    }

    /// Whether lines captured at `now` should be held for migration.
    pub fn is_detecting(&self, now: Instant) -> bool {
        let mut phase = self.guard();
        self.expire(&mut phase, now);
        matches!(*phase, DetectionPhase::Detecting { .. })
    }

    /// Scan a captured line.
    pub fn offer(&self, line: &str, now: Instant) -> Detection {
        let mut phase = self.guard();
        self.expire(&mut phase, now);
        if !matches!(*phase, DetectionPhase::Detecting { .. }) {
            return Detection::Idle;
        }
        match extract_identity(line) {
            Some(identity) => {
                tlog!("[identity:s{}] Identity detected: {}", self.session_id, identity);
                *phase = DetectionPhase::Resolved(identity.clone());
                Detection::Matched(identity)
            }
            None => Detection::Pending,
        }
    }

    /// Reopen detection for `window` after an operator identity request.
    /// Never shortens a running window. Has no effect once resolved.
    pub fn rearm(&self, now: Instant, window: Duration) -> bool {
        let mut phase = self.guard();
        if matches!(*phase, DetectionPhase::Resolved(_)) || window.is_zero() {
            return false;
        }
        let deadline = match *phase {
            DetectionPhase::Detecting { deadline } => deadline.max(now + window),
            _ => now + window,
        };
        *phase = DetectionPhase::Detecting { deadline };
        true
    }

    #[cfg(test)]
    fn phase(&self) -> DetectionPhase {
        self.guard().clone()
    }
}
