// src/validator.rs
//
// Command/response validator.
//
// After the settle delay, checks the device's configuration parameters one at
// a time over the session's command channel: send GET, wait for the response
// line in the recent-lines window, compare against the expected value, and
// send the configured SET once when every attempt failed. The profile applied
// is chosen from the device type reported alongside the UIN.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::time::{sleep, Instant};

use crate::io::IoError;
use crate::session::recent::RecentLines;
use crate::session::Session;
use crate::settings::{ParameterCheck, ValidatorConfig};

/// Marker of a UIN response line.
pub const UIN_MARKER: &str = "STATUS#UIN#";

/// Pause between two attempts of the same exchange.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

// ============================================================================
// Command channel
// ============================================================================

/// What the validator needs from a session.
pub trait CommandChannel: Send + Sync {
    fn send_command(&self, command: &str) -> Result<(), IoError>;

    /// Window the responses arrive in.
    fn recent(&self) -> &RecentLines;

    fn is_active(&self) -> bool;

    /// Report a validator message to the operator.
    fn report(&self, message: String);
}

impl CommandChannel for Session {
    fn send_command(&self, command: &str) -> Result<(), IoError> {
        Session::send_command(self, command)
    }

    fn recent(&self) -> &RecentLines {
        Session::recent(self)
    }

    fn is_active(&self) -> bool {
        Session::is_active(self)
    }

    fn report(&self, message: String) {
        tlog!("[validator:s{}] {}", self.id(), message);
        self.events().push_line(format!("[OTA] {}", message));
    }
}

// ============================================================================
// Device types
// ============================================================================

static DEVICE_TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:TCU[\s_-]?(2G|4G)|(SAMPARK))\b").expect("device type pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Tcu2G,
    Tcu4G,
    Sampark,
    Unknown,
}

impl DeviceType {
    /// Device type named in a response line.
    pub fn detect(line: &str) -> DeviceType {
        let Some(caps) = DEVICE_TYPE_PATTERN.captures(line) else {
            return DeviceType::Unknown;
        };
        if caps.get(2).is_some() {
            return DeviceType::Sampark;
        }
        match caps.get(1).map(|m| m.as_str().to_ascii_uppercase()) {
            Some(ref g) if g == "2G" => DeviceType::Tcu2G,
            Some(ref g) if g == "4G" => DeviceType::Tcu4G,
            _ => DeviceType::Unknown,
        }
    }

    /// Key of this type in `device_profiles`.
    pub fn profile_key(self) -> Option<&'static str> {
        match self {
            DeviceType::Tcu2G => Some("TCU 2G"),
            DeviceType::Tcu4G => Some("TCU 4G"),
            DeviceType::Sampark => Some("Sampark"),
            DeviceType::Unknown => None,
        }
    }

    pub fn from_profile_key(key: &str) -> DeviceType {
        DeviceType::detect(key)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile_key().unwrap_or("Unknown"))
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    /// Wrong or missing, fixed by the SET command
    Corrected,
    /// Still wrong after every attempt (and the SET, if configured)
    Uncorrectable { last_response: Option<String> },
    /// No response at all and no SET configured
    NoResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterResult {
    pub command: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ValidationReport {
    Skipped {
        reason: String,
    },
    Completed {
        uin: Option<String>,
        device_type: DeviceType,
        results: Vec<ParameterResult>,
    },
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReport::Skipped { reason } => write!(f, "Validation skipped: {}", reason),
            ValidationReport::Completed {
                uin,
                device_type,
                results,
            } => {
                let count = |pred: fn(&Outcome) -> bool| results.iter().filter(|r| pred(&r.outcome)).count();
                write!(
                    f,
                    "Validation complete for {} ({}): {} ok, {} corrected, {} uncorrectable, {} no response",
                    uin.as_deref().unwrap_or("unknown UIN"),
                    device_type,
                    count(|o| matches!(o, Outcome::Ok)),
                    count(|o| matches!(o, Outcome::Corrected)),
                    count(|o| matches!(o, Outcome::Uncorrectable { .. })),
                    count(|o| matches!(o, Outcome::NoResponse)),
                )
            }
        }
    }
}

/// Response keyword of a GET command: `*GET#APN#` -> `APN`.
pub fn derive_keyword(get_command: &str) -> String {
    let trimmed = get_command.trim().trim_start_matches('*');
    let mut fields = trimmed.split('#').filter(|f| !f.is_empty());
    match (fields.next(), fields.next()) {
        (Some(_verb), Some(name)) => name.to_string(),
        (Some(only), None) => only.to_string(),
        _ => get_command.trim().to_string(),
    }
}

/// UIN value of a `STATUS#UIN#` line.
fn parse_uin(line: &str) -> Option<String> {
    let (_, rest) = line.split_once(UIN_MARKER)?;
    let value = rest
        .trim_matches(|c: char| c == '#' || c.is_whitespace())
        .split('#')
        .next()?
        .trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// The session went away mid-run.
struct Aborted;

// ============================================================================
// Validator
// ============================================================================

pub struct Validator {
    config: Arc<ValidatorConfig>,
    channel: Arc<dyn CommandChannel>,
}

impl Validator {
    pub fn new(config: Arc<ValidatorConfig>, channel: Arc<dyn CommandChannel>) -> Self {
        Validator { config, channel }
    }

    /// Run the full pass. Never fails; every outcome lands in the report.
    pub async fn run(&self) -> ValidationReport {
        match self.run_inner().await {
            Ok(report) => report,
            Err(Aborted) => ValidationReport::Skipped {
                reason: "session ended during validation".to_string(),
            },
        }
    }

    async fn run_inner(&self) -> Result<ValidationReport, Aborted> {
        let (uin, device_type) = if self.config.uin_commands.is_empty() {
            (None, DeviceType::Unknown)
        } else {
            match self.detect_uin().await? {
                Some((uin, line)) => (Some(uin), DeviceType::detect(&line)),
                None => {
                    self.channel.report("UIN detection failed".to_string());
                    return Ok(ValidationReport::Skipped {
                        reason: "no UIN response".to_string(),
                    });
                }
            }
        };

        let profile_key = device_type
            .profile_key()
            .map(str::to_string)
            .or_else(|| self.config.default_device_type.clone());
        let Some(profile_key) = profile_key else {
            return Ok(ValidationReport::Skipped {
                reason: "device type not detected".to_string(),
            });
        };
        let Some(profile) = self.config.device_profiles.get(&profile_key) else {
            self.channel
                .report(format!("No profile found for {}", profile_key));
            return Ok(ValidationReport::Skipped {
                reason: format!("no profile for {}", profile_key),
            });
        };

        let device_type = match device_type {
            DeviceType::Unknown => DeviceType::from_profile_key(&profile_key),
            known => known,
        };
        self.channel.report(format!(
            "Validating {} parameter(s) with profile {}",
            profile.len(),
            profile_key
        ));

        let mut results = Vec::with_capacity(profile.len());
        for (get_command, check) in profile {
            let outcome = self.check_parameter(get_command, check).await?;
            self.channel
                .report(format!("{} -> {}", get_command, describe(&outcome)));
            results.push(ParameterResult {
                command: get_command.clone(),
                outcome,
            });
        }

        Ok(ValidationReport::Completed {
            uin,
            device_type,
            results,
        })
    }

    /// Try every UIN command `attempts` times. Returns the UIN and its line.
    async fn detect_uin(&self) -> Result<Option<(String, String)>, Aborted> {
        let attempts = self.config.attempts();
        for command in &self.config.uin_commands {
            for attempt in 1..=attempts {
                self.channel.report(format!(
                    "Attempt {}: Sending UIN command: {}",
                    attempt, command
                ));
                self.send(command)?;
                if let Some(line) = self.wait_for_response(UIN_MARKER, command).await? {
                    if let Some(uin) = parse_uin(&line) {
                        self.channel.report(format!("Detected UIN: {}", uin));
                        return Ok(Some((uin, line)));
                    }
                }
                self.pause().await?;
            }
        }
        Ok(None)
    }

    async fn check_parameter(&self, get_command: &str, check: &ParameterCheck) -> Result<Outcome, Aborted> {
        let keyword = check
            .keyword
            .clone()
            .unwrap_or_else(|| derive_keyword(get_command));
        let mut last_response = None;

        for attempt in 1..=self.config.attempts() {
            if attempt > 1 {
                self.pause().await?;
            }
            if self
                .get_and_compare(get_command, &keyword, &check.expected, &mut last_response)
                .await?
            {
                return Ok(Outcome::Ok);
            }
        }

        let Some(set_command) = &check.set_command else {
            return Ok(match last_response {
                Some(line) => Outcome::Uncorrectable {
                    last_response: Some(line),
                },
                None => Outcome::NoResponse,
            });
        };

        self.channel
            .report(format!("Sending SET command: {}", set_command));
        self.send(set_command)?;

        let verified = match &check.set_expected {
            Some(confirmation) => self
                .wait_for_response(confirmation, set_command)
                .await?
                .is_some(),
            None => {
                self.pause().await?;
                self.get_and_compare(get_command, &keyword, &check.expected, &mut last_response)
                    .await?
            }
        };

        Ok(if verified {
            Outcome::Corrected
        } else {
            Outcome::Uncorrectable { last_response }
        })
    }

    /// One GET exchange. Records the response line, if any.
    async fn get_and_compare(
        &self,
        get_command: &str,
        keyword: &str,
        expected: &str,
        last_response: &mut Option<String>,
    ) -> Result<bool, Aborted> {
        self.send(get_command)?;
        match self.wait_for_response(keyword, get_command).await? {
            Some(line) if line.contains(expected) => Ok(true),
            Some(line) => {
                *last_response = Some(line);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Clear stale lines and transmit. A failed write counts as a failed attempt.
    fn send(&self, command: &str) -> Result<(), Aborted> {
        if !self.channel.is_active() {
            return Err(Aborted);
        }
        self.channel.recent().drain();
        if let Err(e) = self.channel.send_command(command) {
            if !self.channel.is_active() {
                return Err(Aborted);
            }
            self.channel
                .report(format!("Failed to send {}: {}", command, e));
        }
        Ok(())
    }

    /// Poll the recent window for a line containing `keyword` that is not the
    /// echo of `command`. The window is drained on a match.
    async fn wait_for_response(&self, keyword: &str, command: &str) -> Result<Option<String>, Aborted> {
        let deadline = Instant::now() + self.config.response_timeout();
        let poll = self.config.poll_interval();
        let echo = command.trim();

        loop {
            if !self.channel.is_active() {
                return Err(Aborted);
            }
            let found = self
                .channel
                .recent()
                .take_match(|line| line.contains(keyword) && line.trim() != echo);
            if let Some(line) = found {
                return Ok(Some(line));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    async fn pause(&self) -> Result<(), Aborted> {
        sleep(RETRY_PAUSE).await;
        if self.channel.is_active() {
            Ok(())
        } else {
            Err(Aborted)
        }
    }
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Ok => "OK".to_string(),
        Outcome::Corrected => "corrected".to_string(),
        Outcome::Uncorrectable {
            last_response: Some(line),
        } => format!("uncorrectable (last response: {})", line),
        Outcome::Uncorrectable { last_response: None } => "uncorrectable (no response)".to_string(),
        Outcome::NoResponse => "no response".to_string(),
    }
}

/// Run a validation pass on `channel` after `delay`.
/// Returns `None` when the session ended before the delay elapsed.
pub fn spawn_validation(
    config: Arc<ValidatorConfig>,
    channel: Arc<dyn CommandChannel>,
    delay: Duration,
) -> tokio::task::JoinHandle<Option<ValidationReport>> {
    tokio::spawn(async move {
        sleep(delay).await;
        if !channel.is_active() {
            return None;
        }
        let report = Validator::new(config, channel.clone()).run().await;
        channel.report(report.to_string());
        Some(report)
    })
}
