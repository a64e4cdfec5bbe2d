// src/monitor.rs
//
// Port discovery and arbitration.
//
// A low-rate control loop that keeps at most one capture session alive:
// - enumerates ports every poll interval
// - tears the session down when its port disappears or its reader dies
// - when idle, opens every candidate port (last good port first) and picks
//   the first one that produces bytes within the probe window
// - starts capture on the winner, plus the active identity requests and the
//   delayed validator

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::sleep;

use crate::events::EventQueue;
use crate::io::serial::spawn_reader;
use crate::io::{IoError, SerialLink, SerialSettings, SerialTransport};
use crate::session::identity::IdentityStrategy;
use crate::session::{Session, SessionConfig};
use crate::settings::{AppSettings, ValidatorConfig};
use crate::validator::spawn_validation;

/// How often a probed port's receive buffer is checked.
const PROBE_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub serial: SerialSettings,
    pub poll_interval: Duration,
    pub probe_window: Duration,
    /// Delay from session start to validation
    pub settle_delay: Duration,
    pub max_line_length: usize,
    pub port_filter: Option<String>,
    pub session: SessionConfig,
}

impl MonitorConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        MonitorConfig {
            serial: settings.serial.clone(),
            poll_interval: settings.poll_interval(),
            probe_window: settings.probe_window(),
            settle_delay: settings.settle_delay(),
            max_line_length: crate::io::serial::DEFAULT_MAX_LINE_LENGTH,
            port_filter: settings.port_filter.clone(),
            session: SessionConfig {
                log_dir: settings.log_dir.clone(),
                host_id: settings.resolved_host_id(),
                recent_capacity: settings.recent_lines_capacity,
                identity: settings.identity.clone(),
            },
        }
    }
}

/// Snapshot for the operator's status query.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MonitorStatus {
    pub port: Option<String>,
    pub session_id: Option<u64>,
    pub identity: Option<String>,
    pub fallback_log: Option<PathBuf>,
    pub identified_log: Option<PathBuf>,
    /// Lines waiting for the identified log
    pub pending_lines: usize,
    pub suspended: bool,
}

#[derive(Default)]
struct MonitorState {
    active: Option<Arc<Session>>,
    last_good_port: Option<String>,
    /// Set by an explicit stop; no reconnect until start
    suspended: bool,
    next_session_id: u64,
}

pub struct PortMonitor {
    transport: Arc<dyn SerialTransport>,
    config: MonitorConfig,
    validator: Option<Arc<ValidatorConfig>>,
    events: EventQueue,
    state: Mutex<MonitorState>,
}

impl PortMonitor {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        config: MonitorConfig,
        validator: Option<Arc<ValidatorConfig>>,
        events: EventQueue,
    ) -> Self {
        PortMonitor {
            transport,
            config,
            validator,
            events,
            state: Mutex::new(MonitorState {
                next_session_id: 1,
                ..MonitorState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run discovery cycles until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        tlog!(
            "[monitor] Watching serial ports every {:?} ({})",
            self.config.poll_interval,
            self.config.serial.describe()
        );
        loop {
            self.cycle().await;
            sleep(self.config.poll_interval).await;
        }
    }

    /// One discovery cycle.
    pub async fn cycle(&self) {
        let ports = match self.transport.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tlog!("[monitor] {}", e);
                return;
            }
        };

        let lost = {
            let state = self.state();
            state.active.as_ref().and_then(|session| {
                if !ports.iter().any(|p| p == session.port_name()) {
                    Some(format!("{} disappeared", session.port_name()))
                } else if !session.is_active() {
                    Some(format!("{} stopped responding", session.port_name()))
                } else {
                    None
                }
            })
        };
        if let Some(reason) = lost {
            tlog!("[monitor] {}", reason);
            self.teardown().await;
        }

        let (idle, last_good) = {
            let state = self.state();
            (
                state.active.is_none() && !state.suspended,
                state.last_good_port.clone(),
            )
        };
        if !idle {
            return;
        }

        let candidates = self.candidates(ports, last_good.as_deref());
        if candidates.is_empty() {
            return;
        }

        let transport = self.transport.clone();
        let serial = self.config.serial.clone();
        let window = self.config.probe_window;
        let winner =
            tokio::task::spawn_blocking(move || probe_ports(transport.as_ref(), &candidates, &serial, window))
                .await;
        match winner {
            Ok(Some((port, link))) => self.start_session(port, link),
            Ok(None) => {}
            Err(e) => tlog!("[monitor] Probe task failed: {}", e),
        }
    }

    /// Candidate ports in probe order: last good port first, then the rest
    /// in enumeration order.
    fn candidates(&self, ports: Vec<String>, last_good: Option<&str>) -> Vec<String> {
        let mut candidates: Vec<String> = ports
            .into_iter()
            .filter(|p| match &self.config.port_filter {
                Some(filter) => p.contains(filter.as_str()),
                None => true,
            })
            .collect();
        if let Some(last) = last_good {
            if let Some(pos) = candidates.iter().position(|p| p == last) {
                let port = candidates.remove(pos);
                candidates.insert(0, port);
            }
        }
        candidates
    }

    fn start_session(&self, port: String, link: Box<dyn SerialLink>) {
        let writer = match link.try_clone_link() {
            Ok(writer) => writer,
            Err(e) => {
                tlog!("[monitor] Cannot start session on {}: {}", port, e);
                return;
            }
        };

        // Decide and install under one lock so a concurrent `stop` either
        // sees the session or prevents it.
        let (id, session) = {
            let mut state = self.state();
            if state.suspended || state.active.is_some() {
                tlog!("[monitor] Releasing {}: logging stopped during probe", port);
                return;
            }
            let id = state.next_session_id;
            state.next_session_id += 1;
            let session = Arc::new(Session::new(
                id,
                &port,
                writer,
                self.config.session.clone(),
                self.events.clone(),
            ));
            match spawn_reader(session.clone(), link, self.config.max_line_length) {
                Ok(handle) => session.attach_reader(handle),
                Err(e) => {
                    tlog!("[monitor] Failed to spawn reader for {}: {}", port, e);
                    drop(state);
                    session.stop();
                    return;
                }
            }
            state.active = Some(session.clone());
            state.last_good_port = Some(port.clone());
            (id, session)
        };
        tlog!("[monitor] Session {} started on {}", id, port);
        self.events.push_status(true, Some(&port));
        self.events.push_line(format!("Connected to {}", port));

        if self.config.session.identity.strategy == IdentityStrategy::Active {
            tokio::spawn(request_identity(session.clone()));
        }

        if let Some(validator) = &self.validator {
            let delay = validator
                .settle_delay_override()
                .unwrap_or(self.config.settle_delay);
            tlog!("[monitor] Validation on session {} starts in {:?}", id, delay);
            spawn_validation(validator.clone(), session, delay);
        }
    }

    /// Stop the active session, if any, and report the disconnect.
    async fn teardown(&self) {
        let Some(session) = self.state().active.take() else {
            return;
        };
        let port = session.port_name().to_string();
        let stopping = session.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
            tlog!("[monitor] Teardown of {} failed: {}", port, e);
        }
        self.events.push_status(false, None);
        self.events.push_line(format!("Disconnected from {}", port));
    }

    /// Stop capture and suspend reconnection until `start`.
    pub async fn stop(&self) {
        self.state().suspended = true;
        self.teardown().await;
        tlog!("[monitor] Logging stopped");
    }

    /// Resume discovery after `stop`.
    pub fn start(&self) {
        let mut state = self.state();
        if state.suspended {
            state.suspended = false;
            tlog!("[monitor] Logging resumed");
        }
    }

    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.state().active.clone()
    }

    /// Send an operator command to the active session.
    pub fn send_command(&self, command: &str) -> Result<(), IoError> {
        match self.active_session() {
            Some(session) => session.send_command(command),
            None => {
                self.events.push_line("Not connected");
                Err(IoError::closed("no active session"))
            }
        }
    }

    /// Send every `*`-prefixed line of `text` to the active session.
    pub fn send_lines(&self, text: &str) -> Result<usize, IoError> {
        match self.active_session() {
            Some(session) => session.send_lines(text),
            None => {
                self.events.push_line("Not connected");
                Err(IoError::closed("no active session"))
            }
        }
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.state();
        match &state.active {
            Some(session) => {
                let (fallback_log, identified_log) = session.log_paths();
                MonitorStatus {
                    port: Some(session.port_name().to_string()),
                    session_id: Some(session.id()),
                    identity: session.identity().map(str::to_string),
                    fallback_log,
                    identified_log,
                    pending_lines: session.pending_lines(),
                    suspended: state.suspended,
                }
            }
            None => MonitorStatus {
                port: None,
                session_id: None,
                identity: None,
                fallback_log: None,
                identified_log: None,
                pending_lines: 0,
                suspended: state.suspended,
            },
        }
    }

    /// Final teardown on process exit.
    pub async fn shutdown(&self) {
        self.teardown().await;
    }
}

/// Open every candidate and wait for the first one with inbound bytes.
/// Ports that fail to open are skipped. Losing handles are dropped here.
fn probe_ports(
    transport: &dyn SerialTransport,
    candidates: &[String],
    settings: &SerialSettings,
    window: Duration,
) -> Option<(String, Box<dyn SerialLink>)> {
    let mut open: Vec<(String, Box<dyn SerialLink>)> = Vec::new();
    for port in candidates {
        match transport.open(port, settings) {
            Ok(link) => open.push((port.clone(), link)),
            Err(e) => tlog!("[monitor] Skipping {}: {}", port, e),
        }
    }
    if open.is_empty() {
        return None;
    }

    let deadline = Instant::now() + window;
    loop {
        let mut failed = Vec::new();
        let mut winner = None;
        for (i, (port, link)) in open.iter_mut().enumerate() {
            match link.bytes_available() {
                Ok(n) if n > 0 => {
                    winner = Some(i);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tlog!("[monitor] Probe of {} failed: {}", port, e);
                    failed.push(i);
                }
            }
        }
        if let Some(i) = winner {
            let (port, link) = open.swap_remove(i);
            tlog!("[monitor] {} is producing data", port);
            return Some((port, link));
        }
        for i in failed.into_iter().rev() {
            open.remove(i);
        }
        if open.is_empty() || Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(PROBE_POLL);
    }
}

/// Active identity strategy: send each request command, spaced by the
/// command interval, until the identity resolves or the window closes.
async fn request_identity(session: Arc<Session>) {
    let settings = session.config().identity.clone();
    for command in &settings.commands {
        if !session.is_active() || !session.is_detecting_identity() {
            return;
        }
        if let Err(e) = session.send_identity_request(command) {
            tlog!("[monitor] Identity request {} failed: {}", command, e);
            return;
        }
        sleep(settings.command_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_queue, tests::RecordingSink, DisplayEvent, EventConsumer};
    use crate::io::fake::{FakeDevice, FakeTransport};
    use crate::session::identity::IdentitySettings;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, strategy: IdentityStrategy) -> MonitorConfig {
        MonitorConfig {
            serial: SerialSettings::default(),
            poll_interval: Duration::from_millis(20),
            probe_window: Duration::from_millis(100),
            settle_delay: Duration::from_secs(3600),
            max_line_length: 1024,
            port_filter: None,
            session: SessionConfig {
                log_dir: dir.path().to_path_buf(),
                host_id: "bench".into(),
                recent_capacity: 100,
                identity: IdentitySettings {
                    strategy,
                    command_interval_ms: 50,
                    ..IdentitySettings::default()
                },
            },
        }
    }

    fn monitor(
        dir: &TempDir,
        transport: Arc<FakeTransport>,
        strategy: IdentityStrategy,
    ) -> (PortMonitor, EventConsumer) {
        let (queue, consumer) = event_queue();
        (
            PortMonitor::new(transport, test_config(dir, strategy), None, queue),
            consumer,
        )
    }

    async fn eventually(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        f()
    }

    fn statuses(consumer: &mut EventConsumer) -> Vec<DisplayEvent> {
        let mut sink = RecordingSink::default();
        consumer.drain_into(&mut sink);
        let events = sink.events.lock().unwrap().clone();
        events
            .into_iter()
            .filter(|e| matches!(e, DisplayEvent::Status { .. }))
            .collect()
    }

    #[tokio::test]
    async fn test_port_with_data_wins_arbitration() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let quiet = FakeDevice::new("/dev/ttyS0");
        let tcu = FakeDevice::new("/dev/ttyUSB0");
        transport.plug(quiet.clone());
        transport.plug(tcu.clone());
        tcu.emit_line("NET: registered");

        let (monitor, mut consumer) = monitor(&dir, transport, IdentityStrategy::Passive);
        monitor.cycle().await;

        let session = monitor.active_session().unwrap();
        assert_eq!(session.port_name(), "/dev/ttyUSB0");
        // Losing probe handle closed, winner holds reader + writer
        assert_eq!(quiet.open_handles.load(Ordering::SeqCst), 0);
        assert_eq!(tcu.open_handles.load(Ordering::SeqCst), 2);
        assert_eq!(
            statuses(&mut consumer),
            vec![DisplayEvent::Status {
                connected: true,
                port: Some("/dev/ttyUSB0".into())
            }]
        );

        // Probed bytes are not consumed by the probe
        assert!(eventually(|| session.recent().snapshot() == vec!["NET: registered"]).await);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_port_is_reprobed_next_cycle() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let tcu = FakeDevice::new("/dev/ttyACM0");
        transport.plug(tcu.clone());

        let (monitor, _consumer) = monitor(&dir, transport, IdentityStrategy::Passive);
        monitor.cycle().await;
        assert!(monitor.active_session().is_none());
        assert_eq!(tcu.opens.load(Ordering::SeqCst), 1);
        assert_eq!(tcu.open_handles.load(Ordering::SeqCst), 0);

        tcu.emit_line("boot");
        monitor.cycle().await;
        assert_eq!(tcu.opens.load(Ordering::SeqCst), 2);
        assert!(monitor.active_session().is_some());
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_port_is_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let busy = FakeDevice::new("/dev/ttyUSB0");
        let tcu = FakeDevice::new("/dev/ttyUSB1");
        busy.emit_line("other device");
        tcu.emit_line("NET: up");
        transport.plug(busy);
        transport.plug(tcu);
        transport.set_busy("/dev/ttyUSB0");

        let (monitor, _consumer) = monitor(&dir, transport, IdentityStrategy::Passive);
        monitor.cycle().await;
        assert_eq!(
            monitor.active_session().map(|s| s.port_name().to_string()),
            Some("/dev/ttyUSB1".to_string())
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unplug_tears_down_session() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let tcu = FakeDevice::new("/dev/ttyUSB0");
        transport.plug(tcu.clone());
        tcu.emit_line("first");

        let (monitor, mut consumer) = monitor(&dir, transport.clone(), IdentityStrategy::Passive);
        monitor.cycle().await;
        let session = monitor.active_session().unwrap();
        assert!(eventually(|| session.recent().len() == 1).await);
        let fallback = session.log_paths().0.unwrap();

        transport.unplug("/dev/ttyUSB0");
        monitor.cycle().await;
        assert!(monitor.active_session().is_none());
        assert!(!session.is_active());
        assert_eq!(tcu.open_handles.load(Ordering::SeqCst), 0);

        // Nothing reaches the log after teardown
        session.ingest_line("late".into());
        let content = std::fs::read_to_string(&fallback).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.ends_with(" - first\n"));

        assert_eq!(
            statuses(&mut consumer),
            vec![
                DisplayEvent::Status {
                    connected: true,
                    port: Some("/dev/ttyUSB0".into())
                },
                DisplayEvent::Status {
                    connected: false,
                    port: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_last_good_port_probed_first() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let a = FakeDevice::new("/dev/ttyUSB0");
        let b = FakeDevice::new("/dev/ttyUSB1");
        transport.plug(a.clone());
        b.emit_line("b talks");
        transport.plug(b.clone());

        let (monitor, _consumer) = monitor(&dir, transport, IdentityStrategy::Passive);
        monitor.cycle().await;
        assert_eq!(monitor.status().port.as_deref(), Some("/dev/ttyUSB1"));

        monitor.stop().await;
        monitor.start();
        a.emit_line("a talks");
        b.emit_line("b again");
        monitor.cycle().await;
        assert_eq!(monitor.status().port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(monitor.status().session_id, Some(2));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_suspends_until_start() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let tcu = FakeDevice::new("/dev/ttyUSB0");
        transport.plug(tcu.clone());
        tcu.emit_line("hello");

        let (monitor, _consumer) = monitor(&dir, transport, IdentityStrategy::Passive);
        monitor.cycle().await;
        assert!(monitor.active_session().is_some());

        monitor.stop().await;
        assert!(monitor.status().suspended);
        tcu.emit_line("still talking");
        monitor.cycle().await;
        assert!(monitor.active_session().is_none());
        assert!(monitor.send_command("*GET#IMEI#").is_err());

        monitor.start();
        monitor.cycle().await;
        assert!(monitor.active_session().is_some());
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_during_probe_prevents_session() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let tcu = FakeDevice::new("/dev/ttyUSB0");
        transport.plug(tcu.clone());

        let mut config = test_config(&dir, IdentityStrategy::Passive);
        config.probe_window = Duration::from_millis(300);
        let (queue, mut consumer) = event_queue();
        let monitor = PortMonitor::new(transport, config, None, queue);

        // Device starts talking after the operator stopped, inside the window
        let talker = tcu.clone();
        tokio::join!(monitor.cycle(), async {
            sleep(Duration::from_millis(50)).await;
            monitor.stop().await;
            sleep(Duration::from_millis(100)).await;
            talker.emit_line("late boot");
        });

        assert!(monitor.status().suspended);
        assert!(monitor.active_session().is_none());
        assert_eq!(tcu.open_handles.load(Ordering::SeqCst), 0);
        assert!(statuses(&mut consumer).is_empty());

        monitor.start();
        monitor.cycle().await;
        assert_eq!(monitor.status().session_id, Some(1));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_identity_requests_resolve_identity() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let tcu = FakeDevice::new("/dev/ttyUSB0");
        tcu.respond_with(|cmd| match cmd {
            "*GET#UIN#" => vec!["STATUS#UIN#123456789012345#".to_string()],
            _ => Vec::new(),
        });
        tcu.emit_line("boot banner");
        transport.plug(tcu.clone());

        let (monitor, _consumer) = monitor(&dir, transport, IdentityStrategy::Active);
        monitor.cycle().await;
        let session = monitor.active_session().unwrap();

        assert!(eventually(|| session.identity().is_some()).await);
        assert_eq!(session.identity(), Some("123456789012345"));
        assert_eq!(tcu.commands(), vec!["*GET#IMEI#", "*GET#UIN#"]);

        let status = monitor.status();
        let identified = status.identified_log.unwrap();
        let content = std::fs::read_to_string(identified).unwrap();
        assert!(content.contains(" - boot banner\n"));
        assert!(content.contains(" - STATUS#UIN#123456789012345#\n"));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_commands_reach_active_session() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let tcu = FakeDevice::new("/dev/ttyUSB0");
        tcu.emit_line("ready");
        transport.plug(tcu.clone());

        let (monitor, _consumer) = monitor(&dir, transport, IdentityStrategy::Passive);
        monitor.cycle().await;
        monitor.send_command("*GET#APN#").unwrap();
        assert_eq!(monitor.send_lines("*SET#APN#x#\nnoise\n*GET#APN#").unwrap(), 2);
        assert_eq!(tcu.commands(), vec!["*GET#APN#", "*SET#APN#x#", "*GET#APN#"]);
        monitor.shutdown().await;
    }
}
