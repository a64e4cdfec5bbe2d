#[macro_use]
mod logging;

pub mod events;
pub mod io;
pub mod monitor;
pub mod session;
pub mod settings;
pub mod validator;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use events::{event_queue, DisplaySink, EventQueue};
use io::SystemTransport;
use monitor::{MonitorConfig, PortMonitor};
use settings::{AppSettings, ValidatorConfig};

pub use logging::{app_log_path, init_file_logging, stop_file_logging};

/// Terminator of a `:paste` block.
const PASTE_END: &str = ".";

/// How a run is configured beyond the settings file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub settings: AppSettings,
    /// Run the validator after the settle delay
    pub validate: bool,
}

// ============================================================================
// Operator input
// ============================================================================

/// One line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Transmit the line to the device
    Send(String),
    /// Collect lines until `.` and send the `*` ones
    Paste,
    Stop,
    Start,
    Status,
    Quit,
    Help,
    Empty,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> OperatorCommand {
        let trimmed = line.trim();
        match trimmed {
            "" => OperatorCommand::Empty,
            ":stop" => OperatorCommand::Stop,
            ":start" => OperatorCommand::Start,
            ":status" => OperatorCommand::Status,
            ":paste" => OperatorCommand::Paste,
            ":quit" | ":q" | ":exit" => OperatorCommand::Quit,
            ":help" | ":h" => OperatorCommand::Help,
            _ => OperatorCommand::Send(trimmed.to_string()),
        }
    }
}

const HELP: &str = "Commands: :stop  :start  :status  :paste (end with '.')  :quit  - anything else is sent to the device";

// ============================================================================
// Entry
// ============================================================================

/// Load the validator configuration once. A failure disables validation for
/// this run and is reported once.
fn load_validator(options: &RunOptions, events: &EventQueue) -> Option<Arc<ValidatorConfig>> {
    if !options.validate {
        tlog!("[validator] Validation disabled");
        return None;
    }
    let path = &options.settings.validator_config;
    match ValidatorConfig::load(path) {
        Ok(config) => {
            tlog!(
                "[validator] Loaded {} ({} device profile(s))",
                path.display(),
                config.device_profiles.len()
            );
            Some(Arc::new(config))
        }
        Err(e) => {
            tlog!("[validator] Validation disabled: {}", e);
            events.push_line(format!("Validation disabled: {}", e));
            None
        }
    }
}

/// Run the logger until the operator quits or stdin closes.
pub fn run(options: RunOptions, sink: Box<dyn DisplaySink>) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tcu-logger")
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;
    runtime.block_on(run_async(options, sink));
    Ok(())
}

async fn run_async(options: RunOptions, sink: Box<dyn DisplaySink>) {
    let settings = &options.settings;
    if let Err(e) = init_file_logging(&settings.reports_dir) {
        tlog!("[logging] Continuing without a log file: {}", e);
    }

    let (events, consumer) = event_queue();
    let drain_interval = settings.drain_interval();
    let consumer_task = tokio::spawn(consumer.run(sink, drain_interval));

    let validator = load_validator(&options, &events);
    let config = MonitorConfig::from_settings(settings);
    tlog!(
        "[monitor] Capture logs in {} (host {})",
        config.session.log_dir.display(),
        config.session.host_id
    );
    let monitor = Arc::new(PortMonitor::new(
        Arc::new(SystemTransport),
        config,
        validator,
        events.clone(),
    ));
    let monitor_task = tokio::spawn(monitor.clone().run());

    events.push_line(HELP);
    operator_loop(&monitor, &events).await;

    monitor_task.abort();
    monitor.shutdown().await;
    // One more tick so the disconnect reaches the display
    tokio::time::sleep(drain_interval * 2).await;
    consumer_task.abort();
    stop_file_logging();
}

/// Read operator commands from stdin until `:quit` or EOF.
async fn operator_loop(monitor: &PortMonitor, events: &EventQueue) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut paste: Option<Vec<String>> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tlog!("[input] stdin read failed: {}", e);
                break;
            }
        };

        if let Some(buffer) = paste.as_mut() {
            if line.trim() == PASTE_END {
                let text = buffer.join("\n");
                paste = None;
                if let Err(e) = monitor.send_lines(&text) {
                    tlog!("[input] Paste not sent: {}", e);
                }
            } else {
                buffer.push(line);
            }
            continue;
        }

        match OperatorCommand::parse(&line) {
            OperatorCommand::Empty => {}
            OperatorCommand::Quit => break,
            OperatorCommand::Help => events.push_line(HELP),
            OperatorCommand::Stop => {
                monitor.stop().await;
                events.push_line("Logging stopped (:start to resume)");
            }
            OperatorCommand::Start => {
                monitor.start();
                events.push_line("Logging started");
            }
            OperatorCommand::Status => {
                match serde_json::to_string(&monitor.status()) {
                    Ok(json) => events.push_line(json),
                    Err(e) => tlog!("[input] Status unavailable: {}", e),
                }
                if let Some(path) = app_log_path() {
                    events.push_line(format!("Application log: {}", path.display()));
                }
            }
            OperatorCommand::Paste => {
                events.push_line("Paste mode: end with a line containing only '.'");
                paste = Some(Vec::new());
            }
            OperatorCommand::Send(command) => {
                if let Err(e) = monitor.send_command(&command) {
                    tlog!("[input] {} not sent: {}", command, e);
                }
            }
        }
    }
}
