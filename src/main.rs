use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use crossterm::style::{style, Color, Stylize};
use crossterm::terminal::SetTitle;

use tcu_logger_lib::events::{DisplaySink, LineTag};
use tcu_logger_lib::io::serial::list_serial_ports;
use tcu_logger_lib::session::IdentityStrategy;
use tcu_logger_lib::settings::load_settings;
use tcu_logger_lib::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "tcu-logger", version, about = "Capture and validate telematics units over serial")]
struct Cli {
    /// Settings file (default: platform config dir)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Root directory for capture logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Only probe ports whose name contains this text
    #[arg(long)]
    port_filter: Option<String>,

    /// Do not run the configuration validator
    #[arg(long)]
    no_validate: bool,

    /// Scan for the IMEI without sending identity requests
    #[arg(long)]
    passive_identity: bool,

    /// Print the serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Print timestamps on device lines
    #[arg(long, short)]
    verbose: bool,
}

/// Terminal display: coloured device lines and a title showing the link state.
struct ConsoleSink {
    out: std::io::Stdout,
    verbose: bool,
}

fn tag_colour(tag: LineTag) -> Color {
    match tag {
        LineTag::Ais => Color::DarkBlue,
        LineTag::Cvp => Color::Blue,
        LineTag::Can | LineTag::Fot => Color::Magenta,
        LineTag::Net => Color::Green,
        LineTag::Pla => Color::Yellow,
    }
}

impl DisplaySink for ConsoleSink {
    fn on_line(&mut self, text: &str) {
        let text = if self.verbose {
            format!("{} {}", chrono::Local::now().format("%H:%M:%S%.3f"), text)
        } else {
            text.to_string()
        };
        let _ = match LineTag::detect(&text) {
            Some(tag) => writeln!(self.out, "{}", style(&text).with(tag_colour(tag))),
            None => writeln!(self.out, "{}", text),
        };
    }

    fn on_status(&mut self, connected: bool, port_name: Option<&str>) {
        let title = match (connected, port_name) {
            (true, Some(port)) => format!("TCU Logger (Connected to {})", port),
            _ => "TCU Logger (Disconnected)".to_string(),
        };
        let _ = crossterm::execute!(self.out, SetTitle(&title));
        let _ = writeln!(self.out, "{}", style(&title).bold());
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_ports {
        return match list_serial_ports() {
            Ok(ports) => {
                for p in ports {
                    let usb = match (p.vid, p.pid) {
                        (Some(vid), Some(pid)) => format!(" {:04x}:{:04x}", vid, pid),
                        _ => String::new(),
                    };
                    println!(
                        "{}\t{}{}\t{}",
                        p.port_name,
                        p.port_type,
                        usb,
                        p.product.unwrap_or_default()
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("tcu-logger: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let mut settings = match load_settings(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("tcu-logger: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = cli.log_dir {
        settings.log_dir = dir;
    }
    if let Some(filter) = cli.port_filter {
        settings.port_filter = Some(filter);
    }
    if cli.passive_identity {
        settings.identity.strategy = IdentityStrategy::Passive;
    }

    let sink = ConsoleSink {
        out: std::io::stdout(),
        verbose: cli.verbose,
    };
    let options = RunOptions {
        settings,
        validate: !cli.no_validate,
    };
    match tcu_logger_lib::run(options, Box::new(sink)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tcu-logger: {}", e);
            ExitCode::FAILURE
        }
    }
}
