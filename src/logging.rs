// src/logging.rs
//
// Application diagnostics: `tlog!` stamps every message with local
// `HH:MM:SS.mmm`, prints it to stderr, and appends it to the application log
// once `init_file_logging` has run. Device output never goes here; it goes to
// the capture logs owned by each session.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::io::IoError;

/// Symlink kept pointing at the newest application log (Unix).
const LATEST_LOG_LINK: &str = "tcu-logger.log";

struct AppLog {
    path: PathBuf,
    file: File,
}

static APP_LOG: Mutex<Option<AppLog>> = Mutex::new(None);

fn app_log() -> MutexGuard<'static, Option<AppLog>> {
    APP_LOG.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn timestamp() -> impl std::fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write one stamped message. Called by `tlog!`.
pub(crate) fn emit(message: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", timestamp(), message);
    eprintln!("{}", line);
    if let Some(log) = app_log().as_mut() {
        let _ = writeln!(log.file, "{}", line);
    }
}

/// Start appending diagnostics to a new timestamped file in `reports_dir`.
/// Returns the file's path. A previous application log is closed.
pub fn init_file_logging(reports_dir: &Path) -> Result<PathBuf, IoError> {
    std::fs::create_dir_all(reports_dir).map_err(|e| IoError::file(reports_dir, e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-tcu-logger.log")
        .to_string();
    let path = reports_dir.join(&filename);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| IoError::file(&path, e))?;

    #[cfg(unix)]
    {
        let link = reports_dir.join(LATEST_LOG_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("{} [logging] Could not update {}: {}", timestamp(), LATEST_LOG_LINK, e);
        }
    }

    *app_log() = Some(AppLog {
        path: path.clone(),
        file,
    });
    eprintln!("{} [logging] Application log: {}", timestamp(), path.display());
    Ok(path)
}

/// Path of the current application log, if file logging is on.
pub fn app_log_path() -> Option<PathBuf> {
    app_log().as_ref().map(|log| log.path.clone())
}

/// Close the application log. Idempotent.
pub fn stop_file_logging() {
    if let Some(mut log) = app_log().take() {
        let _ = log.file.flush();
        eprintln!("{} [logging] Application log closed", timestamp());
    }
}

/// Timestamped diagnostic line to stderr and the application log.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}
