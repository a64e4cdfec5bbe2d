// src/io/error.rs
//
// Typed errors for serial transport and capture file handling.
// None of these are fatal: callers log them and retry on the next cycle.

use std::path::PathBuf;

use thiserror::Error;

/// Serial transport and capture-file errors.
#[derive(Error, Debug)]
pub enum IoError {
    /// Port could not be opened (busy, permission denied, vanished)
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    /// Port enumeration failed
    #[error("port enumeration failed: {0}")]
    Enumerate(String),

    /// Handle already closed (session torn down)
    #[error("{0}: port is closed")]
    Closed(String),

    /// Capture file could not be opened, written, or removed
    #[error("log file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IoError {
    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn closed(device: &str) -> Self {
        IoError::Closed(device.to_string())
    }

    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IoError::File {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_device() {
        let e = IoError::connection("/dev/ttyUSB0", "Device or resource busy");
        assert_eq!(
            e.to_string(),
            "/dev/ttyUSB0: connection failed: Device or resource busy"
        );

        let e = IoError::closed("/dev/ttyUSB1");
        assert_eq!(e.to_string(), "/dev/ttyUSB1: port is closed");
    }

    #[test]
    fn test_file_error_includes_path() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e = IoError::file("/var/log/x.log", source);
        assert!(e.to_string().starts_with("log file /var/log/x.log"));
    }
}
