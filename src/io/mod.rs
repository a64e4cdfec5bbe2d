// src/io/mod.rs
//
// Serial transport abstraction.
// The monitor and sessions talk to ports through `SerialTransport` and
// `SerialLink` so that the real serialport backend and in-memory test ports
// are interchangeable.

mod error;
pub mod serial;

#[cfg(test)]
pub(crate) mod fake;

pub use error::IoError;
pub use serial::{LineFramer, SerialSettings, SystemTransport};

/// An open serial port handle.
///
/// Reading and writing are independent directions: the reader thread owns one
/// handle and writers share a cloned one.
pub trait SerialLink: Send {
    /// Port name this handle was opened on.
    fn name(&self) -> &str;

    /// Bytes waiting in the receive buffer, without blocking.
    fn bytes_available(&mut self) -> Result<usize, IoError>;

    /// Read into `buf`, blocking at most the configured read timeout.
    /// A timeout surfaces as `ErrorKind::TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write all of `data` and flush.
    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError>;

    /// Second handle to the same port, used for the write direction.
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, IoError>;
}

/// Port enumeration and opening.
pub trait SerialTransport: Send + Sync {
    /// Names of the ports currently present.
    fn list_ports(&self) -> Result<Vec<String>, IoError>;

    /// Open `port` with the given line settings.
    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, IoError>;
}
