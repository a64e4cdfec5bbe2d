// src/io/serial/mod.rs
//
// Serial port backend for the device link.
//
// Features:
// - Port enumeration and opening via the serialport crate
// - Line framing with terminal escape stripping
// - Blocking per-session reader thread feeding the session pipeline

pub mod framer;
pub mod port;
pub mod reader;
pub(crate) mod utils;

pub use framer::{LineFramer, DEFAULT_MAX_LINE_LENGTH};
pub use port::{list_serial_ports, SerialPortInfo, SystemTransport};
pub use reader::spawn_reader;
pub use utils::{Parity, SerialSettings, DEVICE_BAUD_RATE};
