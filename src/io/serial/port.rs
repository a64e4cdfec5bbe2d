// src/io/serial/port.rs
//
// serialport-backed implementation of the transport traits.

use std::io::{Read, Write};

use serde::Serialize;
use serialport::SerialPort;

use super::utils::SerialSettings;
use crate::io::{IoError, SerialLink, SerialTransport};

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List available serial ports with USB details.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports().map_err(|e| IoError::Enumerate(e.to_string()))?;

    Ok(ports
        .into_iter()
        .filter(|p| usable_port_name(&p.port_name))
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

fn usable_port_name(_name: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        !_name.starts_with("/dev/tty.")
    }
    #[cfg(not(target_os = "macos"))]
    {
        true
    }
}

/// The host's real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransport;

impl SerialTransport for SystemTransport {
    fn list_ports(&self) -> Result<Vec<String>, IoError> {
        let ports = serialport::available_ports().map_err(|e| IoError::Enumerate(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| p.port_name)
            .filter(|name| usable_port_name(name))
            .collect())
    }

    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, IoError> {
        let handle = settings
            .builder(port)
            .open()
            .map_err(|e| IoError::connection(port, e.to_string()))?;
        Ok(Box::new(SystemLink {
            name: port.to_string(),
            port: handle,
        }))
    }
}

/// An open serialport handle.
pub struct SystemLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> Result<usize, IoError> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| IoError::connection(&self.name, e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(IoError::from)
    }

    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, IoError> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| IoError::connection(&self.name, e.to_string()))?;
        Ok(Box::new(SystemLink {
            name: self.name.clone(),
            port,
        }))
    }
}
