// src/io/serial/utils.rs
//
// Line settings for the device link and their mapping onto the serialport crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, SerialPortBuilder, StopBits};

/// Fixed baud rate of the telematics unit's debug UART.
pub const DEVICE_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line settings used for both probing and capture.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Read timeout for a single blocking read, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEVICE_BAUD_RATE
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_read_timeout_ms() -> u64 {
    100
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Short `8N1`-style description for log lines.
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        format!("{} baud {}{}{}", self.baud_rate, self.data_bits, parity, self.stop_bits)
    }

    /// Build a serialport builder for `port` with these settings applied.
    pub fn builder(&self, port: &str) -> SerialPortBuilder {
        serialport::new(port, self.baud_rate)
            .data_bits(data_bits(self.data_bits))
            .stop_bits(stop_bits(self.stop_bits))
            .parity(SpParity::from(&self.parity))
            .timeout(self.read_timeout())
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

impl From<&Parity> for SpParity {
    fn from(p: &Parity) -> Self {
        match p {
            Parity::None => SpParity::None,
            Parity::Odd => SpParity::Odd,
            Parity::Even => SpParity::Even,
        }
    }
}

/// Unsupported widths fall back to 8.
fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> StopBits {
    if bits == 2 {
        StopBits::Two
    } else {
        StopBits::One
    }
}

// ============================================================================
// Tests
// ============================================================================
