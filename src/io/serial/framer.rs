// src/io/serial/framer.rs
//
// Line framing for device diagnostic output.
// Turns arbitrarily chunked serial reads into complete text lines with
// terminal control sequences removed.

// =============================================================================
// Control Bytes
// =============================================================================

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;
const LF: u8 = b'\n';
const CR: u8 = b'\r';
const TAB: u8 = b'\t';
const DEL: u8 = 0x7F;

/// Default cap on a single line before it is force-split.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

// =============================================================================
// Escape Parser State
// =============================================================================

/// Position inside a terminal escape sequence.
/// Persists across `feed` calls so a sequence split between two reads is
/// still removed in full.
#[derive(Debug, Clone, Copy, PartialEq)]
enum EscapeState {
    /// Plain text
    Ground,
    /// Saw ESC, waiting for the introducer
    Escape,
    /// Inside `ESC` intermediate ... final byte (`ESC ( B`, `ESC # 8`)
    EscapeIntermediate,
    /// Inside `ESC [` ... final byte
    Csi,
    /// Inside `ESC ]` ... BEL or `ESC \`
    Osc,
    /// Saw ESC inside an OSC string (possible string terminator)
    OscEscape,
}

// =============================================================================
// Line Framer
// =============================================================================

/// Stateful line framer for a framing-free text stream.
///
/// Bytes are buffered until a line feed arrives. Only complete lines are
/// returned; a trailing partial line waits for the next call. The output is
/// identical for any chunking of the same input.
pub struct LineFramer {
    buffer: Vec<u8>,
    state: EscapeState,
    max_length: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl LineFramer {
    /// Create a framer that force-splits lines longer than `max_length` bytes.
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::with_capacity(256),
            state: EscapeState::Ground,
            max_length: max_length.max(1),
        }
    }

    /// Feed raw bytes into the framer.
    /// Returns every line completed by this chunk, in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            match self.state {
                EscapeState::Ground => match byte {
                    ESC => self.state = EscapeState::Escape,
                    LF => {
                        if let Some(line) = self.take_line() {
                            lines.push(line);
                        }
                    }
                    // Keep tabs; drop CR and every other C0 control
                    TAB => self.push(byte, &mut lines),
                    CR | DEL => {}
                    b if b < 0x20 => {}
                    _ => self.push(byte, &mut lines),
                },
                EscapeState::Escape => {
                    self.state = match byte {
                        b'[' => EscapeState::Csi,
                        b']' => EscapeState::Osc,
                        0x20..=0x2F => EscapeState::EscapeIntermediate,
                        // Two-byte sequence (ESC 7, ESC c, ...) ends here
                        _ => EscapeState::Ground,
                    };
                }
                EscapeState::EscapeIntermediate => match byte {
                    0x20..=0x2F => {}
                    LF => {
                        self.state = EscapeState::Ground;
                        if let Some(line) = self.take_line() {
                            lines.push(line);
                        }
                    }
                    _ => self.state = EscapeState::Ground,
                },
                EscapeState::Csi => {
                    // Parameter and intermediate bytes are 0x20..=0x3F
                    if (0x40..=0x7E).contains(&byte) {
                        self.state = EscapeState::Ground;
                    } else if byte == LF {
                        // Malformed sequence: never swallow a line break
                        self.state = EscapeState::Ground;
                        if let Some(line) = self.take_line() {
                            lines.push(line);
                        }
                    }
                }
                EscapeState::Osc => match byte {
                    BEL => self.state = EscapeState::Ground,
                    ESC => self.state = EscapeState::OscEscape,
                    LF => {
                        self.state = EscapeState::Ground;
                        if let Some(line) = self.take_line() {
                            lines.push(line);
                        }
                    }
                    _ => {}
                },
                EscapeState::OscEscape => {
                    self.state = if byte == b'\\' {
                        EscapeState::Ground
                    } else {
                        EscapeState::Osc
                    };
                }
            }
        }

        lines
    }

    /// Flush any remaining buffered text as a final line.
    /// Call when the stream ends; the line may be incomplete.
    pub fn flush(&mut self) -> Option<String> {
        self.state = EscapeState::Ground;
        self.take_line()
    }

    /// Bytes currently held waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn push(&mut self, byte: u8, lines: &mut Vec<String>) {
        self.buffer.push(byte);
        // Force split on max length
        if self.buffer.len() >= self.max_length {
            if let Some(line) = self.take_line() {
                lines.push(line);
            }
        }
    }

    /// Decode the buffer, tolerating malformed UTF-8, and reset it.
    /// Blank lines are dropped.
    fn take_line(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}
