// src/io/serial/reader.rs
//
// Per-session serial reader.
// Runs blocking port reads on a dedicated thread, frames bytes into lines and
// hands every complete line to the owning session. The loop ends when the
// session stops, on EOF, or on a fatal read error.

use std::sync::Arc;
use std::thread::JoinHandle;

use super::framer::LineFramer;
use crate::io::SerialLink;
use crate::session::Session;

const READ_CHUNK: usize = 1024;

/// Start the reader thread for `session` over `link`.
pub fn spawn_reader(
    session: Arc<Session>,
    link: Box<dyn SerialLink>,
    max_line_length: usize,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("reader-{}", session.id());
    std::thread::Builder::new()
        .name(name)
        .spawn(move || run_reader_blocking(session, link, max_line_length))
}

fn run_reader_blocking(session: Arc<Session>, mut link: Box<dyn SerialLink>, max_line_length: usize) {
    let mut framer = LineFramer::new(max_line_length);
    let mut buf = [0u8; READ_CHUNK];

    tlog!(
        "[reader:{}] Reading {}",
        session.id(),
        link.name()
    );

    while session.is_active() {
        match link.read(&mut buf) {
            Ok(0) => {
                // EOF - port closed/disconnected
                tlog!("[reader:{}] {} reached EOF", session.id(), link.name());
                session.mark_lost();
                break;
            }
            Ok(n) => {
                for line in framer.feed(&buf[..n]) {
                    session.ingest_line(line);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout is expected for serial reads
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tlog!("[reader:{}] Read error on {}: {}", session.id(), link.name(), e);
                session.mark_lost();
                break;
            }
        }
    }

    if let Some(rest) = framer.flush() {
        session.ingest_line(rest);
    }
    tlog!("[reader:{}] Reader for {} exited", session.id(), link.name());
}
