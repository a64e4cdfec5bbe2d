// src/io/fake.rs
//
// In-memory serial ports for tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{IoError, SerialLink, SerialSettings, SerialTransport};

type Responder = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// A simulated device on one port.
pub(crate) struct FakeDevice {
    pub name: String,
    inbound: Mutex<VecDeque<u8>>,
    written: Mutex<Vec<u8>>,
    responder: Mutex<Option<Responder>>,
    pub open_handles: AtomicUsize,
    pub opens: AtomicUsize,
}

impl FakeDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(FakeDevice {
            name: name.to_string(),
            inbound: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            open_handles: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        })
    }

    /// Queue bytes for the host to read.
    pub fn emit(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes.iter().copied());
    }

    pub fn emit_line(&self, line: &str) {
        self.emit(format!("{}\r\n", line).as_bytes());
    }

    /// Reply to each written command line with the returned lines.
    pub fn respond_with(&self, f: impl Fn(&str) -> Vec<String> + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Every command line written by the host, in order.
    pub fn commands(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn accept_write(&self, data: &[u8]) {
        self.written.lock().unwrap().extend_from_slice(data);
        let text = String::from_utf8_lossy(data).to_string();
        let replies: Vec<String> = match &*self.responder.lock().unwrap() {
            Some(f) => text.lines().flat_map(|l| f(l)).collect(),
            None => Vec::new(),
        };
        for reply in replies {
            self.emit_line(&reply);
        }
    }
}

/// Handle onto a `FakeDevice`.
pub(crate) struct FakeLink {
    device: Arc<FakeDevice>,
}

impl FakeLink {
    pub fn new(device: Arc<FakeDevice>) -> Self {
        device.open_handles.fetch_add(1, Ordering::SeqCst);
        FakeLink { device }
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.device.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SerialLink for FakeLink {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn bytes_available(&mut self) -> Result<usize, IoError> {
        Ok(self.device.inbound.lock().unwrap().len())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = {
            let mut inbound = self.device.inbound.lock().unwrap();
            let n = inbound.len().min(buf.len());
            for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
                *slot = byte;
            }
            n
        };
        if n == 0 {
            std::thread::sleep(Duration::from_millis(2));
            return Err(std::io::ErrorKind::TimedOut.into());
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.device.accept_write(data);
        Ok(())
    }

    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, IoError> {
        Ok(Box::new(FakeLink::new(self.device.clone())))
    }
}

/// A set of fake ports that tests can plug and unplug.
#[derive(Default)]
pub(crate) struct FakeTransport {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    busy: Mutex<HashSet<String>>,
}

impl FakeTransport {
    pub fn plug(&self, device: Arc<FakeDevice>) {
        self.devices.lock().unwrap().push(device);
    }

    pub fn unplug(&self, name: &str) {
        self.devices.lock().unwrap().retain(|d| d.name != name);
    }

    /// Make `open` fail for `name`.
    pub fn set_busy(&self, name: &str) {
        self.busy.lock().unwrap().insert(name.to_string());
    }
}

impl SerialTransport for FakeTransport {
    fn list_ports(&self) -> Result<Vec<String>, IoError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.name.clone())
            .collect())
    }

    fn open(&self, port: &str, _settings: &SerialSettings) -> Result<Box<dyn SerialLink>, IoError> {
        if self.busy.lock().unwrap().contains(port) {
            return Err(IoError::connection(port, "Device or resource busy"));
        }
        let device = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.name == port)
            .cloned()
            .ok_or_else(|| IoError::connection(port, "No such file or directory"))?;
        device.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeLink::new(device)))
    }
}
