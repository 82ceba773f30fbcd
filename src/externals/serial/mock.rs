//! In-process stand-in for the platform driver and the physical link.

use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::config::LinkSettings;

use super::services::{DeviceDriver, DeviceInfo, OpenLink, SessionError};

pub fn mock_device() -> DeviceInfo {
    DeviceInfo {
        port_name: "/dev/ttyMOCK0".into(),
        vendor_id: Some(0x0483),
        product_id: Some(0x5740),
        product: Some("STM32 Virtual ComPort".into()),
        serial_number: Some("1324".into()),
    }
}

pub struct MockDriver {
    devices: Vec<DeviceInfo>,
    authorized: AtomicBool,
    fail_open: AtomicBool,
    write_delay: Arc<Mutex<Duration>>,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    pub permission_requests: AtomicUsize,
    pub opens: AtomicUsize,
}

impl MockDriver {
    pub fn new(devices: Vec<DeviceInfo>, authorized: bool) -> Self {
        Self {
            devices,
            authorized: AtomicBool::new(authorized),
            fail_open: AtomicBool::new(false),
            write_delay: Arc::new(Mutex::new(Duration::ZERO)),
            inbound: Mutex::new(None),
            written: Arc::new(Mutex::new(vec![])),
            permission_requests: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    /// One authorized device.
    pub fn authorized() -> Self {
        Self::new(vec![mock_device()], true)
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Bytes arriving from the device.
    pub fn push(&self, bytes: &[u8]) {
        if let Some(sender) = self.inbound.lock().as_ref() {
            let _ = sender.send(bytes.to_vec());
        }
    }

    /// Simulate the cable being pulled: the reader sees end of stream.
    pub fn unplug(&self) {
        self.inbound.lock().take();
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }
}

impl DeviceDriver for MockDriver {
    fn discover(&self) -> Result<Vec<DeviceInfo>, SessionError> {
        Ok(self.devices.clone())
    }

    fn has_permission(&self, _device: &DeviceInfo) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    fn request_permission(&self, _device: &DeviceInfo) {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn open(
        &self,
        device: &DeviceInfo,
        _settings: &LinkSettings,
    ) -> Result<OpenLink, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::Open {
                port: device.port_name.clone(),
                source: io::Error::new(io::ErrorKind::Other, "Device busy."),
            });
        }

        let (sender, receiver) = mpsc::channel();
        *self.inbound.lock() = Some(sender);
        Ok(OpenLink {
            reader: Box::new(MockReader {
                receiver,
                pending: vec![],
            }),
            writer: Box::new(MockWriter {
                written: self.written.clone(),
                delay: self.write_delay.clone(),
            }),
        })
    }
}

struct MockReader {
    receiver: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.receiver.recv_timeout(Duration::from_millis(10)) {
                Ok(bytes) => self.pending = bytes,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "Read timed out."))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let count = self.pending.len().min(buf.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);
        Ok(count)
    }
}

struct MockWriter {
    written: Arc<Mutex<Vec<u8>>>,
    delay: Arc<Mutex<Duration>>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
