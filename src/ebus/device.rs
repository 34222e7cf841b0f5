//! Serial line access to the bus.
//!
//! The [`Device`] trait is the byte-oriented contract the bus handler works
//! against: blocking single-byte send/recv with microsecond timeouts, an
//! is-valid probe, and re-open after loss. [`SerialDevice`] drives a local
//! serial port at 2400 Bd 8N1, [`NetworkDevice`] a TCP-attached adapter.
//!
//! Raw-byte trace logging and the binary dump file are passthrough taps on
//! send/recv, toggled through shared [`RawControl`] flags so that client
//! threads can flip them while the bus worker owns the device.

use crate::constants::ESC;
use crate::error::{Error, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared on/off switches of the raw taps.
#[derive(Debug, Default)]
pub struct RawControl {
    log_raw: AtomicBool,
    dump_raw: AtomicBool,
}

impl RawControl {
    pub fn new() -> Arc<RawControl> {
        Arc::new(RawControl::default())
    }

    pub fn set_log_raw(&self, enable: bool) {
        self.log_raw.store(enable, Ordering::Relaxed);
    }

    pub fn log_raw(&self) -> bool {
        self.log_raw.load(Ordering::Relaxed)
    }

    pub fn set_dump_raw(&self, enable: bool) {
        self.dump_raw.store(enable, Ordering::Relaxed);
    }

    pub fn dump_raw(&self) -> bool {
        self.dump_raw.load(Ordering::Relaxed)
    }
}

/// Byte-oriented access to the bus with deterministic timeouts.
pub trait Device: Send {
    /// Open the underlying device. Safe to call again after a prior close
    /// or fault.
    fn open(&mut self) -> Result<()>;

    /// Close the underlying device.
    fn close(&mut self);

    /// Returns whether the device is open and usable.
    fn is_valid(&mut self) -> bool;

    /// The device name as given at construction.
    fn name(&self) -> &str;

    /// Write a single symbol to the bus.
    fn send(&mut self, value: u8) -> Result<()>;

    /// Read the next symbol from the bus, waiting at most `timeout_us`
    /// microseconds.
    fn recv(&mut self, timeout_us: u64) -> Result<u8>;

    /// Additional latency of the transfer in microseconds.
    fn latency(&self) -> u64 {
        0
    }
}

/// Raw logging / dump plumbing shared by the concrete devices.
struct RawTap {
    control: Arc<RawControl>,
    dump_file: Option<String>,
    dump_max_kb: u64,
    dump_stream: Option<File>,
    dump_size: u64,
}

impl RawTap {
    fn new(control: Arc<RawControl>) -> Self {
        RawTap { control, dump_file: None, dump_max_kb: 100, dump_stream: None, dump_size: 0 }
    }

    fn trace(&mut self, value: u8, received: bool) {
        if self.control.log_raw() {
            if received {
                debug!("bus: <{value:02x}");
            } else {
                debug!("bus: >{value:02x}");
            }
        }
        if received && self.control.dump_raw() && self.dump_file.is_some() {
            if self.dump_stream.is_none() {
                self.open_dump();
            }
            if let Some(stream) = self.dump_stream.as_mut() {
                if stream.write_all(&[value]).is_ok() {
                    self.dump_size += 1;
                    if self.dump_size % 1024 == 0 {
                        let _ = stream.flush();
                    }
                }
            }
            if self.dump_size >= self.dump_max_kb * 1024 {
                self.rotate();
            }
        } else if !self.control.dump_raw() && self.dump_stream.is_some() {
            self.dump_stream = None;
        }
    }

    fn rotate(&mut self) {
        let Some(path) = self.dump_file.clone() else {
            return;
        };
        self.dump_stream = None;
        let _ = std::fs::rename(&path, format!("{path}.old"));
        self.dump_size = 0;
        self.open_dump();
    }

    fn open_dump(&mut self) {
        if let Some(path) = &self.dump_file {
            self.dump_stream = OpenOptions::new().create(true).append(true).open(path).ok();
            self.dump_size = 0;
        }
    }

    fn set_dump_file(&mut self, path: Option<String>, max_size_kb: u64) {
        self.dump_stream = None;
        self.dump_file = path;
        self.dump_max_kb = max_size_kb;
    }
}

/// A local serial port carrying the bus at 2400 Bd 8N1.
pub struct SerialDevice {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    initial_send: bool,
    tap: RawTap,
}

impl SerialDevice {
    /// Creates a new unopened serial device.
    ///
    /// With `initial_send` set, a single ESC symbol is transmitted right
    /// after opening to wake adapters that require it.
    pub fn new(name: &str, initial_send: bool, control: Arc<RawControl>) -> Self {
        SerialDevice {
            name: name.to_string(),
            port: None,
            initial_send,
            tap: RawTap::new(control),
        }
    }

    /// Set the raw dump file path and maximum size in kB before rotation.
    pub fn set_dump_file(&mut self, path: Option<String>, max_size_kb: u64) {
        self.tap.set_dump_file(path, max_size_kb);
    }
}

impl Device for SerialDevice {
    fn open(&mut self) -> Result<()> {
        self.close();
        let port = serialport::new(&self.name, 2400)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| Error::Device(e.to_string()))?;
        let _ = port.clear(serialport::ClearBuffer::All);
        self.port = Some(port);
        if self.initial_send {
            self.send(ESC)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_valid(&mut self) -> bool {
        // a vanished USB adapter surfaces as an error on the next probe
        match self.port.as_mut() {
            Some(port) => {
                if port.bytes_to_read().is_err() {
                    self.port = None;
                    return false;
                }
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, value: u8) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| Error::Device("not open".into()))?;
        if port.write_all(&[value]).is_err() || port.flush().is_err() {
            return Err(Error::Send);
        }
        self.tap.trace(value, false);
        Ok(())
    }

    fn recv(&mut self, timeout_us: u64) -> Result<u8> {
        let port = self.port.as_mut().ok_or_else(|| Error::Device("not open".into()))?;
        port.set_timeout(Duration::from_micros(timeout_us.max(1)))
            .map_err(|e| Error::Device(e.to_string()))?;
        let mut buf = [0u8; 1];
        match port.read_exact(&mut buf) {
            Ok(()) => {
                self.tap.trace(buf[0], true);
                Ok(buf[0])
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(Error::Timeout),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Eof),
            Err(e) => {
                self.port = None;
                Err(Error::Device(e.to_string()))
            }
        }
    }
}

/// A TCP-attached bus adapter (`tcp:host:port` device strings).
pub struct NetworkDevice {
    name: String,
    addr: String,
    stream: Option<TcpStream>,
    initial_send: bool,
    tap: RawTap,
}

impl NetworkDevice {
    /// Network adapters buffer more than a local UART does.
    pub const LATENCY: u64 = 10_000;

    /// Creates a new unopened network device for `host:port`.
    pub fn new(name: &str, addr: &str, initial_send: bool, control: Arc<RawControl>) -> Self {
        NetworkDevice {
            name: name.to_string(),
            addr: addr.to_string(),
            stream: None,
            initial_send,
            tap: RawTap::new(control),
        }
    }
}

impl Device for NetworkDevice {
    fn open(&mut self) -> Result<()> {
        self.close();
        let stream = TcpStream::connect(&self.addr).map_err(|e| Error::Device(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| Error::Device(e.to_string()))?;
        self.stream = Some(stream);
        if self.initial_send {
            self.send(ESC)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn is_valid(&mut self) -> bool {
        self.stream.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, value: u8) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Device("not open".into()))?;
        if stream.write_all(&[value]).is_err() {
            self.stream = None;
            return Err(Error::Send);
        }
        self.tap.trace(value, false);
        Ok(())
    }

    fn recv(&mut self, timeout_us: u64) -> Result<u8> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Device("not open".into()))?;
        stream
            .set_read_timeout(Some(Duration::from_micros(timeout_us.max(1))))
            .map_err(|e| Error::Device(e.to_string()))?;
        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.stream = None;
                Err(Error::Eof)
            }
            Ok(_) => {
                self.tap.trace(buf[0], true);
                Ok(buf[0])
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Err(Error::Timeout)
            }
            Err(e) => {
                self.stream = None;
                Err(Error::Device(e.to_string()))
            }
        }
    }

    fn latency(&self) -> u64 {
        Self::LATENCY
    }
}

/// Create a device from its name: `tcp:host:port` and `host:port` yield a
/// [`NetworkDevice`], anything else a [`SerialDevice`].
pub fn create_device(
    name: &str,
    initial_send: bool,
    control: Arc<RawControl>,
    dump_file: Option<String>,
    dump_max_kb: u64,
) -> Box<dyn Device> {
    if !name.contains('/') && name.contains(':') {
        let addr = name.strip_prefix("tcp:").unwrap_or(name);
        let mut device = NetworkDevice::new(name, addr, initial_send, control);
        device.tap.set_dump_file(dump_file, dump_max_kb);
        Box::new(device)
    } else {
        let mut device = SerialDevice::new(name, initial_send, control);
        device.set_dump_file(dump_file, dump_max_kb);
        Box::new(device)
    }
}
