//! Scripted mock device for protocol tests.
//!
//! The mock replays a script of incoming symbols and timeouts while
//! capturing everything the engine transmits. Because the bus is
//! electrically half-duplex, every sent symbol is echoed back into the
//! receive path by default; an echo override queue allows a test to model
//! lost arbitration (a foreign address byte wins the wired-AND).

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::device::Device;

/// One step of the receive script.
#[derive(Debug, Clone, Copy)]
pub enum MockStep {
    /// Deliver this symbol.
    Byte(u8),
    /// Report a receive timeout.
    Timeout,
}

#[derive(Default)]
struct MockInner {
    rx: VecDeque<MockStep>,
    tx: Vec<u8>,
    echo_overrides: VecDeque<u8>,
    send_errors: u32,
    open: bool,
}

/// A scripted in-memory [`Device`].
#[derive(Clone, Default)]
pub struct MockDevice {
    inner: Arc<Mutex<MockInner>>,
}

impl MockDevice {
    pub fn new() -> Self {
        let mock = MockDevice::default();
        mock.inner.lock().unwrap().open = true;
        mock
    }

    /// Queue symbols to be received by the engine.
    pub fn queue_rx(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.rx.extend(data.iter().map(|&b| MockStep::Byte(b)));
    }

    /// Queue a receive timeout.
    pub fn queue_timeout(&self) {
        self.inner.lock().unwrap().rx.push_back(MockStep::Timeout);
    }

    /// Replace the echo of the next sent symbol, modelling another master
    /// winning arbitration.
    pub fn override_next_echo(&self, value: u8) {
        self.inner.lock().unwrap().echo_overrides.push_back(value);
    }

    /// Fail the next `count` send operations.
    pub fn fail_sends(&self, count: u32) {
        self.inner.lock().unwrap().send_errors = count;
    }

    /// Returns everything the engine transmitted so far.
    pub fn tx_data(&self) -> Vec<u8> {
        self.inner.lock().unwrap().tx.clone()
    }

    /// Returns the number of unconsumed receive steps.
    pub fn rx_remaining(&self) -> usize {
        self.inner.lock().unwrap().rx.len()
    }

    /// Drop all queued steps and captured data.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rx.clear();
        inner.tx.clear();
        inner.echo_overrides.clear();
    }
}

impl Device for MockDevice {
    fn open(&mut self) -> Result<()> {
        self.inner.lock().unwrap().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().open = false;
    }

    fn is_valid(&mut self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn send(&mut self, value: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::Device("not open".into()));
        }
        if inner.send_errors > 0 {
            inner.send_errors -= 1;
            return Err(Error::Send);
        }
        inner.tx.push(value);
        let echo = inner.echo_overrides.pop_front().unwrap_or(value);
        inner.rx.push_front(MockStep::Byte(echo));
        Ok(())
    }

    fn recv(&mut self, _timeout_us: u64) -> Result<u8> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::Device("not open".into()));
        }
        match inner.rx.pop_front() {
            Some(MockStep::Byte(b)) => Ok(b),
            Some(MockStep::Timeout) | None => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_of_sent_symbols() {
        let mut mock = MockDevice::new();
        mock.queue_rx(&[0x55]);
        mock.send(0x31).unwrap();
        assert_eq!(mock.recv(1000), Ok(0x31));
        assert_eq!(mock.recv(1000), Ok(0x55));
        assert_eq!(mock.recv(1000), Err(Error::Timeout));
        assert_eq!(mock.tx_data(), vec![0x31]);
    }

    #[test]
    fn test_echo_override() {
        let mut mock = MockDevice::new();
        mock.override_next_echo(0x10);
        mock.send(0x31).unwrap();
        assert_eq!(mock.recv(1000), Ok(0x10));
    }
}
