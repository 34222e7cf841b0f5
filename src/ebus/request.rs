//! Bus requests.
//!
//! A [`BusRequest`] couples the escaped master data to send with a
//! completion disposition: *active* requests are pushed by client threads
//! which wait for the result, *poll* and *scan* requests are created and
//! consumed by the engine itself and vanish on completion.

use crate::catalog::field::{OutputOpts, PartType};
use crate::catalog::message::Message;
use crate::catalog::MessageMap;
use crate::ebus::symbol::SymbolString;
use crate::error::{Error, Result};
use log::{error, info};
use std::collections::VecDeque;
use std::sync::Arc;

/// Callbacks a scan request reports its progress through.
pub trait ScanSink {
    /// Set the scan result string for a slave (empty marks a started scan).
    fn set_scan_result(&self, dst_address: u8, result: String);
    /// Called when the whole scan sequence ended.
    fn set_scan_finished(&self);
    /// Broadcast a decoded update to listening clients.
    fn notify_update(&self, circuit: &str, name: &str, data: &str);
}

/// The completion disposition of a request.
pub enum RequestKind {
    /// A client waits for the result.
    Active {
        /// The outcome, delivered through the finished queue.
        result: Result<()>,
        /// The unescaped slave data received.
        slave: SymbolString,
    },
    /// Catalog-driven background poll, self-deleting.
    Poll { message: Arc<Message>, index: usize },
    /// Slave discovery sequence, self-deleting.
    Scan(ScanState),
}

/// The progress of a scan across slaves and scan messages.
pub struct ScanState {
    /// All secondary scan messages (the identification message first).
    all_messages: Vec<Arc<Message>>,
    /// Messages still to run for the current slave.
    remaining: VecDeque<Arc<Message>>,
    /// The message currently on the bus.
    current: Arc<Message>,
    /// Slaves still to scan (front = current).
    slaves: VecDeque<u8>,
    /// Part index within the current (possibly chained) message.
    index: usize,
    /// Aggregated textual result for the current slave.
    result: String,
}

/// A request to be executed on the bus.
pub struct BusRequest {
    pub id: u64,
    /// The escaped master data including CRC.
    pub master: SymbolString,
    /// How often arbitration was lost for this request so far.
    pub bus_lost_retries: u32,
    pub kind: RequestKind,
}

impl BusRequest {
    /// Create an active request for the prepared master data.
    pub fn new_active(id: u64, master: SymbolString) -> Box<BusRequest> {
        Box::new(BusRequest {
            id,
            master,
            bus_lost_retries: 0,
            kind: RequestKind::Active { result: Err(Error::NoSignal), slave: SymbolString::new(false) },
        })
    }

    /// Create a poll request for the message.
    pub fn new_poll(id: u64, message: Arc<Message>, own_master: u8) -> Result<Box<BusRequest>> {
        let master = message.prepare_master(own_master, "", None, 0)?;
        info!("bus: poll cmd: {}", master.data_str(true, true));
        Ok(Box::new(BusRequest {
            id,
            master,
            bus_lost_retries: 0,
            kind: RequestKind::Poll { message, index: 0 },
        }))
    }

    /// Create a scan request over the given slaves and scan messages (the
    /// identification message first).
    pub fn new_scan(
        id: u64,
        messages: Vec<Arc<Message>>,
        slaves: VecDeque<u8>,
        own_master: u8,
        sink: &dyn ScanSink,
    ) -> Result<Box<BusRequest>> {
        let mut remaining: VecDeque<Arc<Message>> = messages.iter().cloned().collect();
        let current = remaining.pop_front().ok_or(Error::NotFound)?;
        let mut request = Box::new(BusRequest {
            id,
            master: SymbolString::new(true),
            bus_lost_retries: 0,
            kind: RequestKind::Scan(ScanState {
                all_messages: messages,
                remaining,
                current,
                slaves,
                index: 0,
                result: String::new(),
            }),
        });
        request.prepare_scan(own_master, sink)?;
        Ok(request)
    }

    /// Whether the engine owns and disposes of this request itself.
    pub fn is_self_deleting(&self) -> bool {
        !matches!(self.kind, RequestKind::Active { .. })
    }

    /// Prepare the master data for the next scan step.
    fn prepare_scan(&mut self, own_master: u8, sink: &dyn ScanSink) -> Result<()> {
        let RequestKind::Scan(scan) = &mut self.kind else {
            return Err(Error::InvalidArg);
        };
        let Some(&dst_address) = scan.slaves.front() else {
            return Err(Error::Eof);
        };
        if scan.index == 0 && scan.remaining.len() + 1 == scan.all_messages.len() {
            // first message for this slave
            sink.set_scan_result(dst_address, String::new());
        }
        self.master = scan.current.prepare_master(own_master, "", Some(dst_address), scan.index)?;
        info!("bus: scan {dst_address:02x} cmd: {}", self.master.data_str(true, true));
        Ok(())
    }

    /// Record the outcome of one bus transaction for this request.
    /// Returns true when the request wants to go on the bus again.
    pub fn notify(
        &mut self,
        result: Result<()>,
        slave: &SymbolString,
        messages: &mut MessageMap,
        sink: &dyn ScanSink,
    ) -> bool {
        if matches!(self.kind, RequestKind::Scan(_)) {
            return self.notify_scan(result, slave, messages, sink);
        }
        match &mut self.kind {
            RequestKind::Active { result: stored, slave: stored_slave } => {
                if result.is_ok() {
                    log::debug!("bus: read res: {}", slave.data_str(true, true));
                }
                *stored = result;
                stored_slave.clear();
                let _ = stored_slave.add_all(slave);
                false
            }
            RequestKind::Poll { message, index } => {
                let mut result = result;
                if result.is_ok() {
                    result = message
                        .store_last_data(PartType::Slave, slave, *index)
                        .map(|_| ());
                    if result.is_ok() && *index + 1 < message.count() {
                        *index += 1;
                        let own_master = self.master.at(0);
                        match message.prepare_master(own_master, "", None, *index) {
                            Ok(master) => {
                                self.master = master;
                                return true;
                            }
                            Err(e) => result = Err(e),
                        }
                    }
                }
                let decoded = result.and_then(|()| {
                    message.decode_last_data(OutputOpts::default(), None, -1)
                });
                match decoded {
                    Ok(data) => {
                        info!("bus: poll {} {}: {data}", message.circuit(), message.name());
                        sink.notify_update(message.circuit(), message.name(), &data);
                    }
                    Err(e) => {
                        error!("bus: poll {} {} failed: {e}", message.circuit(), message.name());
                    }
                }
                false
            }
            RequestKind::Scan(_) => unreachable!("handled above"),
        }
    }

    fn notify_scan(
        &mut self,
        result: Result<()>,
        slave: &SymbolString,
        messages: &mut MessageMap,
        sink: &dyn ScanSink,
    ) -> bool {
        let own_master = self.master.at(0);
        let dst_address = master_dst(&self.master);
        let RequestKind::Scan(scan) = &mut self.kind else {
            return false;
        };
        let mut result = result;
        if result.is_ok() {
            if messages.is_scan_message(&scan.current) && scan.current.dst_address() != dst_address
            {
                // move the result onto the per-address clone
                if let Some(clone) = messages.get_scan_message(Some(dst_address)) {
                    scan.current = clone;
                    // rebuild the master cache for the clone from our own data
                    let mut master = SymbolString::new(false);
                    for i in 0..self.master.len() {
                        let _ = master.push_back(self.master.at(i), true, false);
                    }
                    let _ = scan.current.store_last_data(PartType::Master, &master, scan.index);
                }
            }
            result = scan
                .current
                .store_last_data(PartType::Slave, slave, scan.index)
                .map(|_| ());
            if result.is_ok() && scan.index + 1 < scan.current.count() {
                scan.index += 1;
                drop(scan);
                if self.prepare_scan(own_master, sink).is_ok() {
                    return true;
                }
                sink.set_scan_finished();
                return false;
            }
            if result.is_ok() {
                match scan.current.decode_last_data(OutputOpts { verbose: false, numeric: false }, None, -1)
                {
                    Ok(decoded) => {
                        if !scan.result.is_empty() {
                            scan.result.push(';');
                        }
                        // strip the field name prefixes for the aggregate
                        for (i, part) in decoded.split(';').enumerate() {
                            if i > 0 {
                                scan.result.push(';');
                            }
                            scan.result.push_str(part.split_once('=').map_or(part, |(_, v)| v));
                        }
                    }
                    Err(e) => result = Err(e),
                }
            }
        }
        if let Err(e) = &result {
            scan.slaves.pop_front();
            if *e == Error::Timeout {
                info!("bus: scan {dst_address:02x} timed out ({} slaves left)", scan.slaves.len());
            } else {
                error!("bus: scan {dst_address:02x} failed ({} slaves left): {e}", scan.slaves.len());
            }
            scan.remaining.clear();
        } else if scan.remaining.is_empty() {
            scan.slaves.pop_front();
            info!("bus: scan {dst_address:02x} completed ({} slaves left)", scan.slaves.len());
        }
        if scan.remaining.is_empty() {
            // last message for this slave
            sink.set_scan_result(dst_address, scan.result.clone());
        }
        if scan.slaves.is_empty() {
            info!("bus: scan finished");
            sink.set_scan_finished();
            return false;
        }
        if scan.remaining.is_empty() {
            scan.remaining = scan.all_messages.iter().cloned().collect();
            scan.result.clear();
        }
        scan.index = 0;
        scan.current = scan.remaining.pop_front().expect("scan messages never empty");
        if self.prepare_scan(own_master, sink).is_err() {
            sink.set_scan_finished();
            return false;
        }
        true
    }
}

/// The destination address of an escaped master buffer (the header bytes
/// are never escaped).
fn master_dst(master: &SymbolString) -> u8 {
    master.at(1)
}
