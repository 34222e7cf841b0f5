//! The bus handler: state machine and request scheduler.
//!
//! A single worker thread owns the serial device and drives it
//! symbol-by-symbol through the states of the eBUS protocol. Client
//! threads interact with the worker only through the request queues
//! ([`BusHandler::send_and_wait`]) and the shared tables (participants,
//! scan results, grabbed messages).
//!
//! State transitions (simplified; every state falls back to `skip` on an
//! error and to `ready` on a received SYN):
//!
//! - `ready` → `send-cmd` after winning arbitration, or `recv-cmd` when
//!   another master starts a frame
//! - `send-cmd` → `recv-cmd-ack` (slave or master destination) or
//!   `send-syn` (broadcast)
//! - `recv-cmd` → `recv-cmd-ack` (or `send-cmd-ack` when we are addressed
//!   and answering)
//! - `recv-cmd-ack` → `recv-res` (slave destination), `send-syn` (our
//!   master-master transfer), or `skip`
//! - `recv-res` → `send-res-ack` (we are the master) or `recv-res-ack`
//! - `send-res-ack`/`recv-res-ack` → `send-syn`/`skip`, with a single
//!   repetition of the slave frame after NAK
//! - `send-cmd-ack` → `send-res` (we answer as slave) → `recv-res-ack`

use crate::catalog::field::OutputOpts;
use crate::catalog::MessageMap;
use crate::constants::{
    ACK, BROADCAST, ESC, NAK, SEND_TIMEOUT, SIGNAL_TIMEOUT, SCAN_ANSWER, SYMBOL_DURATION, SYN,
    SYN_TIMEOUT,
};
use crate::ebus::address::{is_master, is_valid_address, master_address, master_number};
use crate::ebus::device::Device;
use crate::ebus::queue::RequestQueue;
use crate::ebus::request::{BusRequest, RequestKind, ScanSink};
use crate::ebus::symbol::SymbolString;
use crate::error::{Error, Result};
use bitflags::bitflags;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

bitflags! {
    /// Per-address bits of the participant table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Seen: u8 {
        /// The address was observed on the bus.
        const SEEN = 0x01;
        /// A scan of the address was initiated.
        const SCAN_INIT = 0x02;
        /// A scan of the address yielded a result.
        const SCAN_DONE = 0x04;
        /// Configuration loading for the address was initiated.
        const LOAD_INIT = 0x08;
        /// Configuration for the address was loaded.
        const LOAD_DONE = 0x10;
    }
}

/// The possible bus states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// No signal on the bus.
    NoSignal,
    /// Skip all symbols until the next SYN.
    Skip,
    /// Ready for the next master (after a SYN).
    Ready,
    /// Receive command (ZZ, PB SB, master data).
    RecvCmd,
    /// Receive command ACK/NAK.
    RecvCmdAck,
    /// Receive response (slave data).
    RecvRes,
    /// Receive response ACK/NAK.
    RecvResAck,
    /// Send command (we won arbitration).
    SendCmd,
    /// Send response ACK/NAK (we are the requesting master).
    SendResAck,
    /// Send command ACK/NAK (we are the addressed slave).
    SendCmdAck,
    /// Send response (we are the addressed slave).
    SendRes,
    /// Send SYN after a completed transfer of ours.
    SendSyn,
}

impl BusState {
    fn code(&self) -> &'static str {
        match self {
            BusState::NoSignal => "no signal",
            BusState::Skip => "skip",
            BusState::Ready => "ready",
            BusState::RecvCmd => "receive command",
            BusState::RecvCmdAck => "receive command ACK",
            BusState::RecvRes => "receive response",
            BusState::RecvResAck => "receive response ACK",
            BusState::SendCmd => "send command",
            BusState::SendResAck => "send response ACK",
            BusState::SendCmdAck => "send command ACK",
            BusState::SendRes => "send response",
            BusState::SendSyn => "send SYN",
        }
    }
}

/// What to capture of observed telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabMode {
    None,
    Unknown,
    All,
}

/// Configuration of the bus handler.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Our own master address.
    pub own_master: u8,
    /// Whether to answer requests addressed to our own addresses.
    pub answer: bool,
    /// Number of times a send is repeated due to lost arbitration.
    pub bus_lost_retries: u32,
    /// Number of times a failed send is repeated (other than lost
    /// arbitration).
    pub failed_send_retries: u32,
    /// Additional transfer latency in microseconds.
    pub transfer_latency: u64,
    /// Maximum time in microseconds for bus acquisition.
    pub bus_acquire_timeout: u64,
    /// Maximum time in microseconds an addressed slave may take.
    pub slave_recv_timeout: u64,
    /// SYN symbols to wait before sending after lost arbitration,
    /// 0 for automatic detection from the master count.
    pub lock_count: u32,
    /// Whether to generate AUTO-SYN symbols on an idle bus.
    pub generate_syn: bool,
    /// Interval in seconds in which poll messages are cycled, 0 disables
    /// polling.
    pub poll_interval: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            own_master: crate::constants::OWN_MASTER_ADDRESS,
            answer: false,
            bus_lost_retries: crate::constants::BUS_LOST_RETRIES,
            failed_send_retries: crate::constants::FAILED_SEND_RETRIES,
            transfer_latency: 0,
            bus_acquire_timeout: crate::constants::BUS_ACQUIRE_TIMEOUT,
            slave_recv_timeout: crate::constants::SLAVE_RECV_TIMEOUT,
            lock_count: 0,
            generate_syn: false,
            poll_interval: crate::constants::POLL_INTERVAL,
        }
    }
}

/// Tables owned by the bus worker, snapshotted under a mutex for clients.
#[derive(Debug)]
pub struct BusShared {
    /// The participant table, one [`Seen`] entry per address byte.
    pub seen: [Seen; 256],
    /// Number of distinct masters seen (including ourselves).
    pub master_count: u32,
    /// Current lock count (auto-tuned to the master count, never below 3).
    pub lock_count: u32,
    /// Whether the lock count is auto-tuned.
    pub auto_lock_count: bool,
    /// Scan result strings by slave address.
    pub scan_results: BTreeMap<u8, String>,
    /// Number of scan sequences currently running.
    pub running_scans: u32,
    /// Current grab mode.
    pub grab: GrabMode,
    /// Grabbed telegrams by ID prefix (QQZZPBSBNN + up to 4 data bytes).
    pub grabbed: BTreeMap<String, String>,
}

/// Handles input from and output to the bus with respect to the eBUS
/// protocol; shared between the worker thread and the client threads.
pub struct BusHandler {
    pub cfg: BusConfig,
    messages: Arc<RwLock<MessageMap>>,
    next_requests: RequestQueue,
    finished_requests: RequestQueue,
    shared: Mutex<BusShared>,
    has_signal: AtomicBool,
    sym_per_sec: AtomicU32,
    max_sym_per_sec: AtomicU32,
    running: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<Sender<String>>>,
}

impl BusHandler {
    pub fn new(cfg: BusConfig, messages: Arc<RwLock<MessageMap>>) -> Arc<BusHandler> {
        let lock_count = if cfg.lock_count == 0 { 3 } else { cfg.lock_count.max(3) };
        Arc::new(BusHandler {
            shared: Mutex::new(BusShared {
                seen: [Seen::empty(); 256],
                master_count: 1,
                lock_count,
                auto_lock_count: cfg.lock_count == 0,
                scan_results: BTreeMap::new(),
                running_scans: 0,
                grab: GrabMode::None,
                grabbed: BTreeMap::new(),
            }),
            cfg,
            messages,
            next_requests: RequestQueue::new(),
            finished_requests: RequestQueue::new(),
            has_signal: AtomicBool::new(false),
            sym_per_sec: AtomicU32::new(0),
            max_sym_per_sec: AtomicU32::new(0),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// The catalog this handler decodes against.
    pub fn messages(&self) -> &Arc<RwLock<MessageMap>> {
        &self.messages
    }

    /// Returns whether a signal on the bus is available.
    pub fn has_signal(&self) -> bool {
        self.has_signal.load(Ordering::Relaxed)
    }

    /// The number of received symbols in the last second.
    pub fn symbol_rate(&self) -> u32 {
        self.sym_per_sec.load(Ordering::Relaxed)
    }

    /// The maximum number of received symbols per second ever seen.
    pub fn max_symbol_rate(&self) -> u32 {
        self.max_sym_per_sec.load(Ordering::Relaxed)
    }

    /// The number of masters already seen (including ourselves).
    pub fn master_count(&self) -> u32 {
        self.shared.lock().unwrap().master_count
    }

    /// Request the worker loop to terminate.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_finished(&self, request: Box<BusRequest>) {
        // drop abandoned results so the queue stays bounded
        while self.finished_requests.len() >= 32 {
            let _ = self.finished_requests.pop();
        }
        self.finished_requests.push(request);
    }

    /// Clear stored values (participants, scan results, grabbed data).
    pub fn clear(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.seen = [Seen::empty(); 256];
        shared.master_count = 1;
        shared.scan_results.clear();
        shared.grabbed.clear();
    }

    /// Run a closure on the shared tables.
    pub fn with_shared<R>(&self, f: impl FnOnce(&mut BusShared) -> R) -> R {
        f(&mut self.shared.lock().unwrap())
    }

    /// Register a listener for decoded updates (LISTEN clients).
    pub fn add_listener(&self) -> Receiver<String> {
        let (tx, rx) = channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Enqueue an active request without waiting. Returns the request id
    /// for [`BusHandler::wait_finished`].
    pub fn submit(&self, master: SymbolString) -> u64 {
        let id = self.next_request_id();
        self.next_requests.push(BusRequest::new_active(id, master));
        id
    }

    /// Wait for a submitted request to finish and return its outcome.
    pub fn wait_finished(&self, id: u64, timeout: Duration) -> Option<(Result<()>, SymbolString)> {
        let finished = self.finished_requests.remove_wait(id, timeout)?;
        match finished.kind {
            RequestKind::Active { result, slave } => Some((result, slave)),
            _ => None,
        }
    }

    /// Abandon a submitted request if it is still queued (a request the
    /// engine already owns will surface through the finished queue).
    pub fn cancel(&self, id: u64) -> bool {
        self.next_requests.remove(id).is_some()
    }

    /// Send a message on the bus and wait for the answer.
    pub fn send_and_wait(&self, master: &SymbolString) -> (Result<()>, SymbolString) {
        let mut result: Result<()> = Err(Error::NoSignal);
        let mut slave = SymbolString::new(false);
        info!("bus: send message: {}", master.data_str(true, true));
        // effective per-attempt timeout: every bus-lost retry may burn the
        // acquisition timeout plus a full slave exchange
        let per_attempt = (self.cfg.bus_lost_retries as u64 + 1)
            * (self.cfg.bus_acquire_timeout + 2 * self.cfg.slave_recv_timeout + 5 * SYN_TIMEOUT)
            + 1_000_000;
        let timeout = Duration::from_micros(per_attempt);

        for attempt in 0..=self.cfg.failed_send_retries {
            let id = self.submit(master.clone());
            let outcome = match self.wait_finished(id, timeout) {
                Some(outcome) => Some(outcome),
                None => {
                    // not done yet: pull it from the queue or wait for the
                    // engine to deliver the one it already owns
                    if self.cancel(id) {
                        None
                    } else {
                        self.wait_finished(id, timeout)
                    }
                }
            };
            let Some((request_result, request_slave)) = outcome else {
                result = Err(Error::Timeout);
                break;
            };
            result = request_result;
            slave = request_slave;
            match &result {
                Ok(()) => {
                    let mut unescaped = SymbolString::new(false);
                    for i in 0..master.len() {
                        let _ = unescaped.push_back(master.at(i), true, false);
                    }
                    let map = self.messages.read().unwrap();
                    if let Some(message) = map.find_for_master(&unescaped, false, true, true, true) {
                        map.invalidate_cache(&message);
                    }
                    break;
                }
                Err(e) if e.is_fatal() => {
                    error!("bus: send to {:02x}: {e}, give up", master.at(1));
                    break;
                }
                Err(e) => {
                    error!(
                        "bus: send to {:02x}: {e}{}",
                        master.at(1),
                        if attempt < self.cfg.failed_send_retries { ", retry" } else { "" }
                    );
                }
            }
        }
        (result, slave)
    }

    /// Initiate a scan of the slave addresses: the identification telegram
    /// first, then any further messages of the `scan` circuit.
    pub fn start_scan(&self, full: bool) -> Result<()> {
        let mut map = self.messages.write().unwrap();
        let mut scan_messages: Vec<_> = map
            .find_all("scan", "", true, true, false, false)
            .into_iter()
            .filter(|m| !(m.primary_command() == 0x07 && m.secondary_command() == 0x04))
            .collect();
        let scan_message = map.get_scan_message(None).ok_or(Error::NotFound)?;
        scan_messages.insert(0, scan_message);

        let mut slaves = VecDeque::new();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.scan_results.clear();
            for address in 1u16..256 {
                let slave = address as u8;
                if !is_valid_address(slave, false) || is_master(slave) {
                    continue;
                }
                if !full && !shared.seen[slave as usize].contains(Seen::SEEN) {
                    let Some(master) = master_address(slave) else {
                        continue;
                    };
                    if !shared.seen[master as usize].contains(Seen::SEEN) {
                        continue;
                    }
                }
                slaves.push_back(slave);
            }
        }
        if slaves.is_empty() {
            return Err(Error::Eof);
        }
        let request =
            BusRequest::new_scan(self.next_request_id(), scan_messages, slaves, self.cfg.own_master, self)?;
        drop(map);
        self.shared.lock().unwrap().running_scans += 1;
        self.next_requests.push(request);
        Ok(())
    }

    /// Send the identification telegram to a single slave and store the
    /// answer in the scan cache.
    pub fn scan_and_wait(&self, dst_address: u8) -> Result<()> {
        if !is_valid_address(dst_address, false) || is_master(dst_address) {
            return Err(Error::InvalidAddr);
        }
        self.shared.lock().unwrap().seen[dst_address as usize] |= Seen::SCAN_INIT;
        let scan_message = self.messages.read().unwrap().scan_message().clone();
        let master = scan_message.prepare_master(self.cfg.own_master, "", Some(dst_address), 0)?;
        let (result, slave) = self.send_and_wait(&master);
        if !matches!(result, Err(Error::NoSignal)) {
            self.shared.lock().unwrap().seen[dst_address as usize] |= Seen::SCAN_DONE;
        }
        result?;
        let mut map = self.messages.write().unwrap();
        let message = map.get_scan_message(Some(dst_address)).ok_or(Error::InvalidAddr)?;
        let mut unescaped = SymbolString::new(false);
        for i in 0..master.len() {
            let _ = unescaped.push_back(master.at(i), true, false);
        }
        message.store_last_data(crate::catalog::field::PartType::Master, &unescaped, 0)?;
        message.store_last_data(crate::catalog::field::PartType::Slave, &slave, 0)?;
        Ok(())
    }

    /// Start or stop grabbing messages. Returns whether the mode changed.
    pub fn enable_grab(&self, enable: bool, all: bool) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let mode = if enable {
            if all {
                GrabMode::All
            } else {
                GrabMode::Unknown
            }
        } else {
            GrabMode::None
        };
        if mode == shared.grab {
            return false;
        }
        if shared.grab == GrabMode::None {
            shared.grabbed.clear();
        }
        shared.grab = mode;
        true
    }

    /// Format the grabbed messages.
    pub fn format_grab_result(&self) -> String {
        let shared = self.shared.lock().unwrap();
        if shared.grab == GrabMode::None {
            return "grab disabled".to_string();
        }
        let lines: Vec<&str> = shared.grabbed.values().map(String::as_str).collect();
        lines.join("\n")
    }

    /// Format the scan results, falling back to passively collected
    /// identification data.
    pub fn format_scan_result(&self) -> String {
        // lock order: catalog before shared tables
        let map = self.messages.read().unwrap();
        let shared = self.shared.lock().unwrap();
        let mut out = String::new();
        if shared.running_scans > 0 {
            out.push_str(&format!("{} scan(s) still running\n", shared.running_scans));
        }
        let mut first = true;
        for (slave, result) in &shared.scan_results {
            if !first {
                out.push('\n');
            }
            first = false;
            out.push_str(&format!("{slave:02x}{result}"));
        }
        if first {
            for address in 1u16..256 {
                let slave = address as u8;
                if !is_valid_address(slave, false)
                    || is_master(slave)
                    || !shared.seen[slave as usize].contains(Seen::SCAN_DONE)
                {
                    continue;
                }
                let Some(message) = map.scan_message_for(slave) else {
                    continue;
                };
                if message.last_update().is_none() {
                    continue;
                }
                if let Ok(data) = message.decode_last_data(OutputOpts::default(), None, -1) {
                    if !first {
                        out.push('\n');
                    }
                    first = false;
                    out.push_str(&format!("{slave:02x}{data}"));
                }
            }
        }
        out
    }

    /// Format information about all seen participants.
    pub fn format_seen_info(&self) -> String {
        let map = self.messages.read().unwrap();
        let shared = self.shared.lock().unwrap();
        let mut out = String::new();
        for address in 0u16..256 {
            let address = address as u8;
            let seen = shared.seen[address as usize];
            let own_master = address == self.cfg.own_master;
            let own_slave = self.cfg.answer && address == self.cfg.own_master.wrapping_add(5);
            if !is_valid_address(address, false)
                || (!seen.contains(Seen::SEEN) && !own_master && !own_slave)
            {
                continue;
            }
            out.push_str(&format!("\naddress {address:02x}: "));
            let master = if is_master(address) {
                out.push_str("master");
                Some(address)
            } else {
                out.push_str("slave");
                master_address(address)
            };
            if let Some(master) = master {
                out.push_str(&format!(" #{}", master_number(master)));
            }
            if own_master || own_slave {
                out.push_str(", ebusd");
                if self.cfg.answer {
                    out.push_str(" (answering)");
                }
                if seen.contains(Seen::SEEN) {
                    out.push_str(", conflict");
                }
            }
            if seen.contains(Seen::SCAN_DONE) {
                out.push_str(", scanned");
                if let Some(message) = map.scan_message_for(address) {
                    if message.last_update().is_some() {
                        if let Ok(data) = message.decode_last_data(
                            OutputOpts { verbose: true, numeric: false },
                            None,
                            -1,
                        ) {
                            out.push_str(&format!(" \"{data}\""));
                        }
                    }
                }
            }
            let loaded = map.loaded_files(address);
            if !loaded.is_empty() {
                out.push_str(&format!(", loaded {loaded}"));
            }
        }
        out
    }

    /// The next slave address that still needs to be scanned or loaded,
    /// together with whether it is already scanned.
    pub fn next_scan_address(&self, last_address: u8) -> Option<(u8, bool)> {
        if last_address == SYN {
            return None;
        }
        let shared = self.shared.lock().unwrap();
        let mut address = last_address;
        loop {
            address = address.wrapping_add(1);
            if address == 0 {
                return None;
            }
            if !is_valid_address(address, false) || is_master(address) {
                continue;
            }
            let seen = shared.seen[address as usize];
            if seen & (Seen::SEEN | Seen::LOAD_INIT) == Seen::SEEN {
                return Some((address, seen.contains(Seen::SCAN_INIT)));
            }
            if let Some(master) = master_address(address) {
                if shared.seen[master as usize].contains(Seen::SEEN)
                    && !seen.contains(Seen::LOAD_INIT)
                {
                    return Some((address, seen.contains(Seen::SCAN_INIT)));
                }
            }
        }
    }

    /// Mark configuration loading state for a participant.
    pub fn set_scan_config_loaded(&self, address: u8, file: Option<&str>) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.seen[address as usize] |= Seen::LOAD_INIT;
            if file.is_some() {
                shared.seen[address as usize] |= Seen::LOAD_DONE;
            }
        }
        if let Some(file) = file {
            self.messages.write().unwrap().add_loaded_file(address, file);
        }
    }

    fn add_seen_address(&self, address: u8) {
        if !is_valid_address(address, false) {
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        let mut address = address;
        if !is_master(address) {
            shared.seen[address as usize] |= Seen::SEEN;
            match master_address(address) {
                Some(master) => address = master,
                None => return,
            }
        }
        if !shared.seen[address as usize].contains(Seen::SEEN) {
            if !self.cfg.answer || address != self.cfg.own_master {
                shared.master_count += 1;
                if shared.auto_lock_count && shared.master_count > shared.lock_count {
                    shared.lock_count = shared.master_count;
                }
                info!("bus: new master {address:02x}, master count {}", shared.master_count);
            }
            shared.seen[address as usize] |= Seen::SEEN;
        }
    }
}

impl ScanSink for BusHandler {
    fn set_scan_result(&self, dst_address: u8, result: String) {
        let mut shared = self.shared.lock().unwrap();
        shared.seen[dst_address as usize] |= Seen::SCAN_INIT;
        if !result.is_empty() {
            shared.seen[dst_address as usize] |= Seen::SCAN_DONE;
            info!("bus: scan {dst_address:02x}: {result}");
            shared.scan_results.insert(dst_address, result);
        }
    }

    fn set_scan_finished(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.running_scans > 0 {
            shared.running_scans -= 1;
        }
    }

    fn notify_update(&self, circuit: &str, name: &str, data: &str) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| tx.send(format!("{circuit} {name} = {data}")).is_ok());
    }
}

/// The worker loop state, owned by the bus worker thread.
pub struct BusWorker {
    handler: Arc<BusHandler>,
    device: Box<dyn Device>,
    state: BusState,
    /// The unescaped received command.
    command: SymbolString,
    command_crc_valid: bool,
    /// The unescaped received response, or the escaped response to send.
    response: SymbolString,
    response_crc_valid: bool,
    /// Offset of the next symbol to send from the command or response.
    next_send_pos: usize,
    /// Whether the current message part is being repeated.
    repeat: bool,
    current: Option<Box<BusRequest>>,
    /// Remaining SYN symbols before sending is allowed again.
    remain_lock_count: u32,
    /// Interval in microseconds after which to generate an AUTO-SYN
    /// symbol, 0 if disabled.
    generate_syn_interval: u64,
    last_receive: Option<Instant>,
    last_poll: Option<Instant>,
}

impl BusWorker {
    pub fn new(handler: Arc<BusHandler>, device: Box<dyn Device>) -> BusWorker {
        let auto = handler.with_shared(|s| s.auto_lock_count);
        let generate_syn_interval = if handler.cfg.generate_syn {
            SYN_TIMEOUT * master_number(handler.cfg.own_master) as u64 + SYMBOL_DURATION
        } else {
            0
        };
        BusWorker {
            handler,
            device,
            state: BusState::NoSignal,
            command: SymbolString::new(false),
            command_crc_valid: false,
            response: SymbolString::new(false),
            response_crc_valid: false,
            next_send_pos: 0,
            repeat: false,
            current: None,
            remain_lock_count: if auto { 1 } else { 0 },
            generate_syn_interval,
            last_receive: None,
            last_poll: None,
        }
    }

    /// Main worker loop: drive the state machine while the device is
    /// usable, re-open it when lost.
    pub fn run(&mut self) {
        let mut sym_count: u32 = 0;
        let mut last_time = Instant::now();
        while self.handler.is_running() {
            if self.device.is_valid() {
                let result = self.handle_symbol();
                if !matches!(result, Err(Error::Timeout)) {
                    sym_count += 1;
                }
                let now = Instant::now();
                let elapsed = now.duration_since(last_time);
                if elapsed >= Duration::from_secs(1) {
                    let rate = sym_count / (elapsed.as_secs() as u32).max(1);
                    self.handler.sym_per_sec.store(rate, Ordering::Relaxed);
                    if rate > self.handler.max_sym_per_sec.load(Ordering::Relaxed) {
                        self.handler.max_sym_per_sec.store(rate, Ordering::Relaxed);
                        if rate > 100 {
                            info!("bus: max. symbols per second: {rate}");
                        }
                    }
                    last_time = now;
                    sym_count = 0;
                }
            } else {
                for _ in 0..50 {
                    if !self.handler.is_running() {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                match self.device.open() {
                    Ok(()) => info!("bus: re-opened {}", self.device.name()),
                    Err(e) => {
                        error!("bus: unable to open {}: {e}", self.device.name());
                        let _ = self.set_state(BusState::NoSignal, Err(e), false);
                    }
                }
                sym_count = 0;
            }
        }
    }

    /// Handle the next symbol on the bus.
    pub fn handle_symbol(&mut self) -> Result<()> {
        let latency = self.handler.cfg.transfer_latency + self.device.latency();
        let mut timeout = SYN_TIMEOUT;
        let mut send_symbol = ESC;
        let mut sending = false;
        let mut start_request: Option<Box<BusRequest>> = None;

        // check if a symbol has to be sent and determine the receive timeout
        match self.state {
            BusState::NoSignal => {
                timeout = if self.generate_syn_interval > 0 {
                    self.generate_syn_interval
                } else {
                    SIGNAL_TIMEOUT
                };
            }
            BusState::Skip => timeout = SYN_TIMEOUT,
            BusState::Ready => {
                if self.current.is_some() {
                    // clean up a stale request from an aborted transfer
                    let _ = self.set_state(BusState::Ready, Err(Error::Timeout), false);
                }
                if self.remain_lock_count == 0 && self.current.is_none() {
                    start_request = self.handler.next_requests.pop();
                    if start_request.is_none() && self.handler.cfg.poll_interval > 0 {
                        let due = self
                            .last_poll
                            .map_or(true, |t| {
                                t.elapsed() > Duration::from_secs(self.handler.cfg.poll_interval)
                            });
                        if due {
                            start_request = self.create_poll_request();
                        }
                    }
                    if start_request.is_some() {
                        // initiate arbitration
                        send_symbol = self.handler.cfg.own_master;
                        sending = true;
                    }
                }
            }
            BusState::RecvCmd | BusState::RecvCmdAck => {
                timeout = self.handler.cfg.slave_recv_timeout;
            }
            BusState::RecvRes => {
                timeout = if !self.response.is_empty()
                    || self.handler.cfg.slave_recv_timeout > SYN_TIMEOUT
                {
                    self.handler.cfg.slave_recv_timeout
                } else {
                    SYN_TIMEOUT
                };
            }
            BusState::RecvResAck => timeout = self.handler.cfg.slave_recv_timeout,
            BusState::SendCmd => {
                if let Some(current) = &self.current {
                    send_symbol = current.master.at(self.next_send_pos);
                    sending = true;
                }
            }
            BusState::SendResAck => {
                if self.current.is_some() {
                    send_symbol = if self.response_crc_valid { ACK } else { NAK };
                    sending = true;
                }
            }
            BusState::SendCmdAck => {
                if self.handler.cfg.answer {
                    send_symbol = if self.command_crc_valid { ACK } else { NAK };
                    sending = true;
                }
            }
            BusState::SendRes => {
                if self.handler.cfg.answer {
                    send_symbol = self.response.at(self.next_send_pos);
                    sending = true;
                }
            }
            BusState::SendSyn => {
                send_symbol = SYN;
                sending = true;
            }
        }

        // send if necessary
        if sending {
            match self.device.send(send_symbol) {
                Ok(()) => {
                    timeout = if self.state == BusState::Ready {
                        latency + self.handler.cfg.bus_acquire_timeout
                    } else {
                        latency + SEND_TIMEOUT
                    };
                }
                Err(e) => {
                    sending = false;
                    timeout = SYN_TIMEOUT;
                    if let Some(request) = start_request.take() {
                        // deliver the failure to the requester
                        self.current = Some(request);
                    }
                    let _ = self.set_state(BusState::Skip, Err(e), false);
                }
            }
        }

        // receive next symbol (checking reception of the sent one)
        let received = self.device.recv(timeout + latency);

        if !sending
            && matches!(received, Err(Error::Timeout))
            && self.generate_syn_interval > 0
            && timeout >= self.generate_syn_interval
            && matches!(self.state, BusState::NoSignal | BusState::Skip)
        {
            return self.generate_syn();
        }

        let symbol = match received {
            Ok(symbol) => symbol,
            Err(e) => {
                if sending {
                    if let Some(request) = start_request.take() {
                        self.current = Some(request);
                    }
                }
                let long_silence = self
                    .last_receive
                    .map_or(true, |t| t.elapsed() > Duration::from_secs(1));
                if (self.generate_syn_interval != SYN_TIMEOUT && long_silence)
                    || self.state == BusState::NoSignal
                {
                    return self.set_state(BusState::NoSignal, Err(e), false);
                }
                return self.set_state(BusState::Skip, Err(e), false);
            }
        };
        self.last_receive = Some(Instant::now());

        if symbol == SYN && self.state != BusState::SendSyn {
            if !sending && self.remain_lock_count > 0 && self.command.len() != 1 {
                self.remain_lock_count -= 1;
            } else if !sending && self.remain_lock_count == 0 && self.command.len() == 1 {
                // SYN / address / SYN: the bus is locked for its priority
                self.remain_lock_count = 1;
            }
            if let Some(request) = start_request.take() {
                // SYN instead of our echo, try again later
                self.handler.next_requests.push_front(request);
            }
            let result = if self.state == BusState::Skip { Ok(()) } else { Err(Error::Syn) };
            return self.set_state(BusState::Ready, result, false);
        }

        match self.state {
            BusState::NoSignal => self.set_state(BusState::Skip, Ok(()), false),

            BusState::Skip => Ok(()),

            BusState::Ready => {
                if let Some(request) = start_request.take() {
                    if sending {
                        self.current = Some(request);
                        if symbol == send_symbol {
                            // arbitration successful
                            self.next_send_pos = 1;
                            self.repeat = false;
                            return self.set_state(BusState::SendCmd, Ok(()), false);
                        }
                        // arbitration lost; with a same priority class winner
                        // the next SYN suffices, otherwise hold off longer
                        self.remain_lock_count = if is_master(symbol) { 2 } else { 1 };
                        let lock_count = self.handler.with_shared(|s| s.lock_count);
                        if (symbol & 0x0F) != (send_symbol & 0x0F)
                            && lock_count > self.remain_lock_count
                        {
                            self.remain_lock_count = lock_count;
                        }
                        let _ = self.set_state(BusState::Ready, Err(Error::BusLost), false);
                    } else {
                        self.handler.next_requests.push_front(request);
                    }
                }
                // the observed symbol is the QQ of the winning master
                if let Err(e) = self.command.push_back(symbol, false, true) {
                    return self.set_state(BusState::Skip, Err(e), false);
                }
                self.repeat = false;
                self.set_state(BusState::RecvCmd, Ok(()), false)
            }

            BusState::RecvCmd => {
                let crc_pos = if self.command.len() > 4 {
                    5 + self.command.at(4) as usize
                } else {
                    usize::MAX
                };
                let update_crc = self.command.len() < crc_pos;
                let complete = match self.command.push_back(symbol, true, update_crc) {
                    Ok(complete) => complete,
                    Err(e) => return self.set_state(BusState::Skip, Err(e), false),
                };
                if complete && crc_pos != usize::MAX && self.command.len() == crc_pos + 1 {
                    // CRC received
                    let dst_address = self.command.at(1);
                    self.command_crc_valid = self.command.at(crc_pos) == self.command.crc();
                    if self.command_crc_valid {
                        if dst_address == BROADCAST {
                            self.receive_completed();
                            return self.set_state(BusState::Skip, Ok(()), false);
                        }
                        self.handler.add_seen_address(self.command.at(0));
                        if self.handler.cfg.answer && self.is_own_address(dst_address) {
                            return self.set_state(BusState::SendCmdAck, Ok(()), false);
                        }
                        return self.set_state(BusState::RecvCmdAck, Ok(()), false);
                    }
                    if dst_address == BROADCAST {
                        return self.set_state(BusState::Skip, Err(Error::Crc), false);
                    }
                    if self.handler.cfg.answer && self.is_own_address(dst_address) {
                        return self.set_state(BusState::SendCmdAck, Err(Error::Crc), false);
                    }
                    if self.repeat {
                        return self.set_state(BusState::Skip, Err(Error::Crc), false);
                    }
                    return self.set_state(BusState::RecvCmdAck, Err(Error::Crc), false);
                }
                Ok(())
            }

            BusState::RecvCmdAck => {
                if symbol == ACK {
                    if !self.command_crc_valid {
                        return self.set_state(BusState::Skip, Err(Error::Ack), false);
                    }
                    if let Some(current) = &self.current {
                        if is_master(current.master.at(1)) {
                            return self.set_state(BusState::SendSyn, Ok(()), false);
                        }
                    } else if is_master(self.command.at(1)) {
                        self.receive_completed();
                        return self.set_state(BusState::Skip, Ok(()), false);
                    }
                    self.repeat = false;
                    return self.set_state(BusState::RecvRes, Ok(()), false);
                }
                if symbol == NAK {
                    if !self.repeat {
                        self.repeat = true;
                        self.next_send_pos = 0;
                        self.command.clear();
                        if self.current.is_some() {
                            return self.set_state(BusState::SendCmd, Err(Error::Nak), true);
                        }
                        return self.set_state(BusState::RecvCmd, Err(Error::Nak), true);
                    }
                    return self.set_state(BusState::Skip, Err(Error::Nak), false);
                }
                self.set_state(BusState::Skip, Err(Error::Ack), false)
            }

            BusState::RecvRes => {
                let crc_pos = if !self.response.is_empty() {
                    1 + self.response.at(0) as usize
                } else {
                    usize::MAX
                };
                let update_crc = self.response.len() < crc_pos;
                let complete = match self.response.push_back(symbol, true, update_crc) {
                    Ok(complete) => complete,
                    Err(e) => return self.set_state(BusState::Skip, Err(e), false),
                };
                if complete && crc_pos != usize::MAX && self.response.len() == crc_pos + 1 {
                    // CRC received
                    self.response_crc_valid = self.response.at(crc_pos) == self.response.crc();
                    if self.response_crc_valid {
                        if self.current.is_some() {
                            return self.set_state(BusState::SendResAck, Ok(()), false);
                        }
                        return self.set_state(BusState::RecvResAck, Ok(()), false);
                    }
                    if self.repeat {
                        if self.current.is_some() {
                            return self.set_state(BusState::SendSyn, Err(Error::Crc), false);
                        }
                        return self.set_state(BusState::Skip, Err(Error::Crc), false);
                    }
                    if self.current.is_some() {
                        return self.set_state(BusState::SendResAck, Err(Error::Crc), false);
                    }
                    return self.set_state(BusState::RecvResAck, Err(Error::Crc), false);
                }
                Ok(())
            }

            BusState::RecvResAck => {
                if symbol == ACK {
                    if !self.response_crc_valid {
                        return self.set_state(BusState::Skip, Err(Error::Ack), false);
                    }
                    self.receive_completed();
                    return self.set_state(BusState::Skip, Ok(()), false);
                }
                if symbol == NAK {
                    if !self.repeat {
                        self.repeat = true;
                        self.response.clear();
                        return self.set_state(BusState::RecvRes, Err(Error::Nak), true);
                    }
                    return self.set_state(BusState::Skip, Err(Error::Nak), false);
                }
                self.set_state(BusState::Skip, Err(Error::Ack), false)
            }

            BusState::SendCmd => {
                if self.current.is_some() && sending && symbol == send_symbol {
                    // successfully sent
                    self.next_send_pos += 1;
                    let current = self.current.as_ref().expect("checked above");
                    if self.next_send_pos >= current.master.len() {
                        // master data completely sent
                        if current.master.at(1) == BROADCAST {
                            return self.set_state(BusState::SendSyn, Ok(()), false);
                        }
                        self.command_crc_valid = true;
                        return self.set_state(BusState::RecvCmdAck, Ok(()), false);
                    }
                    return Ok(());
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendResAck => {
                if self.current.is_some() && sending && symbol == send_symbol {
                    // successfully sent
                    if !self.response_crc_valid {
                        if !self.repeat {
                            self.repeat = true;
                            self.response.clear();
                            return self.set_state(BusState::RecvRes, Err(Error::Nak), true);
                        }
                        return self.set_state(BusState::SendSyn, Err(Error::Ack), false);
                    }
                    return self.set_state(BusState::SendSyn, Ok(()), false);
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendCmdAck => {
                if sending && self.handler.cfg.answer && symbol == send_symbol {
                    // successfully sent
                    if !self.command_crc_valid {
                        if !self.repeat {
                            self.repeat = true;
                            self.command.clear();
                            return self.set_state(BusState::RecvCmd, Err(Error::Nak), true);
                        }
                        return self.set_state(BusState::Skip, Err(Error::Ack), false);
                    }
                    if is_master(self.command.at(1)) {
                        self.receive_completed();
                        return self.set_state(BusState::Skip, Ok(()), false);
                    }
                    self.next_send_pos = 0;
                    self.repeat = false;
                    return self.build_answer();
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendRes => {
                if sending && self.handler.cfg.answer && symbol == send_symbol {
                    // successfully sent
                    self.next_send_pos += 1;
                    if self.next_send_pos >= self.response.len() {
                        // slave data completely sent
                        return self.set_state(BusState::RecvResAck, Ok(()), false);
                    }
                    return Ok(());
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }

            BusState::SendSyn => {
                if sending && symbol == send_symbol {
                    return self.set_state(BusState::Skip, Ok(()), false);
                }
                self.set_state(BusState::Skip, Err(Error::InvalidArg), false)
            }
        }
    }

    fn is_own_address(&self, address: u8) -> bool {
        address == self.handler.cfg.own_master
            || address == self.handler.cfg.own_master.wrapping_add(5)
    }

    /// Act as AUTO-SYN generator: send a SYN ourselves and check it comes
    /// back unmolested.
    fn generate_syn(&mut self) -> Result<()> {
        match self.device.send(SYN) {
            Ok(()) => match self.device.recv(SEND_TIMEOUT) {
                Err(Error::Timeout) => self.set_state(BusState::NoSignal, Err(Error::Timeout), false),
                Err(e) => {
                    error!("bus: unable to receive sent AUTO-SYN symbol: {e}");
                    self.set_state(BusState::Skip, Err(e), false)
                }
                Ok(echo) if echo != SYN => {
                    error!("bus: received {echo:02x} instead of AUTO-SYN symbol");
                    self.set_state(BusState::Skip, Ok(()), false)
                }
                Ok(_) => {
                    if self.generate_syn_interval != SYN_TIMEOUT {
                        // our own AUTO-SYN came back: we are the generator now
                        self.generate_syn_interval = SYN_TIMEOUT;
                        info!("bus: acting as AUTO-SYN generator");
                    }
                    self.remain_lock_count = 0;
                    self.set_state(BusState::Ready, Ok(()), false)
                }
            },
            Err(e) => self.set_state(BusState::Skip, Err(e), false),
        }
    }

    fn create_poll_request(&mut self) -> Option<Box<BusRequest>> {
        let map = self.handler.messages.read().unwrap();
        let message = map.next_poll(Duration::from_secs(self.handler.cfg.poll_interval))?;
        drop(map);
        self.last_poll = Some(Instant::now());
        match BusRequest::new_poll(
            self.handler.next_request_id(),
            message,
            self.handler.cfg.own_master,
        ) {
            Ok(request) => Some(request),
            Err(e) => {
                error!("bus: prepare poll message: {e}");
                None
            }
        }
    }

    /// Build the slave response for a request addressed to us.
    fn build_answer(&mut self) -> Result<()> {
        // release the catalog before any state change
        let response = {
            let map = self.handler.messages.read().unwrap();
            let mut message = map.find_for_master(&self.command, false, true, true, true);
            if message.is_none() {
                message = map
                    .find_for_master(&self.command, true, true, true, true)
                    .filter(|m| m.src_address() == SYN);
            }
            match message {
                None => Err(Error::InvalidArg),
                Some(message) if message.is_write() => Err(Error::InvalidArg),
                Some(message) => {
                    let input = if map.is_scan_message(&message) { SCAN_ANSWER } else { "" };
                    message.prepare_slave(input)
                }
            }
        };
        match response {
            Ok(response) => {
                self.response = response; // escaped, sent symbol by symbol
                self.response_crc_valid = true;
                self.set_state(BusState::SendRes, Ok(()), false)
            }
            Err(e) => self.set_state(BusState::Skip, Err(e), false),
        }
    }

    /// A passive master+slave exchange completed: update the catalog cache
    /// and the grab table.
    fn receive_completed(&mut self) {
        let src_address = self.command.at(0);
        let dst_address = self.command.at(1);
        if src_address == dst_address {
            error!("bus: invalid self-addressed message from {src_address:02x}");
            return;
        }
        self.handler.add_seen_address(src_address);
        self.handler.add_seen_address(dst_address);

        let master_dst = is_master(dst_address);
        if dst_address == BROADCAST {
            info!("update: BC cmd: {}", self.command.data_str(true, true));
        } else if master_dst {
            info!("update: MM cmd: {}", self.command.data_str(true, true));
        } else {
            info!(
                "update: MS cmd: {} / {}",
                self.command.data_str(true, true),
                self.response.data_str(true, true)
            );
        }

        let map = self.handler.messages.read().unwrap();
        let message = map.find_for_master(&self.command, false, true, true, true);

        let grab_mode = self.handler.with_shared(|s| s.grab);
        if grab_mode == GrabMode::All || (message.is_none() && grab_mode == GrabMode::Unknown) {
            let full = self.command.data_str(true, true);
            let mut key = full.clone();
            // QQZZPBSBNN + up to 4 data bytes
            key.truncate(2 * (1 + 1 + 2 + 1 + 4));
            let mut data = full;
            if dst_address != BROADCAST && !master_dst {
                data.push_str(" / ");
                data.push_str(&self.response.data_str(true, true));
            }
            if let Some(message) = &message {
                data.push_str(&format!(" = {} {}", message.circuit(), message.name()));
            }
            self.handler.with_shared(|s| s.grabbed.insert(key, data));
        }

        let Some(message) = message else {
            if dst_address == BROADCAST {
                info!("update: unknown BC cmd: {}", self.command.data_str(true, true));
            } else if master_dst {
                info!("update: unknown MM cmd: {}", self.command.data_str(true, true));
            } else {
                info!(
                    "update: unknown MS cmd: {} / {}",
                    self.command.data_str(true, true),
                    self.response.data_str(true, true)
                );
            }
            return;
        };

        map.invalidate_cache(&message);
        let circuit = message.circuit().to_string();
        let name = message.name().to_string();
        let stored = message
            .store_last_exchange(&self.command, &self.response)
            .and_then(|_| message.decode_last_data(OutputOpts::default(), None, -1));
        match stored {
            Err(e) => error!(
                "update: unable to parse {circuit} {name} from {} / {}: {e}",
                self.command.data_str(true, true),
                self.response.data_str(true, true)
            ),
            Ok(data) => {
                if self.handler.cfg.answer && self.is_own_address(dst_address) {
                    info!("update: self-update {circuit} {name} QQ={src_address:02x}: {data}");
                } else if message.dst_address() == SYN {
                    if message.src_address() == SYN {
                        info!(
                            "update: {circuit} {name} QQ={src_address:02x} ZZ={dst_address:02x}: {data}"
                        );
                    } else {
                        info!("update: {circuit} {name} ZZ={dst_address:02x}: {data}");
                    }
                } else if message.src_address() == SYN {
                    info!("update: {circuit} {name} QQ={src_address:02x}: {data}");
                } else {
                    info!("update: {circuit} {name}: {data}");
                }
                drop(map);
                self.handler.notify_update(&circuit, &name, &data);
            }
        }
    }

    /// Set a new bus state, delivering the given result to the current
    /// request if it ends with this transition.
    fn set_state(&mut self, state: BusState, result: Result<()>, first_repetition: bool) -> Result<()> {
        if let Some(mut current) = self.current.take() {
            let bus_lost = matches!(result, Err(Error::BusLost));
            if bus_lost && current.bus_lost_retries < self.handler.cfg.bus_lost_retries {
                debug!("bus: {} during {}, retry", Error::BusLost, self.state.code());
                current.bus_lost_retries += 1;
                self.handler.next_requests.push(current);
            } else if state == BusState::SendSyn || (result.is_err() && !first_repetition) {
                if let Err(e) = &result {
                    debug!("bus: notify request: {e}");
                }
                let dst_address = current.master.at(1);
                if result.is_ok() {
                    self.handler.add_seen_address(dst_address);
                }
                // a SYN while waiting for the slave means it did not answer
                let notify_result = if matches!(result, Err(Error::Syn))
                    && matches!(self.state, BusState::RecvCmdAck | BusState::RecvRes)
                {
                    Err(Error::Timeout)
                } else {
                    result.clone()
                };
                let restart = {
                    let mut map = self.handler.messages.write().unwrap();
                    current.notify(notify_result, &self.response, &mut map, &*self.handler)
                };
                if restart {
                    current.bus_lost_retries = 0;
                    self.handler.next_requests.push(current);
                } else if !current.is_self_deleting() {
                    self.handler.push_finished(current);
                }
            } else {
                self.current = Some(current);
            }
        }

        if state == BusState::NoSignal {
            // notify all pending requests, nothing can be sent any more
            self.response.clear_with_mode(false);
            let mut give_up = 0u32;
            while let Some(mut request) = self.handler.next_requests.pop() {
                let restart = {
                    let mut map = self.handler.messages.write().unwrap();
                    request.notify(Err(Error::NoSignal), &self.response, &mut map, &*self.handler)
                };
                if restart && give_up < 1024 {
                    give_up += 1;
                    request.bus_lost_retries = 0;
                    self.handler.next_requests.push(request);
                } else if !request.is_self_deleting() {
                    self.handler.push_finished(request);
                }
            }
        }

        if state == self.state {
            return result;
        }

        match &result {
            Err(e) => debug!(
                "bus: {e} during {}, switching to {}",
                self.state.code(),
                state.code()
            ),
            Ok(()) => {
                if self.current.is_some()
                    || matches!(state, BusState::SendCmd | BusState::SendResAck | BusState::SendSyn)
                {
                    debug!("bus: switching from {} to {}", self.state.code(), state.code());
                }
            }
        }
        if state == BusState::NoSignal {
            warn!("bus: signal lost");
        } else if self.state == BusState::NoSignal {
            info!("bus: signal acquired");
        }

        self.state = state;
        self.handler.has_signal.store(state != BusState::NoSignal, Ordering::Relaxed);

        if matches!(state, BusState::Ready | BusState::Skip) {
            self.command.clear();
            self.command_crc_valid = false;
            self.response.clear_with_mode(false);
            self.response_crc_valid = false;
            self.next_send_pos = 0;
        }

        result
    }

    /// The current bus state (exposed for tests).
    pub fn state(&self) -> BusState {
        self.state
    }

    /// The remaining SYN symbols before sending is allowed again
    /// (exposed for tests).
    pub fn remain_lock_count(&self) -> u32 {
        self.remain_lock_count
    }
}
