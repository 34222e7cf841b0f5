//! Message definitions and their last-seen cache.
//!
//! A [`Message`] describes one telegram (or a chain of telegrams) on the
//! bus: its direction, addresses, command ID bytes, and typed data layout.
//! Each message carries a cache of the most recent master and slave data
//! together with update/change timestamps and poll bookkeeping.
//!
//! Messages are indexed by a composite 64-bit telegram key:
//! - bits 61..63: length of the ID bytes (without PB/SB)
//! - bits 56..60: source master number (1..25) for passive messages,
//!   0 for passive with any source, 0x1F for active write, 0x1E for
//!   active read
//! - bits 48..55: ZZ (or SYN for any destination)
//! - bits 40..47: PB, bits 32..39: SB
//! - bits 0..31: further ID bytes, cyclically folded with xor

use crate::constants::SYN;
use crate::ebus::address::{is_master, master_number};
use crate::ebus::symbol::{MasterCompare, SymbolString};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use super::condition::Condition;
use super::field::{FieldSet, OutputOpts, PartType};

/// The chained variant data of a message transported as several telegrams.
#[derive(Debug, Clone)]
pub struct Chain {
    /// The full ID bytes (PB, SB, suffix) of every part.
    pub ids: Vec<Vec<u8>>,
    /// The data length of every part.
    pub lengths: Vec<u8>,
    /// The maximum allowed age spread between the parts.
    pub max_time_diff: Duration,
}

/// The mutable last-seen state of a message.
#[derive(Debug, Default)]
pub struct MessageState {
    /// The last seen unescaped master data.
    pub last_master: SymbolString,
    /// The last seen unescaped slave data.
    pub last_slave: SymbolString,
    /// When the data was last stored.
    pub last_update: Option<SystemTime>,
    /// When the data last changed.
    pub last_change: Option<SystemTime>,
    /// How often this message was polled.
    pub poll_count: u32,
    /// When this message was last polled.
    pub last_poll: Option<SystemTime>,
    /// Per-part data of a chained message.
    chain_masters: Vec<SymbolString>,
    chain_slaves: Vec<SymbolString>,
    chain_master_times: Vec<Option<SystemTime>>,
    chain_slave_times: Vec<Option<SystemTime>>,
}

/// One message definition with its last-seen cache.
#[derive(Debug)]
pub struct Message {
    circuit: String,
    name: String,
    is_write: bool,
    is_passive: bool,
    comment: String,
    src_address: u8,
    dst_address: u8,
    /// PB, SB, and the ID suffix bytes (the chain prefix for chains).
    id: Vec<u8>,
    key: u64,
    data: Arc<FieldSet>,
    chain: Option<Chain>,
    poll_priority: AtomicU8,
    used_by_condition: AtomicBool,
    condition: Option<Arc<Condition>>,
    state: Mutex<MessageState>,
}

impl Message {
    /// Construct a new message definition.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        circuit: &str,
        name: &str,
        is_write: bool,
        is_passive: bool,
        comment: &str,
        src_address: u8,
        dst_address: u8,
        id: Vec<u8>,
        data: Arc<FieldSet>,
        poll_priority: u8,
        condition: Option<Arc<Condition>>,
    ) -> Arc<Message> {
        let key = compute_key(is_passive, is_write, src_address, dst_address, &id);
        Arc::new(Message {
            circuit: circuit.to_string(),
            name: name.to_string(),
            is_write,
            is_passive,
            comment: comment.to_string(),
            src_address,
            dst_address,
            id,
            key,
            data,
            chain: None,
            poll_priority: AtomicU8::new(poll_priority),
            used_by_condition: AtomicBool::new(false),
            condition,
            state: Mutex::new(MessageState::default()),
        })
    }

    /// Construct a new chained message definition.
    #[allow(clippy::too_many_arguments)]
    pub fn new_chained(
        circuit: &str,
        name: &str,
        is_write: bool,
        comment: &str,
        src_address: u8,
        dst_address: u8,
        id: Vec<u8>,
        ids: Vec<Vec<u8>>,
        lengths: Vec<u8>,
        data: Arc<FieldSet>,
        poll_priority: u8,
        condition: Option<Arc<Condition>>,
    ) -> Arc<Message> {
        let key = compute_key(false, is_write, src_address, dst_address, &id);
        let count = ids.len();
        let mut state = MessageState::default();
        state.chain_masters = vec![SymbolString::new(false); count];
        state.chain_slaves = vec![SymbolString::new(false); count];
        state.chain_master_times = vec![None; count];
        state.chain_slave_times = vec![None; count];
        Arc::new(Message {
            circuit: circuit.to_string(),
            name: name.to_string(),
            is_write,
            is_passive: false,
            comment: comment.to_string(),
            src_address,
            dst_address,
            id,
            key,
            data,
            chain: Some(Chain {
                // 15 seconds per part bounds the assembly window
                max_time_diff: Duration::from_secs(15 * count as u64),
                ids,
                lengths,
            }),
            poll_priority: AtomicU8::new(poll_priority),
            used_by_condition: AtomicBool::new(false),
            condition,
            state: Mutex::new(state),
        })
    }

    /// Derive a new message with another destination (and optionally source
    /// address and circuit name).
    pub fn derive(&self, dst_address: u8, src_address: Option<u8>, circuit: &str) -> Arc<Message> {
        let circuit = if circuit.is_empty() { &self.circuit } else { circuit };
        let src = src_address.unwrap_or(self.src_address);
        match &self.chain {
            Some(chain) => Message::new_chained(
                circuit,
                &self.name,
                self.is_write,
                &self.comment,
                src,
                dst_address,
                self.id.clone(),
                chain.ids.clone(),
                chain.lengths.clone(),
                self.data.clone(),
                self.poll_priority.load(Ordering::Relaxed),
                self.condition.clone(),
            ),
            None => Message::new(
                circuit,
                &self.name,
                self.is_write,
                self.is_passive,
                &self.comment,
                src,
                dst_address,
                self.id.clone(),
                self.data.clone(),
                self.poll_priority.load(Ordering::Relaxed),
                self.condition.clone(),
            ),
        }
    }

    /// Derive with the circuit extended by the destination in hex.
    pub fn derive_extended(&self, dst_address: u8) -> Arc<Message> {
        let circuit = format!("{}.{dst_address:02x}", self.circuit);
        self.derive(dst_address, None, &circuit)
    }

    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn is_passive(&self) -> bool {
        self.is_passive
    }

    pub fn src_address(&self) -> u8 {
        self.src_address
    }

    pub fn dst_address(&self) -> u8 {
        self.dst_address
    }

    pub fn primary_command(&self) -> u8 {
        self.id[0]
    }

    pub fn secondary_command(&self) -> u8 {
        self.id[1]
    }

    /// The full ID bytes (chain prefix for chained messages).
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The length of the ID bytes without PB and SB.
    pub fn id_length(&self) -> usize {
        match &self.chain {
            Some(chain) => chain.ids[0].len() - 2,
            None => self.id.len() - 2,
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// The key this message would have with another destination address.
    pub fn derived_key(&self, dst_address: u8) -> u64 {
        (self.key & !(0xFFu64 << 48)) | (dst_address as u64) << 48
    }

    pub fn data(&self) -> &Arc<FieldSet> {
        &self.data
    }

    /// The number of telegrams this message is transported as.
    pub fn count(&self) -> usize {
        self.chain.as_ref().map_or(1, |c| c.ids.len())
    }

    pub fn chain(&self) -> Option<&Chain> {
        self.chain.as_ref()
    }

    pub fn poll_priority(&self) -> u8 {
        self.poll_priority.load(Ordering::Relaxed)
    }

    /// Set the polling priority. Returns true when polling was newly
    /// enabled by the change.
    pub fn set_poll_priority(&self, priority: u8) -> bool {
        let mut priority = priority;
        if self.is_passive {
            return false;
        }
        if self.used_by_condition.load(Ordering::Relaxed)
            && (priority == 0 || priority > crate::constants::POLL_PRIORITY_CONDITION)
        {
            priority = crate::constants::POLL_PRIORITY_CONDITION;
        }
        let old = self.poll_priority.swap(priority, Ordering::Relaxed);
        old == 0 && priority > 0
    }

    /// Grant the implicit poll priority of a condition source.
    pub fn set_used_by_condition(&self) {
        if self.used_by_condition.swap(true, Ordering::Relaxed) {
            return;
        }
        let priority = self.poll_priority.load(Ordering::Relaxed);
        if priority == 0 || priority > crate::constants::POLL_PRIORITY_CONDITION {
            self.set_poll_priority(crate::constants::POLL_PRIORITY_CONDITION);
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    pub fn condition(&self) -> Option<&Arc<Condition>> {
        self.condition.as_ref()
    }

    /// Returns whether this message is currently visible (its condition,
    /// if any, evaluates to true).
    pub fn is_available(&self) -> bool {
        self.condition.as_ref().map_or(true, |c| c.is_true())
    }

    /// Returns whether the data layout has a field of the given name.
    pub fn has_field(&self, name: Option<&str>, numeric: bool) -> bool {
        self.data.has_field(name, numeric)
    }

    /// Check the ID suffix against the master data bytes. Returns the part
    /// index of the matching chain part for chained messages.
    pub fn check_id(&self, master: &SymbolString) -> Option<usize> {
        let id_len = self.id_length();
        if master.len() < 5 + id_len {
            return None;
        }
        match &self.chain {
            None => {
                for pos in 0..id_len {
                    if self.id[2 + pos] != master.at(5 + pos) {
                        return None;
                    }
                }
                Some(0)
            }
            Some(chain) => {
                let prefix_len = self.id.len() - 2;
                for pos in 0..prefix_len {
                    if self.id[2 + pos] != master.at(5 + pos) {
                        return None;
                    }
                }
                'parts: for (index, id) in chain.ids.iter().enumerate() {
                    for pos in prefix_len..id_len {
                        if id[2 + pos] != master.at(5 + pos) {
                            continue 'parts;
                        }
                    }
                    return Some(index);
                }
                None
            }
        }
    }

    /// Check whether this message's ID equals the other's (chains only
    /// match chains).
    pub fn check_id_of(&self, other: &Message) -> bool {
        if self.id_length() != other.id_length() {
            return false;
        }
        if (self.count() > 1) != (other.count() > 1) {
            return false;
        }
        let id = &self.id;
        if id.len() > other.id.len() {
            return false;
        }
        other.id[..id.len()] == id[..]
    }

    /// Prepare the escaped master data (including CRC) for sending.
    ///
    /// `input` carries the `;`-separated field values for write messages,
    /// `dst_address` overrides a SYN destination from the definition.
    pub fn prepare_master(
        &self,
        src_address: u8,
        input: &str,
        dst_address: Option<u8>,
        index: usize,
    ) -> Result<SymbolString> {
        if self.is_passive {
            return Err(Error::InvalidArg);
        }
        let dst = match dst_address {
            Some(dst) => dst,
            None => {
                if self.dst_address == SYN {
                    return Err(Error::InvalidAddr);
                }
                self.dst_address
            }
        };
        let mut master = SymbolString::new(false);
        master.push_back(src_address, false, false)?;
        master.push_back(dst, false, false)?;
        master.push_back(self.id[0], false, false)?;
        master.push_back(self.id[1], false, false)?;
        self.prepare_master_part(&mut master, input, index)?;
        self.store_last_data(PartType::Master, &master, index)?;
        let mut out = SymbolString::new(true);
        out.add_all(&master)?;
        Ok(out)
    }

    fn prepare_master_part(&self, master: &mut SymbolString, input: &str, index: usize) -> Result<()> {
        match &self.chain {
            None => {
                if index != 0 {
                    return Err(Error::NotFound);
                }
                let nn_pos = master.len();
                master.push_back(0, false, false)?; // NN patched below
                for &b in &self.id[2..] {
                    master.push_back(b, false, false)?;
                }
                self.data.write(PartType::Master, input, master)?;
                let nn = master.len() - nn_pos - 1;
                master.set(nn_pos, nn as u8);
                Ok(())
            }
            Some(chain) => {
                let count = chain.ids.len();
                if index >= count {
                    return Err(Error::NotFound);
                }
                let mut all_data = SymbolString::new(false);
                self.data.write(PartType::Master, input, &mut all_data)?;
                let (mut pos, mut add) = (0usize, 0usize);
                if self.is_write {
                    add = chain.lengths[0] as usize;
                    for i in 0..index {
                        pos += add;
                        add = chain.lengths[i + 1] as usize;
                    }
                }
                if pos + add > all_data.len() {
                    return Err(Error::InvalidPos);
                }
                let id = &chain.ids[index];
                master.push_back((id.len() - 2 + add) as u8, false, false)?;
                for &b in &id[2..] {
                    master.push_back(b, false, false)?;
                }
                for i in 0..add {
                    master.push_back(all_data.at(pos + i), false, false)?;
                }
                if index == 0 {
                    let mut state = self.state.lock().unwrap();
                    for i in 0..count {
                        state.chain_master_times[i] = None;
                        state.chain_slave_times[i] = None;
                    }
                }
                Ok(())
            }
        }
    }

    /// Prepare the escaped slave data (including CRC) for answering a
    /// request addressed to us.
    pub fn prepare_slave(&self, input: &str) -> Result<SymbolString> {
        if self.is_write {
            return Err(Error::InvalidArg);
        }
        let mut slave = SymbolString::new(false);
        slave.push_back(0, false, false)?; // NN patched below
        self.data.write(PartType::Slave, input, &mut slave)?;
        let nn = slave.len() - 1;
        slave.set(0, nn as u8);
        {
            let mut state = self.state.lock().unwrap();
            let now = SystemTime::now();
            state.last_update = Some(now);
            if state.last_slave != slave {
                state.last_change = Some(now);
                state.last_slave = slave.clone();
            }
        }
        let mut out = SymbolString::new(true);
        out.add_all(&slave)?;
        Ok(out)
    }

    /// Store a complete master+slave exchange in the cache.
    pub fn store_last_exchange(&self, master: &SymbolString, slave: &SymbolString) -> Result<bool> {
        let index = if self.chain.is_some() {
            self.check_id(master).ok_or(Error::InvalidArg)?
        } else {
            0
        };
        self.store_last_data(PartType::Master, master, index)?;
        self.store_last_data(PartType::Slave, slave, index)
    }

    /// Store last seen master or slave data for one part. Returns whether
    /// the stored data forms a complete message (always true for
    /// non-chained messages, for chains only when all parts were updated
    /// within the allowed time window).
    pub fn store_last_data(&self, part: PartType, data: &SymbolString, index: usize) -> Result<bool> {
        let now = SystemTime::now();
        let Some(chain) = &self.chain else {
            let mut state = self.state.lock().unwrap();
            state.last_update = Some(now);
            match part {
                PartType::Master => match data.compare_master(&state.last_master) {
                    MasterCompare::Different => {
                        state.last_change = Some(now);
                        state.last_master = data.clone();
                    }
                    MasterCompare::AddressOnly => {
                        state.last_master = data.clone();
                    }
                    MasterCompare::Equal => {}
                },
                PartType::Slave => {
                    if *data != state.last_slave {
                        state.last_change = Some(now);
                        state.last_slave = data.clone();
                    }
                }
            }
            return Ok(true);
        };

        let count = chain.ids.len();
        if index >= count {
            return Err(Error::InvalidArg);
        }
        let mut state = self.state.lock().unwrap();
        match part {
            PartType::Master => {
                if data.compare_master(&state.chain_masters[index]) != MasterCompare::Equal {
                    state.chain_masters[index] = data.clone();
                }
                state.chain_master_times[index] = Some(now);
            }
            PartType::Slave => {
                if *data != state.chain_slaves[index] {
                    state.chain_slaves[index] = data.clone();
                }
                state.chain_slave_times[index] = Some(now);
            }
        }
        // all parts must have arrived within the assembly window
        let mut min_time: Option<SystemTime> = None;
        let mut max_time: Option<SystemTime> = None;
        for i in 0..count {
            for time in [state.chain_master_times[i], state.chain_slave_times[i]] {
                let Some(time) = time else {
                    return Ok(false);
                };
                min_time = Some(min_time.map_or(time, |t| t.min(time)));
                max_time = Some(max_time.map_or(time, |t| t.max(time)));
            }
        }
        if let (Some(min), Some(max)) = (min_time, max_time) {
            if max.duration_since(min).unwrap_or_default() > chain.max_time_diff {
                return Ok(false);
            }
        }
        // assemble the combined telegram pair
        let mut master = SymbolString::new(false);
        let mut slave = SymbolString::new(false);
        let skip = 5 + (chain.ids[0].len() - 2);
        for i in 0..count {
            let add = &state.chain_masters[i];
            let end = (5 + add.at(4) as usize).min(add.len());
            let start = if i == 0 { 0 } else { skip };
            for pos in start..end {
                master.push_back(add.at(pos), false, false)?;
            }
            let add = &state.chain_slaves[i];
            let end = (1 + add.at(0) as usize).min(add.len());
            let start = if i == 0 { 0 } else { 1 };
            for pos in start..end {
                slave.push_back(add.at(pos), false, false)?;
            }
        }
        if master.len() < 5 || master.len() - 5 > 255 || slave.is_empty() || slave.len() - 1 > 255 {
            return Err(Error::InvalidPos);
        }
        let nn = (master.len() - 5) as u8;
        master.set(4, nn);
        let nn = (slave.len() - 1) as u8;
        slave.set(0, nn);
        state.last_update = Some(now);
        if master.compare_master(&state.last_master) == MasterCompare::Different
            || slave != state.last_slave
        {
            state.last_change = Some(now);
        }
        state.last_master = master;
        state.last_slave = slave;
        Ok(true)
    }

    /// Decode the cached data to `name=value` text.
    pub fn decode_last_data(
        &self,
        opts: OutputOpts,
        field_name: Option<&str>,
        field_index: i32,
    ) -> Result<String> {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        let id_extra = self.id_length();
        let found_master = self.data.read(
            PartType::Master,
            &state.last_master,
            id_extra,
            opts,
            field_name,
            field_index,
            &mut out,
        )?;
        if found_master && self.data.fields.iter().any(|f| f.part == PartType::Slave) {
            out.push(';');
        }
        let found_slave = self.data.read(
            PartType::Slave,
            &state.last_slave,
            0,
            opts,
            field_name,
            field_index,
            &mut out,
        )?;
        if found_master && !found_slave && out.ends_with(';') {
            out.pop();
        }
        if !found_master && !found_slave && field_name.is_some() {
            return Err(Error::NotFound);
        }
        Ok(out)
    }

    /// Decode the cached data into a JSON field object.
    pub fn decode_last_data_json(&self, numeric: bool) -> Result<serde_json::Map<String, serde_json::Value>> {
        let state = self.state.lock().unwrap();
        let mut out = serde_json::Map::new();
        self.data
            .read_json(PartType::Master, &state.last_master, self.id_length(), numeric, &mut out)?;
        self.data.read_json(PartType::Slave, &state.last_slave, 0, numeric, &mut out)?;
        Ok(out)
    }

    /// Decode a numeric field from the cached data to its machine value.
    pub fn decode_num_field(&self, field_name: Option<&str>) -> Result<Option<i64>> {
        let state = self.state.lock().unwrap();
        if let Some(value) =
            self.data.read_num(PartType::Master, &state.last_master, self.id_length(), field_name)?
        {
            return Ok(Some(value));
        }
        self.data.read_num(PartType::Slave, &state.last_slave, 0, field_name)
    }

    /// Decode a named field (or the first one) from the cached data to its
    /// display value.
    pub fn decode_field(&self, field_name: Option<&str>) -> Result<Option<super::field::FieldValue>> {
        let state = self.state.lock().unwrap();
        if let Some(value) =
            self.data.read_field(PartType::Master, &state.last_master, self.id_length(), field_name)?
        {
            return Ok(Some(value));
        }
        self.data.read_field(PartType::Slave, &state.last_slave, 0, field_name)
    }

    /// Run a closure on the cached state.
    pub fn with_state<R>(&self, f: impl FnOnce(&MessageState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().last_update
    }

    pub fn last_change(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().last_change
    }

    pub fn last_poll(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().last_poll
    }

    /// Drop the cached data (e.g. after a write invalidated the value).
    pub fn invalidate_cache(&self) {
        self.state.lock().unwrap().last_update = None;
    }

    /// Record a poll dispatch.
    pub fn mark_polled(&self) {
        let mut state = self.state.lock().unwrap();
        state.poll_count += 1;
        state.last_poll = Some(SystemTime::now());
    }

    /// The weighted poll priority; smaller weights are polled first.
    ///
    /// weight = priority * (1 + pollCount) - elapsed / (priority * pollInterval)
    ///
    /// so that higher-priority (numerically smaller) messages run more
    /// often while a long-unpolled message eventually overtakes anything.
    pub fn poll_weight(&self, poll_interval: Duration) -> f64 {
        let priority = self.poll_priority.load(Ordering::Relaxed) as f64;
        if priority <= 0.0 {
            return f64::MAX;
        }
        let state = self.state.lock().unwrap();
        let elapsed = state
            .last_poll
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or(Duration::from_secs(24 * 3600))
            .as_secs_f64();
        let interval = poll_interval.as_secs_f64().max(1.0);
        priority * (1.0 + state.poll_count as f64) - elapsed / (priority * interval)
    }

    /// Write the message definition in catalog column order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let kind = if self.is_passive {
            if self.is_write {
                "uw"
            } else {
                "u"
            }
        } else if self.is_write {
            "w"
        } else {
            "r"
        };
        out.push_str(kind);
        let priority = self.poll_priority.load(Ordering::Relaxed);
        if !self.is_passive && !self.is_write && priority > 0 {
            out.push_str(&priority.to_string());
        }
        out.push(',');
        out.push_str(&self.circuit);
        out.push(',');
        out.push_str(&self.name);
        out.push(',');
        out.push_str(&self.comment);
        out.push(',');
        if self.src_address != SYN {
            out.push_str(&format!("{:02x}", self.src_address));
        }
        out.push(',');
        if self.dst_address != SYN {
            out.push_str(&format!("{:02x}", self.dst_address));
        }
        out.push(',');
        out.push_str(&format!("{:02x}{:02x}", self.id[0], self.id[1]));
        out.push(',');
        match &self.chain {
            None => {
                for &b in &self.id[2..] {
                    out.push_str(&format!("{b:02x}"));
                }
            }
            Some(chain) => {
                for (i, id) in chain.ids.iter().enumerate() {
                    if i > 0 {
                        out.push(';');
                    }
                    for &b in &id[2..] {
                        out.push_str(&format!("{b:02x}"));
                    }
                    out.push_str(&format!(":{}", chain.lengths[i]));
                }
            }
        }
        out.push(',');
        self.data.dump(&mut out);
        out
    }
}

/// Compute the composite telegram key of a message definition.
fn compute_key(is_passive: bool, is_write: bool, src: u8, dst: u8, id: &[u8]) -> u64 {
    let mut key = ((id.len() - 2) as u64) << (8 * 7 + 5);
    if is_passive {
        key |= (master_number(src) as u64) << (8 * 7);
    } else {
        key |= (if is_write { 0x1Fu64 } else { 0x1Eu64 }) << (8 * 7);
    }
    key |= (dst as u64) << (8 * 6);
    let mut exp = 5u32;
    for &b in id {
        key ^= (b as u64) << (8 * exp);
        exp -= 1;
        if exp == 0 {
            exp = 3;
        }
    }
    key
}

/// Compute the lookup key of an observed master telegram with the given
/// ID length, optionally treating the destination as wildcard.
pub fn master_key(master: &SymbolString, id_length: usize, any_destination: bool) -> u64 {
    let mut key = (id_length as u64) << (8 * 7 + 5);
    key |= (master_number(master.at(0)) as u64) << (8 * 7);
    key |= (if any_destination { SYN } else { master.at(1) } as u64) << (8 * 6);
    key |= (master.at(2) as u64) << (8 * 5);
    key |= (master.at(3) as u64) << (8 * 4);
    let mut exp = 3u32;
    for i in 0..id_length {
        key ^= (master.at(5 + i) as u64) << (8 * exp);
        exp -= 1;
        if exp == 0 {
            exp = 3;
        }
    }
    key
}

/// The bits of the source-master part of a telegram key.
pub const ID_SOURCE_MASK: u64 = 0x1F << (8 * 7);

/// The source bits marking an active write message key.
pub const ID_SOURCE_ACTIVE_WRITE: u64 = 0x1F << (8 * 7);

/// The source bits marking an active read message key.
pub const ID_SOURCE_ACTIVE_READ: u64 = 0x1E << (8 * 7);

/// Sanity check used when adding: master destinations cannot take slave
/// data fields.
pub fn check_destination_kind(dst: u8, data: &FieldSet) -> Result<()> {
    if (dst == crate::constants::BROADCAST || is_master(dst))
        && data.fields.iter().any(|f| f.part == PartType::Slave)
    {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::field::{BaseType, SingleField};

    fn simple_fields() -> Arc<FieldSet> {
        Arc::new(FieldSet::new(vec![SingleField {
            name: "temp".into(),
            part: PartType::Slave,
            base: BaseType::D2b,
            length: 2,
            divisor: 0,
            unit: "°C".into(),
            comment: String::new(),
            values: None,
        }]))
    }

    #[test]
    fn test_key_layout() {
        let message = Message::new(
            "main", "temp", false, false, "", SYN, 0x08,
            vec![0x07, 0x04], simple_fields(), 0, None,
        );
        let key = message.key();
        assert_eq!(key >> (8 * 7 + 5), 0); // no extra id bytes
        assert_eq!((key >> (8 * 7)) & 0x1F, 0x1E); // active read
        assert_eq!((key >> (8 * 6)) & 0xFF, 0x08); // ZZ
        assert_eq!((key >> (8 * 5)) & 0xFF, 0x07); // PB
        assert_eq!((key >> (8 * 4)) & 0xFF, 0x04); // SB
    }

    #[test]
    fn test_master_key_matches_message_key() {
        let message = Message::new(
            "", "", false, false, "", SYN, 0x08,
            vec![0x07, 0x04, 0x12], simple_fields(), 0, None,
        );
        let mut master = SymbolString::new(false);
        master.parse_hex("ff0807040112", false).unwrap();
        let key = master_key(&master, 1, false);
        // source bits differ (active read vs passive QQ), the rest matches
        assert_eq!(key & !ID_SOURCE_MASK, message.key() & !ID_SOURCE_MASK);
    }

    #[test]
    fn test_check_id() {
        let message = Message::new(
            "", "", false, false, "", SYN, 0x08,
            vec![0x07, 0x04, 0x12], simple_fields(), 0, None,
        );
        let mut master = SymbolString::new(false);
        master.parse_hex("ff0807040112", false).unwrap();
        assert_eq!(message.check_id(&master), Some(0));
        let mut other = SymbolString::new(false);
        other.parse_hex("ff0807040113", false).unwrap();
        assert_eq!(message.check_id(&other), None);
    }

    #[test]
    fn test_prepare_master() {
        let message = Message::new(
            "main", "temp", false, false, "", SYN, 0x08,
            vec![0x07, 0x04], simple_fields(), 0, None,
        );
        let master = message.prepare_master(0xFF, "", None, 0).unwrap();
        // ff 08 07 04 00 crc
        assert_eq!(master.len(), 6);
        assert_eq!(master.at(0), 0xFF);
        assert_eq!(master.at(1), 0x08);
        assert_eq!(master.at(4), 0x00);
        assert_eq!(master.at(5), crate::ebus::symbol::crc_of(&[0xFF, 0x08, 0x07, 0x04, 0x00]));
    }

    #[test]
    fn test_store_and_decode() {
        let message = Message::new(
            "main", "temp", false, false, "", SYN, 0x08,
            vec![0x07, 0x04], simple_fields(), 0, None,
        );
        let mut master = SymbolString::new(false);
        master.parse_hex("ff08070400", false).unwrap();
        let mut slave = SymbolString::new(false);
        slave.parse_hex("020112", false).unwrap();
        assert!(message.store_last_exchange(&master, &slave).unwrap());
        let out = message.decode_last_data(OutputOpts::default(), None, -1).unwrap();
        assert_eq!(out, "temp=18.004");
        assert!(message.last_update().is_some());
    }
}
