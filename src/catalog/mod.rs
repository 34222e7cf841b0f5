//! The message catalog.
//!
//! [`MessageMap`] holds all known message definitions under three indexes:
//! by composite telegram key, by lowercase (circuit, name), and the set of
//! messages with polling enabled. It owns the synthetic scan message
//! (PB 0x07, SB 0x04) and its per-address derivations, the condition
//! definitions, and the record of configuration files loaded per slave.

pub mod condition;
pub mod csv;
pub mod field;
pub mod message;

use crate::constants::SYN;
use crate::ebus::address::{is_master, is_valid_address};
use crate::ebus::symbol::SymbolString;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use condition::Condition;
use field::{BaseType, FieldSet, PartType, SingleField};
use message::{Message, ID_SOURCE_ACTIVE_READ, ID_SOURCE_ACTIVE_WRITE, ID_SOURCE_MASK};

/// The slave data layout of the identification telegram: the responding
/// device sends its manufacturer, id, and software/hardware revisions as a
/// semicolon-joined ASCII string.
static IDENT_FIELDS: Lazy<Arc<FieldSet>> = Lazy::new(|| {
    Arc::new(FieldSet::new(vec![SingleField {
        name: "ident".into(),
        part: PartType::Slave,
        base: BaseType::Str,
        length: 0,
        divisor: 0,
        unit: String::new(),
        comment: "device identification".into(),
        values: None,
    }]))
});

/// Holds all known message definitions.
pub struct MessageMap {
    /// Whether to add all messages, even if duplicate.
    add_all: bool,
    scan_message: Arc<Message>,
    by_key: HashMap<u64, Vec<Arc<Message>>>,
    by_name: HashMap<String, Vec<Arc<Message>>>,
    poll_messages: Mutex<Vec<Arc<Message>>>,
    conditions: HashMap<String, Arc<Condition>>,
    loaded_files: HashMap<u8, String>,
    max_id_length: usize,
    message_count: usize,
    conditional_count: usize,
    passive_count: usize,
}

impl MessageMap {
    /// Construct a new catalog holding only the scan message.
    pub fn new(add_all: bool) -> Self {
        let scan_message = Message::new(
            "scan",
            "ident",
            false,
            false,
            "",
            SYN,
            SYN,
            vec![0x07, 0x04],
            IDENT_FIELDS.clone(),
            0,
            None,
        );
        let mut map = MessageMap {
            add_all,
            scan_message: scan_message.clone(),
            by_key: HashMap::new(),
            by_name: HashMap::new(),
            poll_messages: Mutex::new(Vec::new()),
            conditions: HashMap::new(),
            loaded_files: HashMap::new(),
            max_id_length: 0,
            message_count: 0,
            conditional_count: 0,
            passive_count: 0,
        };
        map.by_key.insert(scan_message.key(), vec![scan_message]);
        map
    }

    fn first_available(messages: &[Arc<Message>], master: Option<&SymbolString>) -> Option<Arc<Message>> {
        messages
            .iter()
            .find(|m| master.map_or(true, |data| m.check_id(data).is_some()) && m.is_available())
            .cloned()
    }

    /// Add a message definition to the catalog.
    pub fn add(&mut self, message: Arc<Message>, store_by_name: bool) -> Result<()> {
        let key = message.key();
        let conditional = message.is_conditional();
        if !self.add_all {
            if let Some(existing) = self.by_key.get(&key) {
                if let Some(other) = existing.iter().find(|m| m.check_id_of(&message)) {
                    if !conditional || !other.is_conditional() {
                        return Err(Error::Duplicate);
                    }
                }
            }
        }
        if store_by_name {
            let prefix = if message.is_passive() {
                "P"
            } else if message.is_write() {
                "W"
            } else {
                "R"
            };
            let circuit = message.circuit().to_lowercase();
            let name = message.name().to_lowercase();
            let name_key = format!("{prefix}{circuit},{name}");
            if !self.add_all {
                if let Some(existing) = self.by_name.get(&name_key) {
                    if !conditional || !existing.first().is_some_and(|m| m.is_conditional()) {
                        return Err(Error::DuplicateName);
                    }
                }
            }
            self.by_name.entry(name_key).or_default().push(message.clone());

            // the first message per bare name is reachable without circuit
            let bare_key = format!("-{prefix}{name}");
            match self.by_name.get_mut(&bare_key) {
                None => {
                    self.by_name.insert(bare_key, vec![message.clone()]);
                }
                Some(list) => {
                    let first_circuit = list[0].circuit().to_lowercase();
                    if circuit < first_circuit {
                        list[0] = message.clone();
                    } else if self.add_all || (conditional && list[0].is_conditional()) {
                        list.push(message.clone());
                    }
                }
            }
            self.message_count += 1;
            if conditional {
                self.conditional_count += 1;
            }
            if message.is_passive() {
                self.passive_count += 1;
            }
            self.add_poll_message(&message, false);
        }
        self.max_id_length = self.max_id_length.max(message.id_length());
        self.by_key.entry(key).or_default().push(message);
        Ok(())
    }

    /// Get the stored messages for a telegram key.
    pub fn get_by_key(&self, key: u64) -> Option<&Vec<Arc<Message>>> {
        self.by_key.get(&key)
    }

    /// Find the message for the given circuit and name. An empty circuit
    /// falls back to the first message registered under the bare name.
    pub fn find_by_name(
        &self,
        circuit: &str,
        name: &str,
        is_write: bool,
        is_passive: bool,
    ) -> Option<Arc<Message>> {
        let prefix = if is_passive {
            "P"
        } else if is_write {
            "W"
        } else {
            "R"
        };
        let circuit = circuit.to_lowercase();
        let name = name.to_lowercase();
        let exact = format!("{prefix}{circuit},{name}");
        if let Some(messages) = self.by_name.get(&exact) {
            if let Some(found) = Self::first_available(messages, None) {
                return Some(found);
            }
        }
        if circuit.is_empty() {
            let bare = format!("-{prefix}{name}");
            if let Some(messages) = self.by_name.get(&bare) {
                return Self::first_available(messages, None);
            }
        }
        None
    }

    /// Find all messages matching the circuit and name filters.
    pub fn find_all(
        &self,
        circuit: &str,
        name: &str,
        complete_match: bool,
        with_read: bool,
        with_write: bool,
        with_passive: bool,
    ) -> Vec<Arc<Message>> {
        let circuit = circuit.to_lowercase();
        let name = name.to_lowercase();
        let mut keys: Vec<&String> = self.by_name.keys().filter(|k| !k.starts_with('-')).collect();
        keys.sort();
        let mut out = Vec::new();
        for key in keys {
            let Some(message) = Self::first_available(&self.by_name[key], None) else {
                continue;
            };
            if !circuit.is_empty() {
                let check = message.circuit().to_lowercase();
                let matched = if complete_match { check == circuit } else { check.contains(&circuit) };
                if !matched {
                    continue;
                }
            }
            if !name.is_empty() {
                let check = message.name().to_lowercase();
                let matched = if complete_match { check == name } else { check.contains(&name) };
                if !matched {
                    continue;
                }
            }
            if message.is_passive() {
                if !with_passive {
                    continue;
                }
            } else if message.is_write() {
                if !with_write {
                    continue;
                }
            } else if !with_read {
                continue;
            }
            out.push(message);
        }
        out
    }

    /// Find the message matching the unescaped master data, trying the
    /// longest declared ID first and the wildcard source/kind variants in
    /// the order passive, active read, active write.
    pub fn find_for_master(
        &self,
        master: &SymbolString,
        any_destination: bool,
        with_read: bool,
        with_write: bool,
        with_passive: bool,
    ) -> Option<Arc<Message>> {
        if master.len() < 5 {
            return None;
        }
        let max_id_length = (master.at(4) as usize).min(self.max_id_length);
        if master.len() < 5 + max_id_length {
            return None;
        }
        if max_id_length == 0 && any_destination && master.at(2) == 0x07 && master.at(3) == 0x04 {
            return Some(self.scan_message.clone());
        }
        for id_length in (0..=max_id_length).rev() {
            let mut key = message::master_key(master, id_length, any_destination);
            if with_passive {
                if let Some(messages) = self.by_key.get(&key) {
                    if let Some(found) = Self::first_available(messages, Some(master)) {
                        return Some(found);
                    }
                }
                if key & ID_SOURCE_MASK != 0 {
                    key &= !ID_SOURCE_MASK;
                    // try again without the specific source master
                    if let Some(messages) = self.by_key.get(&key) {
                        if let Some(found) = Self::first_available(messages, Some(master)) {
                            return Some(found);
                        }
                    }
                }
            } else {
                key &= !ID_SOURCE_MASK;
            }
            if with_read {
                if let Some(messages) = self.by_key.get(&(key | ID_SOURCE_ACTIVE_READ)) {
                    if let Some(found) = Self::first_available(messages, Some(master)) {
                        return Some(found);
                    }
                }
            }
            if with_write {
                if let Some(messages) = self.by_key.get(&(key | ID_SOURCE_ACTIVE_WRITE)) {
                    if let Some(found) = Self::first_available(messages, Some(master)) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    /// Get the scan message, or its derivation for a concrete slave
    /// address (created on first use).
    pub fn get_scan_message(&mut self, dst_address: Option<u8>) -> Option<Arc<Message>> {
        let Some(dst) = dst_address else {
            return Some(self.scan_message.clone());
        };
        if dst == SYN {
            return Some(self.scan_message.clone());
        }
        if !is_valid_address(dst, false) || is_master(dst) {
            return None;
        }
        let key = self.scan_message.derived_key(dst);
        if let Some(messages) = self.by_key.get(&key) {
            if let Some(first) = messages.first() {
                return Some(first.clone());
            }
        }
        let message = self.scan_message.derive_extended(dst);
        let _ = self.add(message.clone(), false);
        Some(message)
    }

    /// The base scan message.
    pub fn scan_message(&self) -> &Arc<Message> {
        &self.scan_message
    }

    /// Look up an existing per-address scan derivation without creating one.
    pub fn scan_message_for(&self, dst_address: u8) -> Option<Arc<Message>> {
        let key = self.scan_message.derived_key(dst_address);
        self.by_key.get(&key).and_then(|messages| messages.first().cloned())
    }

    /// Returns whether the message is the shared scan definition (whose
    /// cache must never be invalidated by client writes).
    pub fn is_scan_message(&self, message: &Arc<Message>) -> bool {
        Arc::ptr_eq(message, &self.scan_message)
            || Arc::ptr_eq(message.data(), self.scan_message.data())
    }

    /// Add a named condition definition.
    pub fn add_condition(&mut self, key: String, condition: Arc<Condition>) -> Result<()> {
        if self.conditions.contains_key(&key) {
            return Err(Error::DuplicateName);
        }
        self.conditions.insert(key, condition);
        Ok(())
    }

    /// Look up a condition by its file-scoped key.
    pub fn get_condition(&self, key: &str) -> Option<Arc<Condition>> {
        self.conditions.get(key).cloned()
    }

    pub fn size_conditions(&self) -> usize {
        self.conditions.len()
    }

    /// Resolve all conditions: bind the referenced messages and reject
    /// reference cycles.
    pub fn resolve_conditions(&mut self) -> Result<()> {
        self.detect_condition_cycles()?;
        let conditions: Vec<Arc<Condition>> = self.conditions.values().cloned().collect();
        let mut result = Ok(());
        for condition in conditions {
            if let Err(e) = condition.resolve(self) {
                log::error!("main: unable to resolve condition {}: {e}", condition.dump());
                result = Err(e);
            }
        }
        result
    }

    /// Conditions and messages form a reference graph that must stay
    /// acyclic: a condition referencing a message whose own condition
    /// (transitively) references the first message back is rejected.
    fn detect_condition_cycles(&self) -> Result<()> {
        // edges: conditional message -> messages referenced by its condition
        let mut edges: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
        for messages in self.by_name.values() {
            for message in messages {
                if let Some(condition) = message.condition() {
                    let mut refs = Vec::new();
                    condition.references(&mut refs);
                    edges
                        .entry((message.circuit().to_lowercase(), message.name().to_lowercase()))
                        .or_default()
                        .extend(refs);
                }
            }
        }
        let mut visited: HashMap<(String, String), u8> = HashMap::new(); // 1=in stack, 2=done
        fn visit(
            node: &(String, String),
            edges: &HashMap<(String, String), Vec<(String, String)>>,
            visited: &mut HashMap<(String, String), u8>,
        ) -> Result<()> {
            match visited.get(node) {
                Some(1) => return Err(Error::InvalidList),
                Some(2) => return Ok(()),
                _ => {}
            }
            visited.insert(node.clone(), 1);
            if let Some(next) = edges.get(node) {
                for n in next {
                    visit(n, edges, visited)?;
                }
            }
            visited.insert(node.clone(), 2);
            Ok(())
        }
        for node in edges.keys() {
            visit(node, &edges, &mut visited)?;
        }
        Ok(())
    }

    /// Get or create a derivation of the message for another destination.
    pub fn get_or_derive(&mut self, message: &Arc<Message>, dst_address: u8) -> Arc<Message> {
        let key = message.derived_key(dst_address);
        if let Some(messages) = self.by_key.get(&key) {
            if let Some(found) = messages.iter().find(|m| m.check_id_of(message)) {
                return found.clone();
            }
        }
        let derived = message.derive(dst_address, None, "");
        let _ = self.add(derived.clone(), false);
        derived
    }

    /// Invalidate the cached data of the message and of all other messages
    /// with the same name in the same base circuit.
    pub fn invalidate_cache(&self, message: &Arc<Message>) {
        if self.is_scan_message(message) {
            return;
        }
        message.invalidate_cache();
        let mut circuit = message.circuit().to_string();
        if let Some(pos) = circuit.find('#') {
            circuit.truncate(pos);
        }
        let name = message.name();
        for check in self.find_all(&circuit, name, false, true, true, true) {
            if Arc::ptr_eq(&check, message) || check.name() != name {
                continue;
            }
            let mut check_circuit = check.circuit().to_string();
            if let Some(pos) = check_circuit.find('#') {
                check_circuit.truncate(pos);
            }
            if check_circuit == circuit {
                check.invalidate_cache();
            }
        }
    }

    /// Register a message for polling. With `to_front` set the message is
    /// treated as never polled so it runs at the next opportunity.
    pub fn add_poll_message(&self, message: &Arc<Message>, to_front: bool) {
        if message.poll_priority() == 0 {
            return;
        }
        let mut poll = self.poll_messages.lock().unwrap();
        if !poll.iter().any(|m| Arc::ptr_eq(m, message)) {
            if to_front {
                poll.insert(0, message.clone());
            } else {
                poll.push(message.clone());
            }
        }
    }

    /// The number of messages registered for polling.
    pub fn size_poll(&self) -> usize {
        self.poll_messages.lock().unwrap().len()
    }

    /// Pop the most urgent available poll message by weighted priority,
    /// stamp its poll bookkeeping, and return it.
    pub fn next_poll(&self, poll_interval: Duration) -> Option<Arc<Message>> {
        let poll = self.poll_messages.lock().unwrap();
        let next = poll
            .iter()
            .filter(|m| m.poll_priority() > 0 && m.is_available())
            .min_by(|a, b| {
                a.poll_weight(poll_interval)
                    .partial_cmp(&b.poll_weight(poll_interval))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.poll_priority().cmp(&b.poll_priority()))
            })?
            .clone();
        next.mark_polled();
        Some(next)
    }

    /// Record a configuration file loaded for a participant.
    pub fn add_loaded_file(&mut self, address: u8, file: &str) {
        if file.is_empty() {
            return;
        }
        let entry = self.loaded_files.entry(address).or_default();
        if entry.is_empty() {
            *entry = format!("\"{file}\"");
        } else {
            entry.push_str(&format!(", \"{file}\""));
        }
    }

    /// The configuration files loaded for a participant.
    pub fn loaded_files(&self, address: u8) -> String {
        self.loaded_files.get(&address).cloned().unwrap_or_default()
    }

    /// The number of stored messages.
    pub fn size(&self) -> usize {
        self.message_count
    }

    pub fn size_conditional(&self) -> usize {
        self.conditional_count
    }

    pub fn size_passive(&self) -> usize {
        self.passive_count
    }

    /// The maximum extra ID length of any stored message.
    pub fn max_id_length(&self) -> usize {
        self.max_id_length
    }

    /// Dump all message definitions in catalog column order.
    pub fn dump(&self) -> String {
        let mut keys: Vec<&String> = self.by_name.keys().filter(|k| !k.starts_with('-')).collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            let messages = &self.by_name[key];
            if self.add_all {
                for message in messages {
                    out.push_str(&message.dump());
                    out.push('\n');
                }
            } else if let Some(message) = Self::first_available(messages, None) {
                out.push_str(&message.dump());
                out.push('\n');
            }
        }
        out
    }
}

impl Default for MessageMap {
    fn default() -> Self {
        MessageMap::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_message(circuit: &str, name: &str, id: Vec<u8>) -> Arc<Message> {
        Message::new(circuit, name, false, false, "", SYN, 0x08, id, IDENT_FIELDS.clone(), 0, None)
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut map = MessageMap::new(false);
        map.add(read_message("main", "a", vec![0x01, 0x02]), true).unwrap();
        assert_eq!(
            map.add(read_message("other", "b", vec![0x01, 0x02]), true),
            Err(Error::Duplicate)
        );
    }

    #[test]
    fn test_duplicate_key_allowed_with_add_all() {
        let mut map = MessageMap::new(true);
        map.add(read_message("main", "a", vec![0x01, 0x02]), true).unwrap();
        map.add(read_message("other", "b", vec![0x01, 0x02]), true).unwrap();
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn test_find_by_name_without_circuit() {
        let mut map = MessageMap::new(false);
        map.add(read_message("main", "temp", vec![0x01, 0x02]), true).unwrap();
        assert!(map.find_by_name("", "temp", false, false).is_some());
        assert!(map.find_by_name("main", "temp", false, false).is_some());
        assert!(map.find_by_name("other", "temp", false, false).is_none());
    }

    #[test]
    fn test_find_for_master_prefers_exact_destination() {
        let mut map = MessageMap::new(false);
        let message = read_message("main", "temp", vec![0x01, 0x02]);
        map.add(message.clone(), true).unwrap();
        let mut master = SymbolString::new(false);
        master.parse_hex("ff08010200", false).unwrap();
        let found = map.find_for_master(&master, false, true, true, true).unwrap();
        assert!(Arc::ptr_eq(&found, &message));
    }

    #[test]
    fn test_scan_message_lookup() {
        let map = MessageMap::new(false);
        let mut master = SymbolString::new(false);
        master.parse_hex("ff08070400", false).unwrap();
        let found = map.find_for_master(&master, true, true, true, true).unwrap();
        assert!(map.is_scan_message(&found));
    }

    #[test]
    fn test_scan_message_derivation() {
        let mut map = MessageMap::new(false);
        let derived = map.get_scan_message(Some(0x08)).unwrap();
        assert_eq!(derived.dst_address(), 0x08);
        assert_eq!(derived.circuit(), "scan.08");
        let again = map.get_scan_message(Some(0x08)).unwrap();
        assert!(Arc::ptr_eq(&derived, &again));
        assert!(map.get_scan_message(Some(0x10)).is_none()); // master address
    }
}
