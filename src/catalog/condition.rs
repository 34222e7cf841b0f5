//! Conditional message availability.
//!
//! A message may reference a condition that makes it visible only while a
//! field of another message holds one of the declared values. Conditions
//! are declared in the catalog files, bound to their referenced messages in
//! a second resolution pass, and evaluated against the referenced message's
//! cached data at runtime.

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex, Weak};

use super::message::Message;
use super::MessageMap;

/// The value check of a simple condition.
#[derive(Debug, Clone)]
pub enum ConditionValues {
    /// No values: the referenced message only has to have been seen.
    Seen,
    /// Inclusive numeric ranges the field value must fall into.
    NumRanges(Vec<(i64, i64)>),
    /// String values the field value must equal.
    Strings(Vec<String>),
}

/// A condition on the value of a single message field.
#[derive(Debug)]
pub struct SimpleCondition {
    pub name: String,
    pub circuit: String,
    /// The referenced message name, empty for the scan message.
    pub message_name: String,
    /// Destination override for messages without a fixed destination.
    pub dst_address: Option<u8>,
    /// The field to check, empty for the first field.
    pub field: String,
    pub values: ConditionValues,
    resolved: Mutex<Weak<Message>>,
}

impl SimpleCondition {
    pub fn new(
        name: &str,
        circuit: &str,
        message_name: &str,
        dst_address: Option<u8>,
        field: &str,
        values: ConditionValues,
    ) -> Self {
        SimpleCondition {
            name: name.to_string(),
            circuit: circuit.to_string(),
            message_name: message_name.to_string(),
            dst_address,
            field: field.to_string(),
            values,
            resolved: Mutex::new(Weak::new()),
        }
    }

    /// Derive a new condition from this one with another value list
    /// (on-the-fly conditions written as `[name=value]`).
    pub fn derive(&self, value_list: &str) -> Result<SimpleCondition> {
        let values = parse_condition_values(value_list)?;
        Ok(SimpleCondition::new(
            &format!("{}{}", self.name, value_list),
            &self.circuit,
            &self.message_name,
            self.dst_address,
            &self.field,
            values,
        ))
    }

    /// Bind the referenced message. The referenced message is granted an
    /// implicit poll priority so its value gets refreshed even without
    /// explicit configuration.
    pub fn resolve(&self, messages: &mut MessageMap) -> Result<()> {
        let message = if self.message_name.is_empty() {
            let dst = self.dst_address.ok_or(Error::InvalidAddr)?;
            messages.get_scan_message(Some(dst)).ok_or(Error::NotFound)?
        } else {
            let found = messages
                .find_by_name(&self.circuit, &self.message_name, false, false)
                .or_else(|| messages.find_by_name(&self.circuit, &self.message_name, false, true))
                .ok_or(Error::NotFound)?;
            match self.dst_address {
                Some(dst) if found.dst_address() != dst => {
                    messages.get_or_derive(&found, dst)
                }
                _ => found,
            }
        };
        if !self.field.is_empty() && !message.has_field(Some(&self.field), self.is_numeric()) {
            return Err(Error::NotFound);
        }
        message.set_used_by_condition();
        if !message.is_passive() {
            messages.add_poll_message(&message, true);
        }
        *self.resolved.lock().unwrap() = Arc::downgrade(&message);
        Ok(())
    }

    fn is_numeric(&self) -> bool {
        !matches!(self.values, ConditionValues::Strings(_))
    }

    /// Evaluate the condition against the referenced message's cache.
    pub fn is_true(&self) -> bool {
        self.check()
    }

    fn check(&self) -> bool {
        let Some(message) = self.resolved.lock().unwrap().upgrade() else {
            return false;
        };
        if message.last_update().is_none() {
            return false;
        }
        let field = if self.field.is_empty() { None } else { Some(self.field.as_str()) };
        match &self.values {
            ConditionValues::Seen => true,
            ConditionValues::NumRanges(ranges) => {
                let Ok(Some(value)) = message.decode_num_field(field) else {
                    return false;
                };
                ranges.iter().any(|&(from, to)| value >= from && value <= to)
            }
            ConditionValues::Strings(values) => {
                let Ok(Some(value)) = message.decode_field(field) else {
                    return false;
                };
                let text = value.to_string();
                values.iter().any(|v| v.eq_ignore_ascii_case(&text))
            }
        }
    }
}

/// A single condition or a logical AND of several.
#[derive(Debug)]
pub enum Condition {
    Simple(SimpleCondition),
    Combined(Vec<Arc<Condition>>),
}

impl Condition {
    /// Resolve the referenced message(s), detecting reference cycles.
    pub fn resolve(&self, messages: &mut MessageMap) -> Result<()> {
        match self {
            Condition::Simple(c) => c.resolve(messages),
            Condition::Combined(parts) => {
                for part in parts {
                    part.resolve(messages)?;
                }
                Ok(())
            }
        }
    }

    /// Check and return whether this condition is fulfilled.
    pub fn is_true(&self) -> bool {
        match self {
            Condition::Simple(c) => c.is_true(),
            Condition::Combined(parts) => parts.iter().all(|p| p.is_true()),
        }
    }

    /// The circuit/name pairs of the referenced messages, for cycle
    /// detection at load time.
    pub fn references(&self, out: &mut Vec<(String, String)>) {
        match self {
            Condition::Simple(c) => {
                out.push((c.circuit.to_lowercase(), c.message_name.to_lowercase()))
            }
            Condition::Combined(parts) => {
                for part in parts {
                    part.references(out);
                }
            }
        }
    }

    /// Write the condition definition in catalog form.
    pub fn dump(&self) -> String {
        match self {
            Condition::Simple(c) => format!("[{}]", c.name),
            Condition::Combined(parts) => parts.iter().map(|p| p.dump()).collect(),
        }
    }
}

/// Parse a condition value list: numeric ranges `1;3;5-7` or quoted
/// strings `'a';'b'`, or the comparison forms `=5`, `<10`, `>=3`.
pub fn parse_condition_values(input: &str) -> Result<ConditionValues> {
    let input = input.trim().trim_start_matches('=');
    if input.is_empty() {
        return Ok(ConditionValues::Seen);
    }
    if input.contains('\'') {
        let values: Vec<String> = input
            .split(';')
            .map(|s| s.trim().trim_matches('\'').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if values.is_empty() {
            return Err(Error::InvalidList);
        }
        return Ok(ConditionValues::Strings(values));
    }
    let mut ranges = Vec::new();
    for part in input.split(';') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::InvalidList);
        }
        if let Some(rest) = part.strip_prefix(">=") {
            let from: i64 = rest.trim().parse().map_err(|_| Error::InvalidNum)?;
            ranges.push((from, i64::MAX));
        } else if let Some(rest) = part.strip_prefix("<=") {
            let to: i64 = rest.trim().parse().map_err(|_| Error::InvalidNum)?;
            ranges.push((i64::MIN, to));
        } else if let Some(rest) = part.strip_prefix('>') {
            let from: i64 = rest.trim().parse().map_err(|_| Error::InvalidNum)?;
            ranges.push((from + 1, i64::MAX));
        } else if let Some(rest) = part.strip_prefix('<') {
            let to: i64 = rest.trim().parse().map_err(|_| Error::InvalidNum)?;
            ranges.push((i64::MIN, to - 1));
        } else if let Some((from, to)) = part.split_once('-').filter(|(f, _)| !f.is_empty()) {
            let from: i64 = from.trim().parse().map_err(|_| Error::InvalidNum)?;
            let to: i64 = to.trim().parse().map_err(|_| Error::InvalidNum)?;
            ranges.push((from, to));
        } else {
            let value: i64 = part.parse().map_err(|_| Error::InvalidNum)?;
            ranges.push((value, value));
        }
    }
    Ok(ConditionValues::NumRanges(ranges))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        match parse_condition_values("1;3;5-7").unwrap() {
            ConditionValues::NumRanges(r) => assert_eq!(r, vec![(1, 1), (3, 3), (5, 7)]),
            _ => panic!("expected ranges"),
        }
        match parse_condition_values("'VR630'").unwrap() {
            ConditionValues::Strings(s) => assert_eq!(s, vec!["VR630"]),
            _ => panic!("expected strings"),
        }
        assert!(matches!(parse_condition_values("").unwrap(), ConditionValues::Seen));
        match parse_condition_values(">=10").unwrap() {
            ConditionValues::NumRanges(r) => assert_eq!(r, vec![(10, i64::MAX)]),
            _ => panic!("expected ranges"),
        }
    }
}
