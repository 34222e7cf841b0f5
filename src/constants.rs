//! eBUS Protocol Constants
//!
//! This module defines the symbols and timing parameters of the eBUS
//! protocol (2400 Bd, 8N1, multi-master with address-byte arbitration).

/// Escape symbol, followed by 0x00 for the value 0xA9 or 0x01 for the value 0xAA.
pub const ESC: u8 = 0xA9;

/// Synchronization symbol marking the inter-frame idle state.
pub const SYN: u8 = 0xAA;

/// Positive acknowledge.
pub const ACK: u8 = 0x00;

/// Negative acknowledge.
pub const NAK: u8 = 0xFF;

/// The broadcast destination address.
pub const BROADCAST: u8 = 0xFE;

/// The maximum duration of a single symbol in microseconds
/// (start + 8 bit + stop + extra at 2400 Bd - 2*1.2%).
pub const SYMBOL_DURATION: u64 = 4700;

/// The maximum allowed time in microseconds for retrieving back a sent
/// symbol (two symbol durations, the bus echoes every transmission).
pub const SEND_TIMEOUT: u64 = 2 * SYMBOL_DURATION;

/// The maximum allowed time in microseconds between two AUTO-SYN symbols
/// (45 ms + 2*1.2% + 1 symbol).
pub const SYN_TIMEOUT: u64 = 50_800;

/// The time in microseconds for determining bus signal availability
/// (AUTO-SYN timeout * 5).
pub const SIGNAL_TIMEOUT: u64 = 250_000;

/// The default time in microseconds for retrieving a symbol from an
/// addressed slave.
pub const SLAVE_RECV_TIMEOUT: u64 = 15_000;

/// The default maximum time in microseconds for bus acquisition.
pub const BUS_ACQUIRE_TIMEOUT: u64 = 10_000;

/// The default number of times a send is repeated due to lost arbitration.
pub const BUS_LOST_RETRIES: u32 = 2;

/// The default number of times a failed send is repeated
/// (other than lost arbitration).
pub const FAILED_SEND_RETRIES: u32 = 1;

/// The default interval in seconds in which poll messages are cycled.
pub const POLL_INTERVAL: u64 = 5;

/// The default own master address.
pub const OWN_MASTER_ADDRESS: u8 = 0xFF;

/// The maximum allowed data bytes (NN) in a single telegram part.
pub const MAX_DATA_LEN: usize = 16;

/// The maximum length of the command ID bytes (in addition to PB/SB)
/// for which the telegram key is distinct.
pub const MAX_ID_KEYLEN: usize = 4;

/// The poll priority assigned to a message referred to by a condition.
pub const POLL_PRIORITY_CONDITION: u8 = 5;

/// The string used for answering a scan identification request (07 04).
pub const SCAN_ANSWER: &str = "ebusd.eu;ebus-rs;0.3;100";
