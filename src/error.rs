//! # eBUS Error Handling
//!
//! This module defines the [`Error`] enum used throughout the crate, one
//! variant per failure class of the bus protocol, the message catalog, and
//! the client interface.

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents the different error classes that can occur on the bus and in
/// the message catalog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic device error (port gone, I/O failure).
    #[error("ERR: generic device error: {0}")]
    Device(String),

    /// A symbol could not be written to the bus.
    #[error("ERR: send error")]
    Send,

    /// No signal on the bus.
    #[error("ERR: no signal")]
    NoSignal,

    /// A receive operation timed out.
    #[error("ERR: read timeout")]
    Timeout,

    /// An unexpected SYN symbol was received mid-frame.
    #[error("ERR: SYN received")]
    Syn,

    /// An invalid escape sequence was received.
    #[error("ERR: invalid escape sequence")]
    Esc,

    /// The received CRC did not match the calculated one.
    #[error("ERR: CRC error")]
    Crc,

    /// An unexpected symbol was received instead of ACK/NAK.
    #[error("ERR: ACK error")]
    Ack,

    /// The peer answered with NAK twice.
    #[error("ERR: NAK received")]
    Nak,

    /// Arbitration was lost to another master (retryable).
    #[error("ERR: arbitration lost")]
    BusLost,

    /// An invalid bus address was given.
    #[error("ERR: invalid address")]
    InvalidAddr,

    /// An invalid argument was given.
    #[error("ERR: invalid argument")]
    InvalidArg,

    /// An invalid numeric argument was given.
    #[error("ERR: invalid numeric argument")]
    InvalidNum,

    /// An invalid byte or field position was given.
    #[error("ERR: invalid position")]
    InvalidPos,

    /// An argument value is outside the valid range of the data type.
    #[error("ERR: argument value out of valid range")]
    OutOfRange,

    /// An invalid value list or range was given.
    #[error("ERR: invalid value list")]
    InvalidList,

    /// The element (message, field, file) was not found.
    #[error("ERR: element not found")]
    NotFound,

    /// The end of input was reached.
    #[error("ERR: end of input reached")]
    Eof,

    /// A message with the same telegram key already exists.
    #[error("ERR: duplicate entry")]
    Duplicate,

    /// A message with the same circuit and name already exists.
    #[error("ERR: duplicate name")]
    DuplicateName,
}

impl Error {
    /// Returns whether the error is fatal to the whole connection rather
    /// than just the current request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Device(_) | Error::Send | Error::NoSignal)
    }

    /// Returns whether a request failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BusLost | Error::Timeout | Error::Crc | Error::Nak)
    }
}
