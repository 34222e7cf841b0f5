//! The net module contains the TCP front-end: the text command protocol,
//! the connection handling, and the minimal HTTP JSON interface.

pub mod client;
pub mod http;
pub mod server;

pub use client::{execute, CommandContext, Outcome};
