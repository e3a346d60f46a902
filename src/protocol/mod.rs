//! Protocol module - line syntax, escaping, and buffering.
//!
//! This module implements the textual wire protocol shared by both peer
//! roles:
//! - Percent escaping for inline data payloads
//! - Reply and command line parsing
//! - Line accumulation and outbound `D`-line splitting

mod line_buffer;
mod wire;

pub use line_buffer::{DataLineWriter, LineScanner};
pub use wire::{
    decode_percent, escaped_len, push_escaped, Command, Reply, MAX_LINELEN, MAX_PAYLOAD,
};
