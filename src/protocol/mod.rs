//! Protocol-level building blocks shared by every listener: the bounded
//! line reader, the RFC-5321-style path parser, and the allowed-hosts
//! policy matcher.

pub mod address;
pub mod allowed_hosts;
pub mod reader;

pub use address::{parse_path, Address, ParseError as AddressParseError};
pub use allowed_hosts::AllowedHosts;
pub use reader::{BoundedReader, ReadLineError};

/// Per spec §4.A / §6: command lines are capped at 1024 bytes.
pub const MAX_COMMAND_LINE_LEN: usize = 1024;

/// Per spec §6: the verb token itself is capped at 16 bytes.
pub const MAX_VERB_LEN: usize = 16;

/// Per spec §3 invariant 3: DATA is allowed to run `max_size + 1 MiB` before
/// the reader itself gives up, distinguishing a runaway client from a
/// legitimately oversized message (which is rejected after the fact with
/// the proper SMTP reply instead of by severing the connection mid-read).
pub const DATA_READ_CEILING_SLACK: usize = 1024 * 1024;
