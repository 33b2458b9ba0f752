// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event codec, type catalog and client runtime.

pub mod client;
pub mod codec;
pub mod types;

pub use client::EventConn;
pub use codec::{decode_event, encode_event, pack_length, unpack_length};
pub use types::{
    AckCode, ChannelFilter, ChannelStatus, ChannelUpdate, Event, FirmwareBlock, FirmwareProgress,
    NodeFirmware, NodeUpdate, ProgressReport,
};

use thiserror::Error;

/// Event codec and client errors.
#[derive(Debug, Error)]
pub enum EventError {
    /// Payload shorter than its schema requires.
    #[error("missing data for value decoder")]
    ShortPayload,
    /// Length prefix with an unsupported width nibble.
    #[error("wrong byte length in event decoding (got {0:#x})")]
    InvalidLengthWidth(u8),
    /// Type byte outside the closed event set.
    #[error("unprocessable event type {0}")]
    UnknownEvent(u8),
    /// Channel name above the 64-byte wire limit.
    #[error("channel name exceeds 64 bytes")]
    NameTooLong,
    /// Semantically invalid content.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// The connection is gone.
    #[error("connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
