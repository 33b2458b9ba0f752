// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CAN frame codec, NoCAN message model and segmented-frame reassembly.

pub mod frame;
pub mod message;
pub mod reassembly;

pub use frame::{CanFrame, CANID_MASK_ERROR, CANID_MASK_EXTENDED, CANID_MASK_REMOTE};
pub use message::{
    ChannelId, Message, NodeId, MAX_MESSAGE_SIZE, MAX_NODE_COUNT, UNDEFINED_CHANNEL,
};
pub use reassembly::{Ingest, Reassembler, ReassemblyError};

use thiserror::Error;

/// CAN frame codec error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanError {
    /// Encode or decode buffer shorter than the 13-byte wire form.
    #[error("buffer must be at least {needed} bytes, found only {got}")]
    BufferTooSmall { needed: usize, got: usize },
    /// Frame payload above the CAN maximum of 8 bytes.
    #[error("frame payload cannot exceed 8 bytes, got {0}")]
    PayloadTooLarge(usize),
}
