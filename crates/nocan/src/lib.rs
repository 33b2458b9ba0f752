// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # NoCAN protocol library
//!
//! Shared types and codecs for the NoCAN bus: a publish/subscribe network of
//! up to 127 microcontroller nodes on a CAN bus, managed by the `nocand`
//! daemon through an SPI-attached PiMaster board.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       TCP/IP clients                         |
//! |      EventConn -> authenticated records -> event codec       |
//! +--------------------------------------------------------------+
//! |                        nocand daemon                         |
//! |   event server | node & channel registries | bootloader      |
//! +--------------------------------------------------------------+
//! |                        NoCAN messages                        |
//! |      64-byte messages <-> 8-byte CAN frames (FIRST/LAST)     |
//! +--------------------------------------------------------------+
//! |                    PiMaster over SPI                         |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`can`] - CAN frame codec, NoCAN message model, reassembly
//! - [`sys`] - system message catalog and flash layout
//! - [`event`] - event framing, the 24 event types, client runtime
//! - [`secure`] - authenticated record stream (handshake + framing)
//! - [`device`] - PiMaster identity and power telemetry
//! - [`properties`] - typed system properties
//! - [`crc`] - CRC-32 used by firmware writes

pub mod can;
pub mod crc;
pub mod device;
pub mod event;
pub mod node;
pub mod properties;
pub mod secure;
pub mod sys;

pub use can::{CanFrame, ChannelId, Message, NodeId, Reassembler};
pub use event::{Event, EventConn, EventError};
pub use node::{NodeState, Udid8, NULL_UDID};
pub use sys::SysFunction;
