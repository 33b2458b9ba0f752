// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NoCAN message model.
//!
//! A NoCAN message is a logical datagram of up to 64 bytes carried over
//! 1..8 CAN frames. The 29-bit extended identifier encodes routing and
//! fragmentation state:
//!
//! ```text
//! bit 28    : FIRST   (set on the first fragment)
//! bits 27-21: node id (7 bits)
//! bit 20    : LAST    (set on the last fragment)
//! bit 18    : SYSTEM  (control traffic when set, publish otherwise)
//! bits 17-0 : system: [unused:2][function:8][parameter:8]
//!             publish: [unused:2][channel id:16]
//! ```

use super::frame::{CanFrame, CANID_MASK_EXTENDED};
use crate::sys::SysFunction;
use std::fmt;

/// Node identifier on the bus (0 = master/daemon, 1..127 = nodes).
pub type NodeId = u8;

/// Channel identifier assigned by the daemon.
pub type ChannelId = u16;

/// Reserved channel id meaning "no channel".
pub const UNDEFINED_CHANNEL: ChannelId = 0xFFFF;

/// Number of addressable nodes, including the master at id 0.
pub const MAX_NODE_COUNT: usize = 128;

/// Maximum payload of a reassembled message.
pub const MAX_MESSAGE_SIZE: usize = 64;

/// FIRST fragment marker in the NoCAN id.
pub const NOCANID_MASK_FIRST: u32 = 1 << 28;
/// LAST fragment marker in the NoCAN id.
pub const NOCANID_MASK_LAST: u32 = 1 << 20;
/// System message marker in the NoCAN id.
pub const NOCANID_MASK_SYSTEM: u32 = 1 << 18;

/// A logical NoCAN message, reassembled from or split into CAN frames.
#[derive(Clone, Copy)]
pub struct Message {
    /// NoCAN identifier (fragmentation bits excluded when constructed).
    pub can_id: u32,
    /// Payload length (0..=64).
    pub dlc: u8,
    /// Payload storage; only the first `dlc` bytes are meaningful.
    pub data: [u8; MAX_MESSAGE_SIZE],
}

impl Message {
    /// Create a message with the given id, truncating the payload to 64 bytes.
    #[must_use]
    pub fn new(can_id: u32, data: &[u8]) -> Self {
        let take = data.len().min(MAX_MESSAGE_SIZE);
        let mut msg = Self {
            can_id,
            dlc: take as u8,
            data: [0u8; MAX_MESSAGE_SIZE],
        };
        msg.data[..take].copy_from_slice(&data[..take]);
        msg
    }

    /// Create a system message addressed to `node`.
    #[must_use]
    pub fn system(node: NodeId, function: SysFunction, param: u8, data: &[u8]) -> Self {
        Self::new(
            NOCANID_MASK_SYSTEM
                | (u32::from(node & 0x7F) << 21)
                | (u32::from(function as u8) << 8)
                | u32::from(param),
            data,
        )
    }

    /// Create a publish message from `node` on `channel`.
    #[must_use]
    pub fn publish(node: NodeId, channel: ChannelId, data: &[u8]) -> Self {
        Self::new((u32::from(node & 0x7F) << 21) | u32::from(channel), data)
    }

    /// Whether the SYSTEM bit is set.
    #[inline]
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.can_id & NOCANID_MASK_SYSTEM != 0
    }

    /// Node id carried in bits 27..21.
    #[inline]
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        ((self.can_id >> 21) & 0x7F) as NodeId
    }

    /// Channel id carried in the low 16 bits (publish messages).
    #[inline]
    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        (self.can_id & 0xFFFF) as ChannelId
    }

    /// Raw (function, parameter) pair of a system message.
    #[inline]
    #[must_use]
    pub fn sys_function_param(&self) -> (u8, u8) {
        (((self.can_id >> 8) & 0xFF) as u8, (self.can_id & 0xFF) as u8)
    }

    /// Decoded system function, if the code is known.
    #[must_use]
    pub fn sys_function(&self) -> Option<SysFunction> {
        SysFunction::from_code(self.sys_function_param().0)
    }

    /// Append payload bytes; fails without mutating past the 64-byte cap.
    pub fn append(&mut self, data: &[u8]) -> bool {
        let len = usize::from(self.dlc);
        if len + data.len() > MAX_MESSAGE_SIZE {
            return false;
        }
        self.data[len..len + data.len()].copy_from_slice(data);
        self.dlc += data.len() as u8;
        true
    }

    /// Payload bytes covered by the DLC.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.dlc)]
    }

    /// Split the message into CAN frames carrying FIRST/LAST markers.
    ///
    /// An empty message still produces one frame with both markers set.
    #[must_use]
    pub fn split_frames(&self) -> Vec<CanFrame> {
        let mut frames = Vec::with_capacity(usize::from(self.dlc).div_ceil(8).max(1));
        let mut pos: u8 = 0;
        loop {
            let mut can_id = self.can_id | CANID_MASK_EXTENDED;
            if pos == 0 {
                can_id |= NOCANID_MASK_FIRST;
            }
            let take = (self.dlc - pos).min(8);
            if pos + take >= self.dlc {
                can_id |= NOCANID_MASK_LAST;
            }
            let mut frame = CanFrame {
                can_id,
                dlc: take,
                data: [0u8; 8],
            };
            frame.data[..usize::from(take)]
                .copy_from_slice(&self.data[usize::from(pos)..usize::from(pos + take)]);
            frames.push(frame);
            pos += take;
            if pos >= self.dlc {
                break;
            }
        }
        frames
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.can_id == other.can_id && self.bytes() == other.bytes()
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("can_id", &format_args!("{:#x}", self.can_id))
            .field("dlc", &self.dlc)
            .field("data", &self.bytes())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            let (function, param) = self.sys_function_param();
            let name = SysFunction::from_code(function)
                .map(|s| s.name())
                .unwrap_or("nocan-unknown");
            write!(
                f,
                "<{} node={}, func={}, param={}, len={}, data=",
                name,
                self.node_id(),
                function,
                param,
                self.dlc
            )?;
        } else {
            write!(
                f,
                "<PUBLISH node={}, channel={}, len={}, data=",
                self.node_id(),
                self.channel_id(),
                self.dlc
            )?;
        }
        for byte in self.bytes() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ">")
    }
}
