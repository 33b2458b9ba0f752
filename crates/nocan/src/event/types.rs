// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The closed set of events exchanged between the daemon and its clients.
//!
//! Each event owns a stable type byte and a pack/unpack pair. Unknown type
//! bytes abort the connection that produced them.

use super::EventError;
use crate::can::{ChannelId, NodeId};
use crate::device::{DeviceInformation, PowerStatus};
use crate::node::{NodeState, Udid8};
use crate::properties::Properties;
use std::collections::HashSet;
use std::fmt;

/// Maximum channel name length on the wire.
pub const MAX_CHANNEL_NAME: usize = 64;

/// Result code carried by a [`Event::ServerAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckCode {
    Success = 0,
    BadRequest = 1,
    Unauthorized = 2,
    NotFound = 3,
    GeneralFailure = 4,
    Timeout = 5,
}

impl AckCode {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::BadRequest,
            2 => Self::Unauthorized,
            3 => Self::NotFound,
            4 => Self::GeneralFailure,
            5 => Self::Timeout,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::BadRequest => "Bad request",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not found",
            Self::GeneralFailure => "General failure",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a channel as reported in a [`ChannelUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStatus {
    Created = 0,
    Updated = 1,
    Destroyed = 2,
    NotFound = 3,
}

impl ChannelStatus {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Created,
            1 => Self::Updated,
            2 => Self::Destroyed,
            3 => Self::NotFound,
            _ => return None,
        })
    }
}

/// Channel state change, used both as broadcast and as reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub id: ChannelId,
    pub name: String,
    pub status: ChannelStatus,
    pub value: Vec<u8>,
}

impl ChannelUpdate {
    #[must_use]
    pub fn new(id: ChannelId, name: &str, status: ChannelStatus, value: &[u8]) -> Self {
        Self {
            id,
            name: name.to_string(),
            status,
            value: value.to_vec(),
        }
    }

    fn pack_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(self.name.len() as u8);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(self.value.len() as u8);
        buf.extend_from_slice(&self.value);
    }

    fn unpack_from(buf: &[u8]) -> Result<(Self, usize), EventError> {
        if buf.len() < 5 {
            return Err(EventError::ShortPayload);
        }
        let status = ChannelStatus::from_code(buf[0])
            .ok_or_else(|| EventError::Protocol(format!("bad channel status {}", buf[0])))?;
        let id = u16::from_be_bytes([buf[1], buf[2]]);
        let name_len = usize::from(buf[3]);
        if name_len > MAX_CHANNEL_NAME {
            return Err(EventError::NameTooLong);
        }
        let mut pos = 4;
        if pos + name_len + 1 > buf.len() {
            return Err(EventError::ShortPayload);
        }
        let name = String::from_utf8_lossy(&buf[pos..pos + name_len]).into_owned();
        pos += name_len;
        let value_len = usize::from(buf[pos]);
        pos += 1;
        if pos + value_len > buf.len() {
            return Err(EventError::ShortPayload);
        }
        let value = buf[pos..pos + value_len].to_vec();
        pos += value_len;
        Ok((Self { id, name, status, value }, pos))
    }
}

/// Node state change, used both as broadcast and as reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeUpdate {
    pub id: NodeId,
    pub state: NodeState,
    pub udid: Udid8,
    /// Wall-clock timestamp of the last frame, in nanoseconds since the epoch.
    pub last_seen_ns: u64,
}

const NODE_UPDATE_SIZE: usize = 18;

impl NodeUpdate {
    fn pack_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.id);
        buf.push(self.state as u8);
        buf.extend_from_slice(self.udid.as_bytes());
        buf.extend_from_slice(&self.last_seen_ns.to_be_bytes());
    }

    fn unpack_from(buf: &[u8]) -> Result<(Self, usize), EventError> {
        if buf.len() < NODE_UPDATE_SIZE {
            return Err(EventError::ShortPayload);
        }
        let state = NodeState::from_code(buf[1])
            .ok_or_else(|| EventError::Protocol(format!("bad node state {}", buf[1])))?;
        let udid = Udid8::from_slice(&buf[2..10]).ok_or(EventError::ShortPayload)?;
        let mut ns = [0u8; 8];
        ns.copy_from_slice(&buf[10..18]);
        Ok((
            Self {
                id: buf[0],
                state,
                udid,
                last_seen_ns: u64::from_be_bytes(ns),
            },
            NODE_UPDATE_SIZE,
        ))
    }
}

/// One contiguous region of firmware data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlock {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Firmware image attached to upload requests and download responses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeFirmware {
    pub node: NodeId,
    pub download: bool,
    /// Byte limit for downloads (0 = whole application region).
    pub limit: u32,
    pub blocks: Vec<FirmwareBlock>,
}

impl NodeFirmware {
    #[must_use]
    pub fn upload(node: NodeId) -> Self {
        Self { node, ..Self::default() }
    }

    #[must_use]
    pub fn download(node: NodeId, limit: u32) -> Self {
        Self {
            node,
            download: true,
            limit,
            ..Self::default()
        }
    }

    pub fn append_block(&mut self, offset: u32, data: &[u8]) {
        self.blocks.push(FirmwareBlock {
            offset,
            data: data.to_vec(),
        });
    }

    fn pack(&self) -> Vec<u8> {
        let total: usize = 6 + self.blocks.iter().map(|b| 8 + b.data.len()).sum::<usize>();
        let mut buf = Vec::with_capacity(total);
        buf.push(self.node);
        buf.push(u8::from(self.download));
        buf.extend_from_slice(&self.limit.to_be_bytes());
        for block in &self.blocks {
            buf.extend_from_slice(&block.offset.to_be_bytes());
            buf.extend_from_slice(&(block.data.len() as u32).to_be_bytes());
            buf.extend_from_slice(&block.data);
        }
        buf
    }

    fn unpack(buf: &[u8]) -> Result<Self, EventError> {
        if buf.len() < 6 {
            return Err(EventError::ShortPayload);
        }
        let mut firmware = Self {
            node: buf[0],
            download: buf[1] != 0,
            limit: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            blocks: Vec::new(),
        };
        let mut pos = 6;
        while pos < buf.len() {
            if pos + 8 > buf.len() {
                return Err(EventError::ShortPayload);
            }
            let offset = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            let len = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]])
                as usize;
            pos += 8;
            if pos + len > buf.len() {
                return Err(EventError::ShortPayload);
            }
            firmware.append_block(offset, &buf[pos..pos + len]);
            pos += len;
        }
        Ok(firmware)
    }
}

/// Progress of a firmware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressReport {
    /// Completion percentage, 0..=100.
    Percent(u8),
    Success,
    Failed,
}

impl ProgressReport {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Percent(p) => p.min(100),
            Self::Success => 0xFE,
            Self::Failed => 0xFF,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, EventError> {
        match byte {
            0..=100 => Ok(Self::Percent(byte)),
            0xFE => Ok(Self::Success),
            0xFF => Ok(Self::Failed),
            other => Err(EventError::Protocol(format!(
                "bad progress report {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(p) => write!(f, "{}%", p),
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Firmware operation progress report sent to the owning client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareProgress {
    pub node: NodeId,
    pub progress: ProgressReport,
    pub transferred: u32,
}

impl FirmwareProgress {
    #[must_use]
    pub fn new(node: NodeId, progress: ProgressReport, transferred: u32) -> Self {
        Self { node, progress, transferred }
    }
}

/// Channel filter payload: the channel ids a client wants to receive.
///
/// An empty set admits every channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelFilter {
    pub channels: HashSet<ChannelId>,
}

impl ChannelFilter {
    /// Whether a channel passes this filter.
    #[must_use]
    pub fn admits(&self, id: ChannelId) -> bool {
        self.channels.is_empty() || self.channels.contains(&id)
    }
}

impl FromIterator<ChannelId> for ChannelFilter {
    fn from_iter<T: IntoIterator<Item = ChannelId>>(iter: T) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}

/// Every event that can cross the TCP boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ClientHello { tool: String, major: u8, minor: u8 },
    ServerHello { tool: String, major: u8, minor: u8 },
    ChannelFilter(ChannelFilter),
    ServerAck(AckCode),
    BusPowerStatusUpdate(PowerStatus),
    BusPower(bool),
    ChannelUpdateRequest { id: ChannelId, name: String },
    ChannelUpdate(ChannelUpdate),
    ChannelListRequest,
    ChannelList(Vec<ChannelUpdate>),
    NodeUpdateRequest(NodeId),
    NodeUpdate(NodeUpdate),
    NodeListRequest,
    NodeList(Vec<NodeUpdate>),
    NodeFirmwareUpload(NodeFirmware),
    NodeFirmwareDownloadRequest(NodeFirmware),
    NodeFirmware(NodeFirmware),
    NodeFirmwareProgress(FirmwareProgress),
    NodeRebootRequest { node: NodeId, force: bool },
    BusPowerStatusUpdateRequest,
    DeviceInformationRequest,
    DeviceInformation(DeviceInformation),
    SystemPropertiesRequest,
    SystemProperties(Properties),
}

impl Event {
    /// Stable wire type byte.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::ClientHello { .. } => 1,
            Self::ServerHello { .. } => 2,
            Self::ChannelFilter(_) => 3,
            Self::ServerAck(_) => 4,
            Self::BusPowerStatusUpdate(_) => 6,
            Self::BusPower(_) => 7,
            Self::ChannelUpdateRequest { .. } => 8,
            Self::ChannelUpdate(_) => 9,
            Self::ChannelListRequest => 10,
            Self::ChannelList(_) => 11,
            Self::NodeUpdateRequest(_) => 12,
            Self::NodeUpdate(_) => 13,
            Self::NodeListRequest => 14,
            Self::NodeList(_) => 15,
            Self::NodeFirmwareUpload(_) => 16,
            Self::NodeFirmwareDownloadRequest(_) => 17,
            Self::NodeFirmware(_) => 18,
            Self::NodeFirmwareProgress(_) => 19,
            Self::NodeRebootRequest { .. } => 20,
            Self::BusPowerStatusUpdateRequest => 21,
            Self::DeviceInformationRequest => 22,
            Self::DeviceInformation(_) => 23,
            Self::SystemPropertiesRequest => 24,
            Self::SystemProperties(_) => 25,
        }
    }

    /// Event name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientHello { .. } => "client-hello-event",
            Self::ServerHello { .. } => "server-hello-event",
            Self::ChannelFilter(_) => "channel-filter-event",
            Self::ServerAck(_) => "server-ack-event",
            Self::BusPowerStatusUpdate(_) => "bus-power-status-update-event",
            Self::BusPower(_) => "bus-power-event",
            Self::ChannelUpdateRequest { .. } => "channel-update-request-event",
            Self::ChannelUpdate(_) => "channel-update-event",
            Self::ChannelListRequest => "channel-list-request-event",
            Self::ChannelList(_) => "channel-list-event",
            Self::NodeUpdateRequest(_) => "node-update-request-event",
            Self::NodeUpdate(_) => "node-update-event",
            Self::NodeListRequest => "node-list-request-event",
            Self::NodeList(_) => "node-list-event",
            Self::NodeFirmwareUpload(_) => "node-firmware-upload-event",
            Self::NodeFirmwareDownloadRequest(_) => "node-firmware-download-request-event",
            Self::NodeFirmware(_) => "node-firmware-event",
            Self::NodeFirmwareProgress(_) => "node-firmware-progress-event",
            Self::NodeRebootRequest { .. } => "node-reboot-request-event",
            Self::BusPowerStatusUpdateRequest => "bus-power-status-update-request-event",
            Self::DeviceInformationRequest => "device-information-request-event",
            Self::DeviceInformation(_) => "device-information-event",
            Self::SystemPropertiesRequest => "system-properties-request-event",
            Self::SystemProperties(_) => "system-properties-event",
        }
    }

    /// Serialize the event payload (framing excluded).
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        match self {
            Self::ClientHello { tool, major, minor } | Self::ServerHello { tool, major, minor } => {
                let take = tool.len().min(255);
                let mut buf = Vec::with_capacity(take + 3);
                buf.push(take as u8);
                buf.extend_from_slice(&tool.as_bytes()[..take]);
                buf.push(*major);
                buf.push(*minor);
                buf
            }
            Self::ChannelFilter(filter) => {
                let mut ids: Vec<ChannelId> = filter.channels.iter().copied().collect();
                ids.sort_unstable();
                let mut buf = Vec::with_capacity(ids.len() * 2);
                for id in ids {
                    buf.extend_from_slice(&id.to_be_bytes());
                }
                buf
            }
            Self::ServerAck(code) => vec![*code as u8],
            Self::BusPowerStatusUpdate(status) => status.pack(),
            Self::BusPower(on) => vec![u8::from(*on)],
            Self::ChannelUpdateRequest { id, name } => {
                let mut buf = Vec::with_capacity(3 + name.len());
                buf.extend_from_slice(&id.to_be_bytes());
                buf.push(name.len().min(255) as u8);
                buf.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
                buf
            }
            Self::ChannelUpdate(update) => {
                let mut buf = Vec::new();
                update.pack_into(&mut buf);
                buf
            }
            Self::ChannelList(updates) => {
                let mut buf = Vec::new();
                for update in updates {
                    update.pack_into(&mut buf);
                }
                buf
            }
            Self::NodeUpdateRequest(node) => vec![*node],
            Self::NodeUpdate(update) => {
                let mut buf = Vec::with_capacity(NODE_UPDATE_SIZE);
                update.pack_into(&mut buf);
                buf
            }
            Self::NodeList(updates) => {
                let mut buf = Vec::with_capacity(updates.len() * NODE_UPDATE_SIZE);
                for update in updates {
                    update.pack_into(&mut buf);
                }
                buf
            }
            Self::NodeFirmwareUpload(firmware)
            | Self::NodeFirmwareDownloadRequest(firmware)
            | Self::NodeFirmware(firmware) => firmware.pack(),
            Self::NodeFirmwareProgress(progress) => {
                let mut buf = Vec::with_capacity(6);
                buf.push(progress.node);
                buf.push(progress.progress.to_byte());
                buf.extend_from_slice(&progress.transferred.to_be_bytes());
                buf
            }
            Self::NodeRebootRequest { node, force } => {
                vec![(node & 0x7F) | if *force { 0x80 } else { 0 }]
            }
            Self::DeviceInformation(info) => info.pack(),
            Self::SystemProperties(props) => props.pack(),
            Self::ChannelListRequest
            | Self::NodeListRequest
            | Self::BusPowerStatusUpdateRequest
            | Self::DeviceInformationRequest
            | Self::SystemPropertiesRequest => Vec::new(),
        }
    }

    /// Deserialize an event payload for a given type byte.
    pub fn unpack(type_byte: u8, buf: &[u8]) -> Result<Self, EventError> {
        match type_byte {
            1 | 2 => {
                if buf.is_empty() {
                    return Err(EventError::ShortPayload);
                }
                let tool_len = usize::from(buf[0]);
                if buf.len() < 1 + tool_len + 2 {
                    return Err(EventError::ShortPayload);
                }
                let tool = String::from_utf8_lossy(&buf[1..1 + tool_len]).into_owned();
                let major = buf[1 + tool_len];
                let minor = buf[2 + tool_len];
                Ok(if type_byte == 1 {
                    Self::ClientHello { tool, major, minor }
                } else {
                    Self::ServerHello { tool, major, minor }
                })
            }
            3 => {
                if buf.len() % 2 != 0 {
                    return Err(EventError::ShortPayload);
                }
                let channels = buf
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(Self::ChannelFilter(ChannelFilter { channels }))
            }
            4 => {
                let code = *buf.first().ok_or(EventError::ShortPayload)?;
                let code = AckCode::from_code(code)
                    .ok_or_else(|| EventError::Protocol(format!("bad ack code {}", code)))?;
                Ok(Self::ServerAck(code))
            }
            6 => Ok(Self::BusPowerStatusUpdate(PowerStatus::unpack(buf)?)),
            7 => {
                let byte = *buf.first().ok_or(EventError::ShortPayload)?;
                Ok(Self::BusPower(byte != 0))
            }
            8 => {
                if buf.len() < 3 {
                    return Err(EventError::ShortPayload);
                }
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let name_len = usize::from(buf[2]);
                if name_len > MAX_CHANNEL_NAME {
                    return Err(EventError::NameTooLong);
                }
                if buf.len() < 3 + name_len {
                    return Err(EventError::ShortPayload);
                }
                let name = String::from_utf8_lossy(&buf[3..3 + name_len]).into_owned();
                Ok(Self::ChannelUpdateRequest { id, name })
            }
            9 => ChannelUpdate::unpack_from(buf).map(|(update, _)| Self::ChannelUpdate(update)),
            10 => expect_empty(buf, Self::ChannelListRequest),
            11 => {
                let mut updates = Vec::new();
                let mut pos = 0;
                while pos < buf.len() {
                    let (update, consumed) = ChannelUpdate::unpack_from(&buf[pos..])?;
                    updates.push(update);
                    pos += consumed;
                }
                Ok(Self::ChannelList(updates))
            }
            12 => {
                let node = *buf.first().ok_or(EventError::ShortPayload)?;
                Ok(Self::NodeUpdateRequest(node))
            }
            13 => NodeUpdate::unpack_from(buf).map(|(update, _)| Self::NodeUpdate(update)),
            14 => expect_empty(buf, Self::NodeListRequest),
            15 => {
                let mut updates = Vec::new();
                let mut pos = 0;
                while pos < buf.len() {
                    let (update, consumed) = NodeUpdate::unpack_from(&buf[pos..])?;
                    updates.push(update);
                    pos += consumed;
                }
                Ok(Self::NodeList(updates))
            }
            16 => Ok(Self::NodeFirmwareUpload(NodeFirmware::unpack(buf)?)),
            17 => Ok(Self::NodeFirmwareDownloadRequest(NodeFirmware::unpack(buf)?)),
            18 => Ok(Self::NodeFirmware(NodeFirmware::unpack(buf)?)),
            19 => {
                if buf.len() < 6 {
                    return Err(EventError::ShortPayload);
                }
                Ok(Self::NodeFirmwareProgress(FirmwareProgress {
                    node: buf[0],
                    progress: ProgressReport::from_byte(buf[1])?,
                    transferred: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
                }))
            }
            20 => {
                let byte = *buf.first().ok_or(EventError::ShortPayload)?;
                Ok(Self::NodeRebootRequest {
                    node: byte & 0x7F,
                    force: byte & 0x80 != 0,
                })
            }
            21 => expect_empty(buf, Self::BusPowerStatusUpdateRequest),
            22 => expect_empty(buf, Self::DeviceInformationRequest),
            23 => Ok(Self::DeviceInformation(DeviceInformation::unpack(buf)?)),
            24 => expect_empty(buf, Self::SystemPropertiesRequest),
            25 => Ok(Self::SystemProperties(Properties::unpack(buf)?)),
            other => Err(EventError::UnknownEvent(other)),
        }
    }
}

fn expect_empty(buf: &[u8], event: Event) -> Result<Event, EventError> {
    if buf.is_empty() {
        Ok(event)
    } else {
        Err(EventError::Protocol(format!(
            "{} has a non-empty payload (length={})",
            event.name(),
            buf.len()
        )))
    }
}
