// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! System message catalog and flash layout constants.
//!
//! System messages carry a function code (bits 15..8 of the low id word) and
//! a parameter byte (bits 7..0). Requests and their acknowledgements are
//! adjacent codes; [`SysFunction::ack`] maps one onto the other.

use std::fmt;

/// Flash address where the application region begins (8 KiB bootloader below).
pub const FLASH_APP_ORIGIN: u32 = 0x2000;
/// Length of the application flash region.
pub const FLASH_APP_LENGTH: u32 = 0x3E000;
/// Flash page size used by bootloader write and read operations.
pub const FLASH_PAGE_SIZE: u32 = 64;
/// Expected bootloader device signature; byte 2 varies across silicon revisions.
pub const FLASH_DEVICE_SIGNATURE: [u8; 4] = [0x10, 0x01, 0x00, 0x05];

/// `SET_ADDRESS` parameter selecting flash memory.
pub const BOOTLOADER_MEMORY_FLASH: u8 = b'F';

/// System message function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SysFunction {
    Publish = 0,
    AddressRequest = 1,
    AddressConfigure = 2,
    AddressConfigureAck = 3,
    AddressLookup = 4,
    AddressLookupAck = 5,
    NodeBootRequest = 6,
    NodeBootAck = 7,
    NodePing = 8,
    NodePingAck = 9,
    ChannelRegister = 10,
    ChannelRegisterAck = 11,
    ChannelUnregister = 12,
    ChannelUnregisterAck = 13,
    ChannelSubscribe = 14,
    ChannelUnsubscribe = 15,
    ChannelLookup = 16,
    ChannelLookupAck = 17,
    BootloaderGetSignature = 18,
    BootloaderGetSignatureAck = 19,
    BootloaderSetAddress = 20,
    BootloaderSetAddressAck = 21,
    BootloaderWrite = 22,
    BootloaderWriteAck = 23,
    BootloaderRead = 24,
    BootloaderReadAck = 25,
    BootloaderLeave = 26,
    BootloaderLeaveAck = 27,
    BootloaderErase = 28,
    BootloaderEraseAck = 29,
    Reserved = 30,
    DebugMessage = 31,
}

const SYS_FUNCTION_NAMES: [&str; 32] = [
    "nocan-publish",
    "nocan-sys-address-request",
    "nocan-sys-address-configure",
    "nocan-sys-address-configure-ack",
    "nocan-sys-address-lookup",
    "nocan-sys-address-lookup-ack",
    "nocan-sys-node-boot-request",
    "nocan-sys-node-boot-ack",
    "nocan-sys-node-ping",
    "nocan-sys-node-ping-ack",
    "nocan-sys-channel-register",
    "nocan-sys-channel-register-ack",
    "nocan-sys-channel-unregister",
    "nocan-sys-channel-unregister-ack",
    "nocan-sys-channel-subscribe",
    "nocan-sys-channel-unsubscribe",
    "nocan-sys-channel-lookup",
    "nocan-sys-channel-lookup-ack",
    "nocan-sys-bootloader-get-signature",
    "nocan-sys-bootloader-get-signature-ack",
    "nocan-sys-bootloader-set-address",
    "nocan-sys-bootloader-set-address-ack",
    "nocan-sys-bootloader-write",
    "nocan-sys-bootloader-write-ack",
    "nocan-sys-bootloader-read",
    "nocan-sys-bootloader-read-ack",
    "nocan-sys-bootloader-leave",
    "nocan-sys-bootloader-leave-ack",
    "nocan-sys-bootloader-erase",
    "nocan-sys-bootloader-erase-ack",
    "nocan-sys-reserved",
    "nocan-sys-debug-message",
];

impl SysFunction {
    /// Decode a wire function code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        use SysFunction::*;
        Some(match code {
            0 => Publish,
            1 => AddressRequest,
            2 => AddressConfigure,
            3 => AddressConfigureAck,
            4 => AddressLookup,
            5 => AddressLookupAck,
            6 => NodeBootRequest,
            7 => NodeBootAck,
            8 => NodePing,
            9 => NodePingAck,
            10 => ChannelRegister,
            11 => ChannelRegisterAck,
            12 => ChannelUnregister,
            13 => ChannelUnregisterAck,
            14 => ChannelSubscribe,
            15 => ChannelUnsubscribe,
            16 => ChannelLookup,
            17 => ChannelLookupAck,
            18 => BootloaderGetSignature,
            19 => BootloaderGetSignatureAck,
            20 => BootloaderSetAddress,
            21 => BootloaderSetAddressAck,
            22 => BootloaderWrite,
            23 => BootloaderWriteAck,
            24 => BootloaderRead,
            25 => BootloaderReadAck,
            26 => BootloaderLeave,
            27 => BootloaderLeaveAck,
            28 => BootloaderErase,
            29 => BootloaderEraseAck,
            30 => Reserved,
            31 => DebugMessage,
            _ => return None,
        })
    }

    /// The acknowledgement code paired with a request code.
    ///
    /// Acknowledged requests sit one code below their ack. `AddressRequest`
    /// is answered by `AddressConfigure` rather than an ack, and publish,
    /// subscribe and debug traffic is never acknowledged.
    #[must_use]
    pub fn ack(self) -> Option<Self> {
        match self {
            Self::AddressConfigure
            | Self::AddressLookup
            | Self::NodeBootRequest
            | Self::NodePing
            | Self::ChannelRegister
            | Self::ChannelUnregister
            | Self::ChannelLookup
            | Self::BootloaderGetSignature
            | Self::BootloaderSetAddress
            | Self::BootloaderWrite
            | Self::BootloaderRead
            | Self::BootloaderLeave
            | Self::BootloaderErase => Self::from_code(self as u8 + 1),
            _ => None,
        }
    }

    /// Human-readable event name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        SYS_FUNCTION_NAMES[self as u8 as usize]
    }
}

impl fmt::Display for SysFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
