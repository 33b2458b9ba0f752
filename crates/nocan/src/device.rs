// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PiMaster device identity and bus power telemetry.

use crate::event::EventError;
use std::fmt;

/// Identity reported by the PiMaster over SPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInformation {
    /// Device model, e.g. `PiMaster`.
    pub device_type: [u8; 8],
    /// Firmware signature; must read `CAN0`.
    pub signature: [u8; 4],
    pub version_major: u8,
    pub version_minor: u8,
    /// Silicon serial number.
    pub chip_id: [u8; 12],
}

/// Serialized size of [`DeviceInformation`].
pub const DEVICE_INFORMATION_SIZE: usize = 26;

impl DeviceInformation {
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEVICE_INFORMATION_SIZE);
        buf.extend_from_slice(&self.device_type);
        buf.extend_from_slice(&self.signature);
        buf.push(self.version_major);
        buf.push(self.version_minor);
        buf.extend_from_slice(&self.chip_id);
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, EventError> {
        if buf.len() < DEVICE_INFORMATION_SIZE {
            return Err(EventError::ShortPayload);
        }
        let mut info = Self::default();
        info.device_type.copy_from_slice(&buf[0..8]);
        info.signature.copy_from_slice(&buf[8..12]);
        info.version_major = buf[12];
        info.version_minor = buf[13];
        info.chip_id.copy_from_slice(&buf[14..26]);
        Ok(info)
    }
}

impl fmt::Display for DeviceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, firmware version={}.{}, signature: '{}', chip_id: '{}'",
            String::from_utf8_lossy(&self.device_type),
            self.version_major,
            self.version_minor,
            String::from_utf8_lossy(&self.signature),
            hex(&self.chip_id),
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Driver status register flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusByte(pub u8);

impl StatusByte {
    pub const RX_PENDING: u8 = 0x01;
    pub const TX_PENDING: u8 = 0x02;
    pub const ERROR: u8 = 0x10;
    pub const FAULT: u8 = 0x20;
    pub const POWERED: u8 = 0x40;
    pub const CAN_RES: u8 = 0x80;

    #[inline]
    #[must_use]
    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

impl fmt::Display for StatusByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 6] = [
            (StatusByte::RX_PENDING, "rx-pending"),
            (StatusByte::TX_PENDING, "tx-pending"),
            (StatusByte::ERROR, "driver error"),
            (StatusByte::FAULT, "electric fault"),
            (StatusByte::POWERED, "powered"),
            (StatusByte::CAN_RES, "resistor"),
        ];
        for (flag, name) in NAMES {
            if self.contains(flag) {
                write!(f, "+{}", name)?;
            } else if flag == Self::POWERED {
                write!(f, "+unpowered")?;
            }
        }
        Ok(())
    }
}

/// Bus power measurement snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PowerStatus {
    pub status: StatusByte,
    /// Bus supply voltage in volts.
    pub voltage: f32,
    /// Raw 12-bit ADC reading of the current-sense amplifier.
    pub current_sense: u16,
    /// Internal reference voltage in volts.
    pub ref_level: f32,
}

/// Serialized size of [`PowerStatus`].
pub const POWER_STATUS_SIZE: usize = 11;

impl PowerStatus {
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(POWER_STATUS_SIZE);
        buf.push(self.status.0);
        buf.extend_from_slice(&self.voltage.to_be_bytes());
        buf.extend_from_slice(&self.current_sense.to_be_bytes());
        buf.extend_from_slice(&self.ref_level.to_be_bytes());
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, EventError> {
        if buf.len() < POWER_STATUS_SIZE {
            return Err(EventError::ShortPayload);
        }
        Ok(Self {
            status: StatusByte(buf[0]),
            voltage: f32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            current_sense: u16::from_be_bytes([buf[5], buf[6]]),
            ref_level: f32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        })
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Driver voltage={:.1}, current sense={}, reference voltage={:.2}, status({:x})={}",
            self.voltage, self.current_sense, self.ref_level, self.status.0, self.status
        )
    }
}

/// Estimate the bus current in milliamps from a raw current-sense reading.
#[must_use]
pub fn milliamp_estimate(sense: u16) -> u32 {
    (1000.0 * f64::from(sense) / 4095.0 * 3.3 / 1120.0 * 2150.0) as u32
}
