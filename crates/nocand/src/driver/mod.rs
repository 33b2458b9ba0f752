// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PiMaster SPI driver façade.
//!
//! Every interaction with the board is one full-duplex transfer: the opcode
//! goes out in `buf[0]` and the PiMaster overwrites the buffer with its
//! response. A single mutex serializes transfers; callers hold it only for
//! the duration of one exchange.

pub mod link;
pub mod port;
#[cfg(feature = "rpi")]
pub mod rpi;

pub use link::CanLink;
pub use port::{MockLog, MockPort, PiMasterPort};

use nocan::can::CanFrame;
use nocan::device::{DeviceInformation, PowerStatus, StatusByte};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// SPI opcodes understood by the PiMaster firmware.
pub mod opcode {
    pub const NULL: u8 = 0;
    pub const RESET: u8 = 1;
    pub const DEVICE_INFO: u8 = 2;
    pub const POWER_LEVEL: u8 = 3;
    pub const SET_POWER: u8 = 4;
    pub const SET_CAN_RES: u8 = 5;
    pub const STATUS: u8 = 6;
    pub const STORE_DATA: u8 = 7;
    pub const SEND_REQ: u8 = 8;
    pub const FETCH_DATA: u8 = 9;
    pub const RECV_ACK: u8 = 10;
    pub const SET_CURRENT_LIMIT: u8 = 11;

    pub(super) const NAMES: [&str; 12] = [
        "SPI_OP_NULL",
        "SPI_OP_RESET",
        "SPI_OP_DEVICE_INFO",
        "SPI_OP_POWER_LEVEL",
        "SPI_OP_SET_POWER",
        "SPI_OP_SET_CAN_RES",
        "SPI_OP_STATUS",
        "SPI_OP_STORE_DATA",
        "SPI_OP_SEND_REQ",
        "SPI_OP_FETCH_DATA",
        "SPI_OP_RECV_ACK",
        "SPI_OP_SET_CURRENT_LIMIT",
    ];
}

/// Status byte for an accepted command.
pub const SPI_OK: u8 = 0x80;
/// Status byte for a command with pending continuation.
pub const SPI_MORE: u8 = 0xA0;
/// Status byte for a rejected command.
pub const SPI_ERR: u8 = 0xFF;

/// Firmware signature required at startup.
pub const DRIVER_SIGNATURE: [u8; 4] = *b"CAN0";

/// Hard reset argument of the reset opcode.
const RESET_HARD: u8 = 2;

/// Driver error types.
#[derive(Debug)]
pub enum DriverError {
    /// SPI transfer failed at the bus level.
    Transfer(String),
    /// Driver used before a successful `initialize`.
    NotReady,
    /// The PiMaster answered with an unexpected status or length.
    BadResponse { op: u8, detail: String },
    /// Startup signature was not `CAN0`.
    SignatureMismatch([u8; 4]),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transfer(s) => write!(f, "SPI transfer error: {}", s),
            Self::NotReady => write!(f, "driver is not available"),
            Self::BadResponse { op, detail } => {
                let name = opcode::NAMES
                    .get(usize::from(*op))
                    .copied()
                    .unwrap_or("SPI_OP_UNKNOWN");
                write!(f, "unexpected response for {}: {}", name, detail)
            }
            Self::SignatureMismatch(sig) => write!(
                f,
                "SPI driver signature check failed (got '{}')",
                String::from_utf8_lossy(sig)
            ),
        }
    }
}

impl std::error::Error for DriverError {}

/// Serialized access to the PiMaster board.
pub struct PiMaster {
    port: Mutex<Box<dyn PiMasterPort>>,
    ready: AtomicBool,
}

impl PiMaster {
    #[must_use]
    pub fn new(port: Box<dyn PiMasterPort>) -> Self {
        Self {
            port: Mutex::new(port),
            ready: AtomicBool::new(false),
        }
    }

    fn transfer(&self, buf: &mut [u8]) -> Result<(), DriverError> {
        let mut port = self.port.lock();
        debug!(
            "SPI SEND {}: {} ({})",
            buf.len(),
            hex(buf),
            opcode::NAMES
                .get(usize::from(buf[0]))
                .copied()
                .unwrap_or("SPI_OP_UNKNOWN")
        );
        port.transfer(buf)?;
        debug!("SPI RECV {}: {}", buf.len(), hex(buf));
        Ok(())
    }

    /// Whether `initialize` completed successfully.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Reset the PiMaster firmware (hard reset).
    pub fn reset(&self) -> Result<(), DriverError> {
        let mut buf = [opcode::RESET, RESET_HARD, 0];
        self.transfer(&mut buf)
    }

    /// Read the device identity block.
    pub fn read_device_info(&self) -> Result<DeviceInformation, DriverError> {
        let mut buf = [0u8; 19];
        buf[0] = opcode::DEVICE_INFO;
        self.transfer(&mut buf)?;

        let mut info = DeviceInformation {
            device_type: *b"PiMaster",
            ..DeviceInformation::default()
        };
        info.signature.copy_from_slice(&buf[1..5]);
        info.version_major = buf[5];
        info.version_minor = buf[6];
        info.chip_id.copy_from_slice(&buf[7..19]);
        Ok(info)
    }

    /// Read the bus power measurement registers.
    pub fn read_power_status(&self) -> Result<PowerStatus, DriverError> {
        if !self.is_ready() {
            return Err(DriverError::NotReady);
        }
        let mut buf = [0u8; 11];
        buf[0] = opcode::POWER_LEVEL;
        self.transfer(&mut buf)?;

        // Measurement words are little-endian in the register block.
        let raw_voltage = u16::from(buf[4]) << 8 | u16::from(buf[3]);
        let current_sense = u16::from(buf[6]) << 8 | u16::from(buf[5]);
        let ref_raw = u16::from(buf[8]) << 8 | u16::from(buf[7]);
        let ref_val = u16::from(buf[10]) << 8 | u16::from(buf[9]);

        Ok(PowerStatus {
            status: StatusByte(buf[1]),
            voltage: 11.0 * 3.3 * f32::from(raw_voltage) / 4095.0,
            current_sense,
            ref_level: if ref_raw == 0 {
                0.0
            } else {
                3.3 * f32::from(ref_val) / f32::from(ref_raw)
            },
        })
    }

    pub fn set_power(&self, on: bool) -> Result<(), DriverError> {
        let mut buf = [opcode::SET_POWER, u8::from(on)];
        self.transfer(&mut buf)
    }

    pub fn set_can_termination(&self, on: bool) -> Result<(), DriverError> {
        let mut buf = [opcode::SET_CAN_RES, u8::from(on)];
        self.transfer(&mut buf)
    }

    pub fn set_current_limit(&self, limit: u16) -> Result<(), DriverError> {
        let mut buf = [opcode::SET_CURRENT_LIMIT, (limit >> 8) as u8, limit as u8];
        self.transfer(&mut buf)
    }

    pub fn status(&self) -> Result<StatusByte, DriverError> {
        let mut buf = [opcode::STATUS, 0];
        self.transfer(&mut buf)?;
        Ok(StatusByte(buf[1]))
    }

    fn store_frame(&self, frame: &CanFrame) -> Result<(), DriverError> {
        let mut buf = [0u8; 15];
        buf[0] = opcode::STORE_DATA;
        buf[1] = 13;
        buf[2..15].copy_from_slice(&frame.to_bytes());
        self.transfer(&mut buf)
    }

    fn send_request(&self) -> Result<(), DriverError> {
        let mut buf = [opcode::SEND_REQ, 0];
        self.transfer(&mut buf)?;
        if buf[1] != SPI_OK {
            return Err(DriverError::BadResponse {
                op: opcode::SEND_REQ,
                detail: format!("status {:#x}, expected {:#x}", buf[1], SPI_OK),
            });
        }
        Ok(())
    }

    fn recv_ack(&self) -> Result<(), DriverError> {
        let mut buf = [opcode::RECV_ACK, 0];
        self.transfer(&mut buf)?;
        if buf[1] != SPI_OK {
            return Err(DriverError::BadResponse {
                op: opcode::RECV_ACK,
                detail: format!("status {:#x}, expected {:#x}", buf[1], SPI_OK),
            });
        }
        Ok(())
    }

    /// Hand one frame to the PiMaster transmit slot.
    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), DriverError> {
        self.store_frame(frame)?;
        self.send_request()
    }

    /// Fetch one received frame and acknowledge it.
    pub fn recv_frame(&self) -> Result<CanFrame, DriverError> {
        let mut buf = [0u8; 15];
        buf[0] = opcode::FETCH_DATA;
        self.transfer(&mut buf)?;
        if buf[1] != 13 {
            return Err(DriverError::BadResponse {
                op: opcode::FETCH_DATA,
                detail: format!("expected 13 byte frame, got length {}", buf[1]),
            });
        }
        let frame = CanFrame::decode(&buf[2..15]).map_err(|e| DriverError::BadResponse {
            op: opcode::FETCH_DATA,
            detail: e.to_string(),
        })?;
        self.recv_ack()?;
        Ok(frame)
    }

    /// Whether the PiMaster transmit slot is free.
    pub fn tx_ready(&self) -> bool {
        self.port.lock().tx_ready()
    }

    /// Whether the PiMaster holds frames waiting to be fetched.
    pub fn rx_ready(&self) -> bool {
        self.port.lock().rx_ready()
    }

    /// Bring the board up: optional reset, TX-line wait, signature check.
    pub fn initialize(&self, reset: bool) -> Result<DeviceInformation, DriverError> {
        self.ready.store(false, Ordering::Release);

        if reset {
            info!("Resetting driver");
            self.reset()?;
        }

        debug!("Waiting for TX line to be HIGH");
        while !self.tx_ready() {
            std::thread::sleep(Duration::from_millis(100));
        }
        debug!("TX line is HIGH");

        let device_info = self.read_device_info()?;
        info!(
            "Firmware version {}.{}, signature='{}', chip id={}",
            device_info.version_major,
            device_info.version_minor,
            String::from_utf8_lossy(&device_info.signature),
            hex(&device_info.chip_id),
        );
        if device_info.signature != DRIVER_SIGNATURE {
            return Err(DriverError::SignatureMismatch(device_info.signature));
        }
        info!("Driver signature verified");

        self.ready.store(true, Ordering::Release);
        Ok(device_info)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nocan::can::CANID_MASK_EXTENDED;

    fn master(port: MockPort) -> PiMaster {
        PiMaster::new(Box::new(port))
    }

    #[test]
    fn test_initialize_checks_signature() {
        let driver = master(MockPort::with_valid_signature());
        let info = driver.initialize(false).expect("initialize");
        assert_eq!(&info.signature, b"CAN0");
        assert_eq!(info.version_major, 1);
        assert!(driver.is_ready());
    }

    #[test]
    fn test_initialize_rejects_bad_signature() {
        let mut port = MockPort::new();
        port.responses
            .insert(opcode::DEVICE_INFO, b"NOPE".to_vec());
        let driver = master(port);
        assert!(matches!(
            driver.initialize(false),
            Err(DriverError::SignatureMismatch(_))
        ));
        assert!(!driver.is_ready());
    }

    #[test]
    fn test_initialize_with_reset_sends_reset_op() {
        let port = MockPort::with_valid_signature();
        let log = port.log.clone();
        let driver = master(port);
        driver.initialize(true).expect("initialize");

        let ops = log.ops();
        assert_eq!(ops[0], opcode::RESET);
        assert!(ops.contains(&opcode::DEVICE_INFO));
    }

    #[test]
    fn test_send_frame_stores_then_requests() {
        let port = MockPort::new();
        let log = port.log.clone();
        let driver = master(port);
        let frame = CanFrame::new(CANID_MASK_EXTENDED | 0x42, &[1, 2, 3]).expect("frame");
        driver.send_frame(&frame).expect("send");

        assert_eq!(log.ops(), vec![opcode::STORE_DATA, opcode::SEND_REQ]);
        let stored = log.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], frame.to_bytes());
    }

    #[test]
    fn test_recv_frame_roundtrip() {
        let mut port = MockPort::new();
        let frame = CanFrame::new(CANID_MASK_EXTENDED | 0x1234, &[9, 8, 7]).expect("frame");
        port.rx_frames.push_back(frame.to_bytes());
        let driver = master(port);

        let got = driver.recv_frame().expect("recv");
        assert_eq!(got, frame);
    }

    #[test]
    fn test_recv_frame_rejects_bad_length() {
        // No queued frame: the mock answers length 0.
        let driver = master(MockPort::new());
        assert!(matches!(
            driver.recv_frame(),
            Err(DriverError::BadResponse { .. })
        ));
    }

    #[test]
    fn test_power_status_requires_ready() {
        let driver = master(MockPort::with_valid_signature());
        assert!(matches!(
            driver.read_power_status(),
            Err(DriverError::NotReady)
        ));
        driver.initialize(false).expect("initialize");
        assert!(driver.read_power_status().is_ok());
    }

    #[test]
    fn test_power_status_conversions() {
        let mut port = MockPort::with_valid_signature();
        // status, pad, voltage lo/hi (0xFFF = full scale), current lo/hi,
        // ref raw lo/hi, ref val lo/hi.
        port.responses.insert(
            opcode::POWER_LEVEL,
            vec![0x40, 0, 0xFF, 0x0F, 0x90, 0x01, 0x00, 0x10, 0x00, 0x10],
        );
        let driver = master(port);
        driver.initialize(false).expect("initialize");

        let status = driver.read_power_status().expect("status");
        assert!(status.status.contains(StatusByte::POWERED));
        assert!((status.voltage - 36.3).abs() < 0.01);
        assert_eq!(status.current_sense, 0x190);
        assert!((status.ref_level - 3.3).abs() < 0.001);
    }
}
