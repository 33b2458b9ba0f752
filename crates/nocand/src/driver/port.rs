// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The hardware boundary of the daemon.
//!
//! The PiMaster is reached through a full-duplex SPI transfer plus two GPIO
//! ready lines. Everything below that interface (wiring library, pin
//! numbering, interrupt configuration) lives outside the core; the `rpi`
//! cargo feature provides the Raspberry Pi binding.

use super::DriverError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Byte-level access to the PiMaster board.
///
/// `transfer` clocks the buffer out over SPI while the PiMaster overwrites
/// it in place with its response. The ready lines pace frame traffic:
/// `tx_ready` is deasserted while the PiMaster's transmit slot is busy, and
/// `rx_ready` is asserted while received frames wait to be fetched.
pub trait PiMasterPort: Send {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), DriverError>;
    fn tx_ready(&mut self) -> bool;
    fn rx_ready(&mut self) -> bool;
}

/// Shared view into a [`MockPort`]'s activity, usable after the port has
/// been boxed into a driver.
#[derive(Clone, Default)]
pub struct MockLog {
    inner: Arc<Mutex<MockLogInner>>,
}

#[derive(Default)]
struct MockLogInner {
    ops: Vec<u8>,
    stored: Vec<Vec<u8>>,
}

impl MockLog {
    /// First byte of every transfer, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<u8> {
        self.inner.lock().ops.clone()
    }

    /// Payloads handed over by `store-data` transfers.
    #[must_use]
    pub fn stored(&self) -> Vec<Vec<u8>> {
        self.inner.lock().stored.clone()
    }
}

/// Scripted in-memory PiMaster used by tests.
///
/// Opcodes answer from canned buffers; stored frames and the opcode
/// sequence are recorded in a [`MockLog`].
pub struct MockPort {
    /// Response per opcode: `buf[1..]` is overwritten with these bytes.
    pub responses: HashMap<u8, Vec<u8>>,
    /// Frames queued for `fetch-data` transfers, already encoded.
    pub rx_frames: VecDeque<[u8; 13]>,
    pub log: MockLog,
    pub tx_ready: bool,
}

impl MockPort {
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            rx_frames: VecDeque::new(),
            log: MockLog::default(),
            tx_ready: true,
        }
    }

    /// A mock that answers device-info with a valid `CAN0` signature.
    #[must_use]
    pub fn with_valid_signature() -> Self {
        let mut port = Self::new();
        let mut info = vec![0u8; 18];
        info[0..4].copy_from_slice(b"CAN0");
        info[4] = 1;
        info[5] = 4;
        port.responses.insert(super::opcode::DEVICE_INFO, info);
        port
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl PiMasterPort for MockPort {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), DriverError> {
        let op = buf[0];
        {
            let mut log = self.log.inner.lock();
            log.ops.push(op);
            if op == super::opcode::STORE_DATA {
                log.stored.push(buf[2..].to_vec());
            }
        }

        match op {
            super::opcode::STORE_DATA | super::opcode::SEND_REQ | super::opcode::RECV_ACK => {
                buf[1] = super::SPI_OK;
            }
            super::opcode::FETCH_DATA => match self.rx_frames.pop_front() {
                Some(frame) => {
                    buf[1] = 13;
                    buf[2..15].copy_from_slice(&frame);
                }
                None => {
                    buf[1] = 0;
                }
            },
            other => {
                if let Some(response) = self.responses.get(&other) {
                    let take = response.len().min(buf.len() - 1);
                    buf[1..1 + take].copy_from_slice(&response[..take]);
                } else if buf.len() > 1 {
                    buf[1] = super::SPI_OK;
                }
            }
        }
        Ok(())
    }

    fn tx_ready(&mut self) -> bool {
        self.tx_ready
    }

    fn rx_ready(&mut self) -> bool {
        !self.rx_frames.is_empty()
    }
}
