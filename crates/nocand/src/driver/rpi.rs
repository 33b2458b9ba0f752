// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raspberry Pi binding of the PiMaster port.
//!
//! The PiMaster hat sits on SPI0/CE0; its ready lines are wired to
//! BCM GPIO 22 (TX, active high) and BCM GPIO 25 (RX, active low).

use super::port::PiMasterPort;
use super::DriverError;
use rppal::gpio::{Gpio, InputPin, Level};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

/// BCM pin of the TX-ready line.
const CAN_TX_PIN: u8 = 22;
/// BCM pin of the RX-ready line.
const CAN_RX_PIN: u8 = 25;

/// PiMaster attached to the Raspberry Pi SPI bus.
pub struct RpiPort {
    spi: Spi,
    tx_line: InputPin,
    rx_line: InputPin,
}

impl RpiPort {
    /// Open SPI0/CE0 at `speed` bits per second and claim the ready lines.
    pub fn open(speed: u32) -> Result<Self, DriverError> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, speed, Mode::Mode0)
            .map_err(|e| DriverError::Transfer(e.to_string()))?;
        let gpio = Gpio::new().map_err(|e| DriverError::Transfer(e.to_string()))?;
        let tx_line = gpio
            .get(CAN_TX_PIN)
            .map_err(|e| DriverError::Transfer(e.to_string()))?
            .into_input_pulldown();
        let rx_line = gpio
            .get(CAN_RX_PIN)
            .map_err(|e| DriverError::Transfer(e.to_string()))?
            .into_input();
        Ok(Self {
            spi,
            tx_line,
            rx_line,
        })
    }
}

impl PiMasterPort for RpiPort {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), DriverError> {
        let write = buf.to_vec();
        self.spi
            .transfer(buf, &write)
            .map_err(|e| DriverError::Transfer(e.to_string()))?;
        Ok(())
    }

    fn tx_ready(&mut self) -> bool {
        self.tx_line.read() == Level::High
    }

    fn rx_ready(&mut self) -> bool {
        self.rx_line.read() == Level::Low
    }
}
