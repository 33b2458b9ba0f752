// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame pumps between the async core and the SPI critical section.
//!
//! Two dedicated OS threads keep SPI blocking out of the runtime: the TX
//! pump drains the outbound queue onto the PiMaster, the RX pump polls the
//! `RX-ready` line and feeds received frames inbound. Each pump holds the
//! SPI mutex only for the duration of one transfer.

use super::PiMaster;
use nocan::can::CanFrame;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Queue depth between the core and each pump.
pub const FRAME_QUEUE_SIZE: usize = 32;

/// How long the TX line may stay low before a warning is logged.
const TX_STALL_WARNING: Duration = Duration::from_secs(3);

/// RX poll period while the ready line is deasserted.
const RX_POLL_PERIOD: Duration = Duration::from_micros(500);

/// Handles to the running frame pumps.
pub struct CanLink {
    /// Outbound frames toward the bus.
    pub tx: mpsc::Sender<CanFrame>,
    /// Inbound frames from the bus.
    pub rx: mpsc::Receiver<CanFrame>,
}

impl CanLink {
    /// Spawn the TX and RX pump threads for `driver`.
    ///
    /// Both pumps exit when their channel counterpart is dropped.
    #[must_use]
    pub fn start(driver: Arc<PiMaster>) -> Self {
        let (tx_sender, tx_receiver) = mpsc::channel::<CanFrame>(FRAME_QUEUE_SIZE);
        let (rx_sender, rx_receiver) = mpsc::channel::<CanFrame>(FRAME_QUEUE_SIZE);

        let tx_driver = driver.clone();
        std::thread::Builder::new()
            .name("nocan-spi-tx".into())
            .spawn(move || tx_pump(tx_driver, tx_receiver))
            .expect("spawn TX pump thread");

        std::thread::Builder::new()
            .name("nocan-spi-rx".into())
            .spawn(move || rx_pump(driver, rx_sender))
            .expect("spawn RX pump thread");

        Self {
            tx: tx_sender,
            rx: rx_receiver,
        }
    }
}

fn tx_pump(driver: Arc<PiMaster>, mut queue: mpsc::Receiver<CanFrame>) {
    while let Some(frame) = queue.blocking_recv() {
        let start = Instant::now();
        let mut warned_at = start;
        while !driver.tx_ready() {
            std::thread::sleep(Duration::from_millis(1));
            if warned_at.elapsed() >= TX_STALL_WARNING {
                warn!(
                    "Microcontroller transmission has been blocking for more than {} seconds on frame {}",
                    start.elapsed().as_secs(),
                    frame
                );
                warned_at = Instant::now();
            }
        }
        if let Err(e) = driver.send_frame(&frame) {
            error!("Failed to send CAN frame: {}", e);
            continue;
        }
        debug!("SEND FRAME {}", frame);
    }
    debug!("TX pump exiting, outbound queue closed");
}

fn rx_pump(driver: Arc<PiMaster>, queue: mpsc::Sender<CanFrame>) {
    loop {
        if !driver.rx_ready() {
            if queue.is_closed() {
                break;
            }
            std::thread::sleep(RX_POLL_PERIOD);
            continue;
        }
        // Drain one frame at a time; each fetch carries its own ack.
        while driver.rx_ready() {
            match driver.recv_frame() {
                Ok(frame) => {
                    debug!("RECV FRAME {}", frame);
                    if queue.blocking_send(frame).is_err() {
                        debug!("RX pump exiting, inbound queue closed");
                        return;
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    break;
                }
            }
        }
    }
    debug!("RX pump exiting, inbound queue closed");
}
