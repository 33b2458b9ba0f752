// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NoCAN network manager and event server.
//!
//! The daemon bridges a CAN bus, driven through an SPI-attached PiMaster
//! board, to TCP/IP clients: it assigns node addresses, tracks liveness,
//! mediates named publish/subscribe channels and programs node firmware
//! over the bus.

/// Daemon configuration (JSON file + CLI overrides).
pub mod config;
/// Network controller: per-node dispatch, lifecycle, bootloader driver.
pub mod controller;
/// PiMaster SPI driver façade and frame pumps.
pub mod driver;
/// Node, channel and persistent-cache registries.
pub mod registry;
/// Event server and request handlers.
pub mod server;

pub use config::Config;
pub use controller::NetworkController;
pub use driver::{CanLink, PiMaster};
pub use server::EventServer;
