// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network controller: per-node dispatch, address assignment, liveness.
//!
//! Inbound CAN frames are reassembled into messages and routed to one task
//! per registered node. Node 0 belongs to the daemon itself and handles
//! unsolicited address requests. Each node task owns its mailbox
//! exclusively; the controller's serve loop is the only producer.

pub mod bootloader;

use crate::driver::PiMaster;
use crate::registry::{ChannelRegistry, NodeIdCache, NodeRegistry, RegistryError};
use crate::server::{ClientHandle, EventServer};
use nocan::can::{CanFrame, ChannelId, Ingest, Message, NodeId, Reassembler, MAX_NODE_COUNT};
use nocan::device::{milliamp_estimate, DeviceInformation};
use nocan::event::{
    ChannelStatus, ChannelUpdate, Event, NodeFirmware, NodeUpdate as NodeUpdateEvent,
};
use nocan::node::NodeState;
use nocan::properties::Properties;
use nocan::sys::SysFunction;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long a bootloader exchange may wait for its ack.
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Depth of each per-node mailbox.
const MAILBOX_SIZE: usize = 16;

/// Direction of a pending firmware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareDirection {
    Upload,
    Download,
}

/// A firmware operation waiting for the node to enter its bootloader.
pub struct FirmwareOperation {
    pub client: Arc<ClientHandle>,
    pub direction: FirmwareDirection,
    pub firmware: NodeFirmware,
}

type PendingFirmware = Arc<Mutex<Option<FirmwareOperation>>>;

struct NodeContext {
    mailbox: mpsc::Sender<Message>,
    terminate: mpsc::Sender<()>,
    pending_firmware: PendingFirmware,
}

struct Inner {
    driver: Arc<PiMaster>,
    nodes: NodeRegistry,
    channels: ChannelRegistry,
    cache: NodeIdCache,
    server: EventServer,
    frame_tx: mpsc::Sender<CanFrame>,
    contexts: Mutex<Vec<Option<NodeContext>>>,
    device_info: Mutex<Option<DeviceInformation>>,
    properties: Mutex<Properties>,
}

/// Controller error types.
#[derive(Debug)]
pub enum ControllerError {
    /// No matching message arrived within [`EXPECT_TIMEOUT`].
    Timeout(SysFunction),
    /// The next queued message was not the expected ack.
    UnexpectedMessage {
        expected: SysFunction,
        got: String,
    },
    /// The frame pump is gone.
    LinkClosed,
    /// The node's ack reported a failure.
    AckFailure(String),
    Registry(RegistryError),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(expected) => {
                write!(f, "timeout while waiting for system message {}", expected)
            }
            Self::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message {}, while expecting {}", got, expected)
            }
            Self::LinkClosed => write!(f, "CAN frame link is closed"),
            Self::AckFailure(detail) => write!(f, "{}", detail),
            Self::Registry(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<RegistryError> for ControllerError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

/// Shared handle to the network controller.
#[derive(Clone)]
pub struct NetworkController {
    inner: Arc<Inner>,
}

impl NetworkController {
    #[must_use]
    pub fn new(
        driver: Arc<PiMaster>,
        server: EventServer,
        cache: NodeIdCache,
        frame_tx: mpsc::Sender<CanFrame>,
    ) -> Self {
        let mut properties = Properties::new();
        properties.add_string("nocand_version", env!("CARGO_PKG_VERSION"));
        Self {
            inner: Arc::new(Inner {
                driver,
                nodes: NodeRegistry::new(),
                channels: ChannelRegistry::new(),
                cache,
                server,
                frame_tx,
                contexts: Mutex::new((0..MAX_NODE_COUNT).map(|_| None).collect()),
                device_info: Mutex::new(None),
                properties: Mutex::new(properties),
            }),
        }
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.inner.nodes
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub fn server(&self) -> &EventServer {
        &self.inner.server
    }

    #[must_use]
    pub fn device_info(&self) -> Option<DeviceInformation> {
        *self.inner.device_info.lock()
    }

    #[must_use]
    pub fn properties(&self) -> Properties {
        self.inner.properties.lock().clone()
    }

    pub fn properties_mut<R>(&self, f: impl FnOnce(&mut Properties) -> R) -> R {
        f(&mut self.inner.properties.lock())
    }

    /// Bring up the PiMaster and apply the configured bus options.
    pub fn initialize(
        &self,
        reset: bool,
        current_limit: u16,
        termination: bool,
    ) -> Result<(), crate::driver::DriverError> {
        let info = self.inner.driver.initialize(reset)?;
        *self.inner.device_info.lock() = Some(info);

        if current_limit > 0 {
            self.inner.driver.set_current_limit(current_limit)?;
            debug!(
                "Driver current limit set to {} (~ {} mA)",
                current_limit,
                milliamp_estimate(current_limit)
            );
        }
        self.inner.driver.set_can_termination(termination)?;
        if !termination {
            info!("Disabling on-board CAN bus termination");
        }
        Ok(())
    }

    /// Send a message on the bus, splitting it into frames.
    pub async fn send_message(&self, msg: Message) -> Result<(), ControllerError> {
        debug!("** Sending {} **", msg);
        for frame in msg.split_frames() {
            self.inner
                .frame_tx
                .send(frame)
                .await
                .map_err(|_| ControllerError::LinkClosed)?;
        }
        Ok(())
    }

    pub async fn send_system_message(
        &self,
        node: NodeId,
        function: SysFunction,
        param: u8,
        data: &[u8],
    ) -> Result<(), ControllerError> {
        self.send_message(Message::system(node, function, param, data))
            .await
    }

    /// Publish on a channel from the daemon (node 0).
    pub async fn publish(&self, channel: ChannelId, data: &[u8]) -> Result<(), ControllerError> {
        self.send_message(Message::publish(0, channel, data)).await
    }

    /// Wait for the next message on `rx` and require it to be the expected
    /// system message; anything else is an error.
    pub async fn expect_system_message(
        rx: &mut mpsc::Receiver<Message>,
        expected: SysFunction,
    ) -> Result<Message, ControllerError> {
        match tokio::time::timeout(EXPECT_TIMEOUT, rx.recv()).await {
            Err(_) => Err(ControllerError::Timeout(expected)),
            Ok(None) => Err(ControllerError::LinkClosed),
            Ok(Some(msg)) => {
                if !msg.is_system() {
                    return Err(ControllerError::UnexpectedMessage {
                        expected,
                        got: "publish message".to_string(),
                    });
                }
                let (function, _) = msg.sys_function_param();
                if function == expected as u8 {
                    Ok(msg)
                } else {
                    Err(ControllerError::UnexpectedMessage {
                        expected,
                        got: SysFunction::from_code(function)
                            .map(|f| f.name().to_string())
                            .unwrap_or_else(|| format!("function {}", function)),
                    })
                }
            }
        }
    }

    /// Attach a pending firmware operation to a node; false when the node
    /// has no running handler.
    pub fn set_pending_firmware(&self, node: NodeId, op: FirmwareOperation) -> bool {
        let contexts = self.inner.contexts.lock();
        match &contexts[usize::from(node)] {
            Some(context) => {
                *context.pending_firmware.lock() = Some(op);
                true
            }
            None => false,
        }
    }

    /// Drive bus power and mirror the change to clients.
    pub async fn set_power(&self, on: bool) {
        if let Err(e) = self.inner.driver.set_power(on) {
            warn!("Failed to set bus power: {}", e);
        }
        if !on {
            self.inner.nodes.clear();
            let contexts: Vec<NodeContext> = {
                let mut slots = self.inner.contexts.lock();
                slots
                    .iter_mut()
                    .skip(1)
                    .filter_map(|slot| slot.take())
                    .collect()
            };
            for context in contexts {
                let _ = context.terminate.try_send(());
            }
        }
        self.inner.server.broadcast(Event::BusPower(on), None);
    }

    /// Poll the power registers and broadcast the measurement.
    pub fn request_power_status(&self) {
        if !self.inner.driver.is_ready() {
            return;
        }
        match self.inner.driver.read_power_status() {
            Ok(status) => {
                debug!(
                    "{} (~ {} mA)",
                    status,
                    milliamp_estimate(status.current_sense)
                );
                self.inner
                    .server
                    .broadcast(Event::BusPowerStatusUpdate(status), None);
            }
            Err(e) => warn!("Failed to read driver power status: {}", e),
        }
    }

    /// Periodic power measurement broadcast.
    pub fn run_power_monitor(&self, interval: Duration) {
        if interval.is_zero() {
            debug!("Bus power monitoring is disabled");
            return;
        }
        let ctrl = self.clone();
        tokio::spawn(async move {
            loop {
                ctrl.request_power_status();
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Periodic node liveness checks.
    pub fn run_pinger(&self, interval: Duration) {
        if interval.is_zero() {
            debug!("Node pinging is disabled");
            return;
        }
        debug!("Node ping interval is set to {:?}", interval);
        let ctrl = self.clone();
        tokio::spawn(async move {
            loop {
                ctrl.ping_round(interval).await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    async fn ping_round(&self, interval: Duration) {
        let mut unresponsive = Vec::new();
        for node in self.inner.nodes.snapshot() {
            // The ping opcode only exists from firmware version 3 on.
            if node.firmware_version < 3 {
                continue;
            }
            let inactivity = node.last_seen.elapsed().unwrap_or_default();
            if inactivity > interval * 2 {
                unresponsive.push(node);
            } else if inactivity > interval {
                let _ = self
                    .send_system_message(node.id, SysFunction::NodePing, 0, &[])
                    .await;
            }
        }

        for mut node in unresponsive {
            info!("Unregistering node {} due to unresponsiveness", node.id);
            node.state = NodeState::Unresponsive;
            self.inner.server.broadcast(
                Event::NodeUpdate(NodeUpdateEvent {
                    id: node.id,
                    state: node.state,
                    udid: node.udid,
                    last_seen_ns: node.last_seen_ns(),
                }),
                None,
            );
            self.inner.nodes.unregister(node.id);
            let context = self.inner.contexts.lock()[usize::from(node.id)].take();
            if let Some(context) = context {
                let _ = context.terminate.try_send(());
            }
        }
    }

    /// Consume inbound frames forever; the daemon's main loop.
    pub async fn serve(&self, mut frame_rx: mpsc::Receiver<CanFrame>) {
        self.spawn_master_task();

        let mut reassembler = Reassembler::new();
        while let Some(frame) = frame_rx.recv().await {
            let node = ((frame.can_id >> 21) & 0x7F) as NodeId;

            let routed = {
                let contexts = self.inner.contexts.lock();
                contexts[usize::from(node)]
                    .as_ref()
                    .map(|context| context.mailbox.clone())
            };
            let Some(mailbox) = routed else {
                warn!("Got a frame from unknown node {}, discarding {}", node, frame);
                reassembler.clear(node);
                continue;
            };

            match reassembler.ingest(&frame) {
                Err(e) => {
                    warn!("{}, discarding {}", e, frame);
                }
                Ok(Ingest::Incomplete) => {}
                Ok(Ingest::Complete(msg)) => {
                    debug!("** Received {} **", msg);
                    if mailbox.send(msg).await.is_err() {
                        warn!("Mailbox of node {} is gone, discarding message", node);
                    }
                }
            }
        }
        debug!("Frame stream closed, controller serve loop exiting");
    }

    fn spawn_master_task(&self) {
        let (mailbox, rx) = mpsc::channel(MAILBOX_SIZE);
        let (terminate, term_rx) = mpsc::channel(1);
        self.inner.contexts.lock()[0] = Some(NodeContext {
            mailbox,
            terminate,
            pending_firmware: Arc::new(Mutex::new(None)),
        });
        let ctrl = self.clone();
        tokio::spawn(async move {
            ctrl.master_task(rx, term_rx).await;
        });
    }

    /// Node 0: unsolicited address requests land here.
    async fn master_task(&self, mut rx: mpsc::Receiver<Message>, mut term: mpsc::Receiver<()>) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                _ = term.recv() => break,
            };
            let Some(msg) = msg else { break };

            match msg.sys_function() {
                Some(SysFunction::AddressRequest) if msg.is_system() => {
                    self.handle_address_request(&msg).await;
                }
                _ => warn!("Got unexpected message with null node id: {}", msg),
            }
        }
    }

    async fn handle_address_request(&self, msg: &Message) {
        let Some(udid) = nocan::node::Udid8::from_slice(msg.bytes()) else {
            warn!("Address request with a short udid payload, discarding");
            return;
        };
        let (_, firmware_version) = msg.sys_function_param();

        let node = match self
            .inner
            .nodes
            .register(udid, firmware_version, &self.inner.cache)
        {
            Ok(node) => node,
            Err(e) => {
                error!("Failed to register device {}, {}", udid, e);
                return;
            }
        };
        info!(
            "Device {} has been registered as node N{} (fw={})",
            udid, node.id, firmware_version
        );

        self.spawn_node_task(node.id);
        let _ = self
            .send_system_message(0, SysFunction::AddressConfigure, node.id, msg.bytes())
            .await;
    }

    /// Start (or restart) the handler task owning a node's mailbox.
    fn spawn_node_task(&self, id: NodeId) {
        let (mailbox, rx) = mpsc::channel(MAILBOX_SIZE);
        let (terminate, term_rx) = mpsc::channel(1);
        let pending_firmware: PendingFirmware = Arc::new(Mutex::new(None));

        let previous = self.inner.contexts.lock()[usize::from(id)].replace(NodeContext {
            mailbox,
            terminate,
            pending_firmware: pending_firmware.clone(),
        });
        if let Some(previous) = previous {
            // Single-owner invariant: the old task must release the slot.
            let _ = previous.terminate.try_send(());
        }

        let ctrl = self.clone();
        tokio::spawn(async move {
            ctrl.node_task(id, rx, term_rx, pending_firmware).await;
        });
    }

    async fn node_task(
        &self,
        id: NodeId,
        mut rx: mpsc::Receiver<Message>,
        mut term: mpsc::Receiver<()>,
        pending_firmware: PendingFirmware,
    ) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                _ = term.recv() => break,
            };
            let Some(msg) = msg else { break };

            self.handle_node_message(id, msg, &mut rx, &pending_firmware)
                .await;
            self.inner.nodes.touch(id);
        }
        debug!("Handler task for node {} exiting", id);
    }

    async fn handle_node_message(
        &self,
        id: NodeId,
        msg: Message,
        rx: &mut mpsc::Receiver<Message>,
        pending_firmware: &PendingFirmware,
    ) {
        if !msg.is_system() {
            self.handle_publish(id, &msg);
            return;
        }

        let (function, param) = msg.sys_function_param();
        match msg.sys_function() {
            Some(SysFunction::AddressConfigureAck) => {
                self.inner.nodes.set_state(id, NodeState::Connected);
                self.broadcast_node_update(id);
            }

            Some(SysFunction::NodeBootAck) => {
                self.inner.nodes.set_state(id, NodeState::Bootloader);
                let operation = pending_firmware.lock().take();
                match operation {
                    Some(op) => {
                        self.inner.nodes.set_state(id, NodeState::Programming);
                        let result = match op.direction {
                            FirmwareDirection::Upload => {
                                info!("Initiating firmware upload for node {}", id);
                                bootloader::upload(self, id, rx, &op).await
                            }
                            FirmwareDirection::Download => {
                                info!("Initiating firmware download for node {}", id);
                                bootloader::download(self, id, rx, &op).await
                            }
                        };
                        match result {
                            Ok(()) => info!("Firmware operation succeeded for node {}", id),
                            Err(e) => {
                                warn!("Firmware operation failed: {}", e);
                                // The node stays in its bootloader; the
                                // client may retry.
                                self.inner.nodes.set_state(id, NodeState::Bootloader);
                            }
                        }
                    }
                    None => {
                        // Nothing to program: leave the bootloader quickly.
                        let _ = self
                            .send_system_message(id, SysFunction::BootloaderLeave, 0, &[])
                            .await;
                    }
                }
            }

            Some(SysFunction::BootloaderLeaveAck) | Some(SysFunction::NodePingAck) => {}

            Some(SysFunction::ChannelRegister) => {
                let requested = String::from_utf8_lossy(msg.bytes()).into_owned();
                let name = self.expand_for_node(id, &requested);
                if name != requested {
                    debug!("Interpolated channel name {} to {}", requested, name);
                }
                match self.inner.channels.register(&name) {
                    Ok(channel) => {
                        info!("Registered channel {} for node {} as {}", name, id, channel.id);
                        let _ = self
                            .send_system_message(
                                id,
                                SysFunction::ChannelRegisterAck,
                                0x00,
                                &channel.id.to_be_bytes(),
                            )
                            .await;
                        self.inner.server.broadcast(
                            Event::ChannelUpdate(ChannelUpdate::new(
                                channel.id,
                                &channel.name,
                                ChannelStatus::Created,
                                &[],
                            )),
                            None,
                        );
                    }
                    Err(e) => {
                        warn!("Failed to register channel {} for node {}, {}", name, id, e);
                        let _ = self
                            .send_system_message(id, SysFunction::ChannelRegisterAck, 0xFF, &[])
                            .await;
                    }
                }
            }

            Some(SysFunction::ChannelLookup) => {
                let requested = String::from_utf8_lossy(msg.bytes()).into_owned();
                let name = self.expand_for_node(id, &requested);
                match self.inner.channels.lookup(&name) {
                    Some(channel) => {
                        info!("Node {} successfully found id={} for channel {}", id, channel.id, name);
                        let _ = self
                            .send_system_message(
                                id,
                                SysFunction::ChannelLookupAck,
                                0x00,
                                &channel.id.to_be_bytes(),
                            )
                            .await;
                    }
                    None => {
                        warn!("Node {} failed to find id for channel {}", id, name);
                        let _ = self
                            .send_system_message(id, SysFunction::ChannelLookupAck, 0xFF, &[])
                            .await;
                    }
                }
            }

            Some(SysFunction::DebugMessage) => {
                warn!("DEBUG[{}]: {}", param, String::from_utf8_lossy(msg.bytes()));
            }

            _ => {
                let name = SysFunction::from_code(function)
                    .map(|f| f.name())
                    .unwrap_or("nocan-unknown");
                warn!("Message of type {} from node {} was not processed", name, id);
            }
        }
    }

    fn handle_publish(&self, id: NodeId, msg: &Message) {
        let channel_id = msg.channel_id();
        match self.inner.channels.find(channel_id) {
            Some(channel) => {
                info!(
                    "Updated content of channel '{}' (id={}) to {:?}",
                    channel.name,
                    channel_id,
                    String::from_utf8_lossy(msg.bytes())
                );
                self.inner.channels.set_content(channel_id, msg.bytes());
                self.inner.server.broadcast(
                    Event::ChannelUpdate(ChannelUpdate::new(
                        channel_id,
                        &channel.name,
                        ChannelStatus::Updated,
                        msg.bytes(),
                    )),
                    None,
                );
            }
            None => {
                warn!(
                    "Could not update non-existing channel {} for node {}",
                    channel_id, id
                );
            }
        }
    }

    fn expand_for_node(&self, id: NodeId, s: &str) -> String {
        match self.inner.nodes.find(id) {
            Some(node) => node.expand_attributes(s),
            None => s.to_string(),
        }
    }

    fn broadcast_node_update(&self, id: NodeId) {
        if let Some(node) = self.inner.nodes.find(id) {
            self.inner.server.broadcast(
                Event::NodeUpdate(NodeUpdateEvent {
                    id: node.id,
                    state: node.state,
                    udid: node.udid,
                    last_seen_ns: node.last_seen_ns(),
                }),
                None,
            );
        }
    }
}
