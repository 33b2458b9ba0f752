// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request handlers. Every request is answered exactly once, either by a
//! dedicated response event or by a server ack carrying the request's
//! msg id.

use super::{ClientHandle, EventServer};
use crate::controller::{FirmwareDirection, FirmwareOperation, NetworkController};
use nocan::event::{
    AckCode, ChannelStatus, ChannelUpdate, Event, FirmwareProgress, NodeFirmware,
    NodeUpdate as NodeUpdateEvent, ProgressReport,
};
use nocan::node::{NodeState, NULL_UDID};
use nocan::sys::{FLASH_APP_ORIGIN, SysFunction};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle one decoded request; false tears the connection down.
pub(super) async fn dispatch(
    server: &EventServer,
    controller: &NetworkController,
    client: &Arc<ClientHandle>,
    msg_id: u16,
    event: Event,
) -> bool {
    match event {
        Event::ChannelFilter(filter) => {
            client.set_filter(filter);
            client.send(msg_id, Event::ServerAck(AckCode::Success));
            true
        }

        Event::ChannelUpdateRequest { id, name } => {
            let channel = if name.is_empty() {
                controller.channels().find(id)
            } else {
                controller.channels().lookup(&name)
            };
            let update = match channel {
                Some(channel) => ChannelUpdate::new(
                    channel.id,
                    &channel.name,
                    ChannelStatus::Updated,
                    &channel.value,
                ),
                None => ChannelUpdate::new(id, &name, ChannelStatus::NotFound, &[]),
            };
            client.send(msg_id, Event::ChannelUpdate(update));
            true
        }

        Event::ChannelUpdate(update) => {
            handle_channel_update(server, controller, client, msg_id, update).await
        }

        Event::ChannelListRequest => {
            let list: Vec<ChannelUpdate> = controller
                .channels()
                .snapshot()
                .into_iter()
                .map(|channel| {
                    ChannelUpdate::new(
                        channel.id,
                        &channel.name,
                        ChannelStatus::Updated,
                        &channel.value,
                    )
                })
                .collect();
            client.send(msg_id, Event::ChannelList(list));
            true
        }

        Event::NodeUpdateRequest(id) => {
            let update = match controller.nodes().find(id) {
                Some(node) => NodeUpdateEvent {
                    id: node.id,
                    state: node.state,
                    udid: node.udid,
                    last_seen_ns: node.last_seen_ns(),
                },
                None => NodeUpdateEvent {
                    id,
                    state: NodeState::Unknown,
                    udid: NULL_UDID,
                    last_seen_ns: 0,
                },
            };
            client.send(msg_id, Event::NodeUpdate(update));
            true
        }

        Event::NodeListRequest => {
            let list: Vec<NodeUpdateEvent> = controller
                .nodes()
                .snapshot()
                .into_iter()
                .map(|node| NodeUpdateEvent {
                    id: node.id,
                    state: node.state,
                    udid: node.udid,
                    last_seen_ns: node.last_seen_ns(),
                })
                .collect();
            client.send(msg_id, Event::NodeList(list));
            true
        }

        Event::NodeFirmwareUpload(firmware) => {
            handle_firmware_request(
                controller,
                client,
                msg_id,
                firmware,
                FirmwareDirection::Upload,
            )
            .await
        }

        Event::NodeFirmwareDownloadRequest(firmware) => {
            handle_firmware_request(
                controller,
                client,
                msg_id,
                firmware,
                FirmwareDirection::Download,
            )
            .await
        }

        Event::NodeRebootRequest { node, force } => {
            if !force && controller.nodes().find(node).is_none() {
                client.send(msg_id, Event::ServerAck(AckCode::NotFound));
                return true;
            }
            let sent = controller
                .send_system_message(node, SysFunction::NodeBootRequest, 0x01, &[])
                .await
                .is_ok();
            let code = if sent {
                AckCode::Success
            } else {
                AckCode::GeneralFailure
            };
            client.send(msg_id, Event::ServerAck(code));
            true
        }

        Event::BusPower(on) => {
            controller.set_power(on).await;
            client.send(msg_id, Event::ServerAck(AckCode::Success));
            true
        }

        Event::BusPowerStatusUpdateRequest => {
            controller.request_power_status();
            client.send(msg_id, Event::ServerAck(AckCode::Success));
            true
        }

        Event::DeviceInformationRequest => {
            match controller.device_info() {
                Some(info) => client.send(msg_id, Event::DeviceInformation(info)),
                None => {
                    warn!("Device information is not available");
                    client.send(msg_id, Event::ServerAck(AckCode::GeneralFailure))
                }
            };
            true
        }

        Event::SystemPropertiesRequest => {
            client.send(msg_id, Event::SystemProperties(controller.properties()));
            true
        }

        other => {
            warn!(
                "Client {} sent {} which is not a request",
                client,
                other.name()
            );
            client.send(msg_id, Event::ServerAck(AckCode::BadRequest));
            false
        }
    }
}

/// Client-driven channel lifecycle: create, push a value, destroy.
async fn handle_channel_update(
    server: &EventServer,
    controller: &NetworkController,
    client: &Arc<ClientHandle>,
    msg_id: u16,
    update: ChannelUpdate,
) -> bool {
    match update.status {
        ChannelStatus::Created => {
            match controller.channels().register(&update.name) {
                Ok(channel) => {
                    server.broadcast(
                        Event::ChannelUpdate(ChannelUpdate::new(
                            channel.id,
                            &channel.name,
                            ChannelStatus::Created,
                            &[],
                        )),
                        Some(client.id()),
                    );
                    client.send(msg_id, Event::ServerAck(AckCode::Success));
                }
                Err(e) => {
                    warn!("Client {} could not create channel: {}", client, e);
                    client.send(msg_id, Event::ServerAck(AckCode::BadRequest));
                }
            }
            true
        }

        ChannelStatus::Updated => {
            let channel = if update.name.is_empty() {
                controller.channels().find(update.id)
            } else {
                controller.channels().lookup(&update.name)
            };
            let Some(channel) = channel else {
                client.send(msg_id, Event::ServerAck(AckCode::NotFound));
                return true;
            };

            if !controller.channels().set_content(channel.id, &update.value) {
                client.send(msg_id, Event::ServerAck(AckCode::BadRequest));
                return true;
            }
            // Mirror the value onto the bus and to the other clients.
            if let Err(e) = controller.publish(channel.id, &update.value).await {
                warn!("Could not publish channel {} to the bus: {}", channel.id, e);
                client.send(msg_id, Event::ServerAck(AckCode::GeneralFailure));
                return true;
            }
            server.broadcast(
                Event::ChannelUpdate(ChannelUpdate::new(
                    channel.id,
                    &channel.name,
                    ChannelStatus::Updated,
                    &update.value,
                )),
                Some(client.id()),
            );
            client.send(msg_id, Event::ServerAck(AckCode::Success));
            true
        }

        ChannelStatus::Destroyed => {
            let channel = if update.name.is_empty() {
                controller.channels().find(update.id)
            } else {
                controller.channels().lookup(&update.name)
            };
            match channel {
                Some(channel) if controller.channels().unregister(channel.id) => {
                    server.broadcast(
                        Event::ChannelUpdate(ChannelUpdate::new(
                            channel.id,
                            &channel.name,
                            ChannelStatus::Destroyed,
                            &[],
                        )),
                        Some(client.id()),
                    );
                    client.send(msg_id, Event::ServerAck(AckCode::Success));
                }
                _ => {
                    client.send(msg_id, Event::ServerAck(AckCode::NotFound));
                }
            }
            true
        }

        ChannelStatus::NotFound => {
            client.send(msg_id, Event::ServerAck(AckCode::BadRequest));
            true
        }
    }
}

/// Validate and arm a firmware operation, then ask the node to reboot into
/// its bootloader. The operation itself runs inside the node's handler task
/// once the boot ack arrives.
async fn handle_firmware_request(
    controller: &NetworkController,
    client: &Arc<ClientHandle>,
    msg_id: u16,
    firmware: NodeFirmware,
    direction: FirmwareDirection,
) -> bool {
    let node_id = firmware.node;
    let fail = |code: AckCode| {
        client.send(
            0,
            Event::NodeFirmwareProgress(FirmwareProgress::new(
                node_id,
                ProgressReport::Failed,
                0,
            )),
        );
        client.send(msg_id, Event::ServerAck(code));
    };

    if direction == FirmwareDirection::Upload {
        // No bus traffic for images that reach into the bootloader area.
        for (index, block) in firmware.blocks.iter().enumerate() {
            if block.offset < FLASH_APP_ORIGIN {
                warn!(
                    "Firmware block {} contains illegal offset 0x{:x} in bootloader reserved area",
                    index, block.offset
                );
                fail(AckCode::BadRequest);
                return true;
            }
        }
    }

    if controller.nodes().find(node_id).is_none() {
        warn!("Firmware request failed: node {} does not exist", node_id);
        fail(AckCode::NotFound);
        return true;
    }

    let armed = controller.set_pending_firmware(
        node_id,
        FirmwareOperation {
            client: client.clone(),
            direction,
            firmware,
        },
    );
    if !armed {
        warn!("Node {} has no running handler for a firmware operation", node_id);
        fail(AckCode::GeneralFailure);
        return true;
    }

    info!(
        "Requesting bootloader entry on node {} for a firmware {}",
        node_id,
        match direction {
            FirmwareDirection::Upload => "upload",
            FirmwareDirection::Download => "download",
        }
    );
    match controller
        .send_system_message(node_id, SysFunction::NodeBootRequest, 0x01, &[])
        .await
    {
        Ok(()) => {
            client.send(msg_id, Event::ServerAck(AckCode::Success));
        }
        Err(e) => {
            warn!("Could not send boot request to node {}: {}", node_id, e);
            fail(AckCode::GeneralFailure);
        }
    }
    true
}
