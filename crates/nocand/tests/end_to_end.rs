// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios: a scripted bus on one side, real event clients on
//! the other, with the controller and server running in between.

use nocan::can::{CanFrame, Ingest, Message, NodeId, Reassembler};
use nocan::event::{AckCode, ChannelStatus, Event, NodeFirmware, ProgressReport};
use nocan::node::{NodeState, Udid8};
use nocan::sys::SysFunction;
use nocan::EventConn;
use nocand::controller::NetworkController;
use nocand::driver::{MockPort, PiMaster};
use nocand::registry::NodeIdCache;
use nocand::server::EventServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TOKEN: &str = "test-token";
const STEP: Duration = Duration::from_secs(2);

struct TestBus {
    controller: NetworkController,
    addr: String,
    /// Frames toward the controller, as if received from the bus.
    bus_in: mpsc::Sender<CanFrame>,
    /// Frames the controller sent toward the bus.
    bus_out: mpsc::Receiver<CanFrame>,
    reassembler: Reassembler,
}

impl TestBus {
    async fn start() -> Self {
        Self::start_with_cache(NodeIdCache::disabled()).await
    }

    async fn start_with_cache(cache: NodeIdCache) -> Self {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);

        let driver = Arc::new(PiMaster::new(Box::new(MockPort::with_valid_signature())));
        let server = EventServer::new(TOKEN);
        let controller = NetworkController::new(driver, server.clone(), cache, out_tx);
        controller
            .initialize(false, 0, true)
            .expect("driver initialize");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        {
            let server = server.clone();
            let controller = controller.clone();
            tokio::spawn(async move {
                server.serve(listener, controller).await;
            });
        }
        {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.serve(in_rx).await;
            });
        }

        Self {
            controller,
            addr,
            bus_in: in_tx,
            bus_out: out_rx,
            reassembler: Reassembler::new(),
        }
    }

    async fn node_sends(&self, msg: Message) {
        for frame in msg.split_frames() {
            self.bus_in.send(frame).await.expect("feed frame");
        }
    }

    /// Reassemble the next complete message the daemon put on the bus.
    async fn daemon_sent(&mut self) -> Message {
        self.daemon_sent_within(STEP).await
    }

    async fn daemon_sent_within(&mut self, wait: Duration) -> Message {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = timeout(deadline - tokio::time::Instant::now(), self.bus_out.recv())
                .await
                .expect("daemon should send a frame in time")
                .expect("bus open");
            if let Ingest::Complete(msg) = self.reassembler.ingest(&frame).expect("valid frame") {
                return msg;
            }
        }
    }

    /// Register a node and complete its configure exchange.
    async fn register_node(&mut self, udid: Udid8, firmware_version: u8) -> NodeId {
        self.node_sends(Message::system(
            0,
            SysFunction::AddressRequest,
            firmware_version,
            udid.as_bytes(),
        ))
        .await;

        let configure = self.daemon_sent().await;
        assert_eq!(
            configure.sys_function(),
            Some(SysFunction::AddressConfigure)
        );
        assert_eq!(configure.bytes(), udid.as_bytes());
        let (_, id) = configure.sys_function_param();

        self.node_sends(Message::system(id, SysFunction::AddressConfigureAck, 0, &[]))
            .await;

        // The state flip is asynchronous; wait for it.
        let deadline = tokio::time::Instant::now() + STEP;
        loop {
            if let Some(node) = self.controller.nodes().find(id) {
                if node.state == NodeState::Connected {
                    return id;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "node {} never reached Connected",
                id
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn udid(tag: u8) -> Udid8 {
    Udid8([tag, 2, 3, 4, 5, 6, 7, 8])
}

async fn expect_event(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    what: &str,
) -> Event {
    timeout(STEP, rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("event stream open")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_registration() {
    let mut bus = TestBus::start().await;

    let client = EventConn::connect(&bus.addr, "test", TOKEN)
        .await
        .expect("connect");
    let mut events = client.subscribe();

    let node_udid = Udid8([1, 2, 3, 4, 5, 6, 7, 8]);
    bus.node_sends(Message::system(
        0,
        SysFunction::AddressRequest,
        3,
        node_udid.as_bytes(),
    ))
    .await;

    let configure = bus.daemon_sent().await;
    assert_eq!(configure.node_id(), 0);
    assert_eq!(
        configure.sys_function(),
        Some(SysFunction::AddressConfigure)
    );
    let (_, assigned) = configure.sys_function_param();
    assert_eq!(assigned, 1);
    assert_eq!(configure.bytes(), node_udid.as_bytes());

    bus.node_sends(Message::system(1, SysFunction::AddressConfigureAck, 0, &[]))
        .await;

    let update = expect_event(&mut events, "node update broadcast").await;
    match update {
        Event::NodeUpdate(update) => {
            assert_eq!(update.id, 1);
            assert_eq!(update.state, NodeState::Connected);
            assert_eq!(update.udid, node_udid);
        }
        other => panic!("expected node update, got {:?}", other),
    }

    // A second request with the same udid reuses the id.
    bus.node_sends(Message::system(
        0,
        SysFunction::AddressRequest,
        3,
        node_udid.as_bytes(),
    ))
    .await;
    let configure = bus.daemon_sent().await;
    let (_, assigned) = configure.sys_function_param();
    assert_eq!(assigned, 1);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_registration_with_interpolation() {
    let mut bus = TestBus::start().await;
    let node = bus.register_node(udid(1), 3).await;
    assert_eq!(node, 1);

    bus.node_sends(Message::system(
        node,
        SysFunction::ChannelRegister,
        0,
        b"sensors/$(ID)/temp",
    ))
    .await;

    let ack = bus.daemon_sent().await;
    assert_eq!(ack.node_id(), node);
    assert_eq!(ack.sys_function(), Some(SysFunction::ChannelRegisterAck));
    let (_, status) = ack.sys_function_param();
    assert_eq!(status, 0x00);
    assert_eq!(ack.bytes(), &[0x00, 0x00]);

    let channel = bus
        .controller
        .channels()
        .lookup("sensors/1/temp")
        .expect("interpolated channel exists");
    assert_eq!(channel.id, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publish_fanout_with_filter() {
    let mut bus = TestBus::start().await;
    let node = bus.register_node(udid(1), 3).await;

    bus.controller.channels().register("zero").expect("channel 0");
    bus.controller.channels().register("one").expect("channel 1");

    let client_a = EventConn::connect(&bus.addr, "a", TOKEN).await.expect("a");
    let client_b = EventConn::connect(&bus.addr, "b", TOKEN).await.expect("b");
    let client_c = EventConn::connect(&bus.addr, "c", TOKEN).await.expect("c");

    let ack = client_a
        .request_ack(Event::ChannelFilter([0u16].into_iter().collect()))
        .await
        .expect("filter a");
    assert_eq!(ack, AckCode::Success);
    let ack = client_b
        .request_ack(Event::ChannelFilter([1u16].into_iter().collect()))
        .await
        .expect("filter b");
    assert_eq!(ack, AckCode::Success);
    // Client C keeps the default (all channels).

    let mut events_a = client_a.subscribe();
    let mut events_b = client_b.subscribe();
    let mut events_c = client_c.subscribe();

    bus.node_sends(Message::publish(node, 0, b"hello")).await;

    for (events, name) in [(&mut events_a, "a"), (&mut events_c, "c")] {
        let event = expect_event(events, name).await;
        match event {
            Event::ChannelUpdate(update) => {
                assert_eq!(update.id, 0, "client {}", name);
                assert_eq!(update.status, ChannelStatus::Updated);
                assert_eq!(update.value, b"hello");
            }
            other => panic!("client {}: expected channel update, got {:?}", name, other),
        }
    }

    // Client B's filter admits only channel 1.
    assert!(
        timeout(Duration::from_millis(300), events_b.recv())
            .await
            .is_err(),
        "client b must not receive the update"
    );

    client_a.close().await;
    client_b.close().await;
    client_c.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_firmware_upload_page() {
    let mut bus = TestBus::start().await;
    let node = bus.register_node(udid(1), 3).await;

    let client = EventConn::connect(&bus.addr, "flash", TOKEN)
        .await
        .expect("connect");
    let mut events = client.subscribe();

    let page: Vec<u8> = (0..0x40).collect();
    let mut firmware = NodeFirmware::upload(node);
    firmware.append_block(0x2000, &page);

    let ack = client
        .request_ack(Event::NodeFirmwareUpload(firmware))
        .await
        .expect("upload request");
    assert_eq!(ack, AckCode::Success);

    // Bootloader entry.
    let boot = bus.daemon_sent().await;
    assert_eq!(boot.sys_function(), Some(SysFunction::NodeBootRequest));
    assert_eq!(boot.sys_function_param().1, 0x01);
    bus.node_sends(Message::system(node, SysFunction::NodeBootAck, 0, &[]))
        .await;

    // SET_ADDRESS(0x2000) -> ERASE -> SET_ADDRESS(0x2000) -> WRITE -> CRC -> LEAVE.
    let set_address = bus.daemon_sent().await;
    assert_eq!(
        set_address.sys_function(),
        Some(SysFunction::BootloaderSetAddress)
    );
    assert_eq!(set_address.sys_function_param().1, b'F');
    assert_eq!(set_address.bytes(), &0x2000u32.to_be_bytes());
    bus.node_sends(Message::system(
        node,
        SysFunction::BootloaderSetAddressAck,
        0,
        &[],
    ))
    .await;

    let erase = bus.daemon_sent().await;
    assert_eq!(erase.sys_function(), Some(SysFunction::BootloaderErase));
    bus.node_sends(Message::system(node, SysFunction::BootloaderEraseAck, 0, &[]))
        .await;

    let set_address = bus.daemon_sent().await;
    assert_eq!(
        set_address.sys_function(),
        Some(SysFunction::BootloaderSetAddress)
    );
    assert_eq!(set_address.bytes(), &0x2000u32.to_be_bytes());
    bus.node_sends(Message::system(
        node,
        SysFunction::BootloaderSetAddressAck,
        0,
        &[],
    ))
    .await;

    let write = bus.daemon_sent().await;
    assert_eq!(write.sys_function(), Some(SysFunction::BootloaderWrite));
    assert_eq!(write.sys_function_param().1, 0);
    assert_eq!(write.bytes(), &page[..]);
    bus.node_sends(Message::system(node, SysFunction::BootloaderWriteAck, 0, &[]))
        .await;

    let crc_write = bus.daemon_sent().await;
    assert_eq!(crc_write.sys_function(), Some(SysFunction::BootloaderWrite));
    assert_eq!(crc_write.sys_function_param().1, 1);
    assert_eq!(crc_write.bytes(), &0x100E_CE8Cu32.to_be_bytes());
    bus.node_sends(Message::system(node, SysFunction::BootloaderWriteAck, 0, &[]))
        .await;

    let leave = bus.daemon_sent().await;
    assert_eq!(leave.sys_function(), Some(SysFunction::BootloaderLeave));

    // Progress stream: {0%, 0}, {100%, 64}, Success.
    let expectations = [
        (ProgressReport::Percent(0), 0u32),
        (ProgressReport::Percent(100), 64),
        (ProgressReport::Success, 0),
    ];
    for (report, transferred) in expectations {
        let event = expect_event(&mut events, "firmware progress").await;
        match event {
            Event::NodeFirmwareProgress(progress) => {
                assert_eq!(progress.node, node);
                assert_eq!(progress.progress, report);
                assert_eq!(progress.transferred, transferred);
            }
            other => panic!("expected firmware progress, got {:?}", other),
        }
    }

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_firmware_download_single_page() {
    let mut bus = TestBus::start().await;
    let node = bus.register_node(udid(1), 3).await;

    let client = EventConn::connect(&bus.addr, "flash", TOKEN)
        .await
        .expect("connect");
    let mut events = client.subscribe();

    let ack = client
        .request_ack(Event::NodeFirmwareDownloadRequest(NodeFirmware::download(
            node, 64,
        )))
        .await
        .expect("download request");
    assert_eq!(ack, AckCode::Success);

    let boot = bus.daemon_sent().await;
    assert_eq!(boot.sys_function(), Some(SysFunction::NodeBootRequest));
    bus.node_sends(Message::system(node, SysFunction::NodeBootAck, 0, &[]))
        .await;

    let set_address = bus.daemon_sent().await;
    assert_eq!(
        set_address.sys_function(),
        Some(SysFunction::BootloaderSetAddress)
    );
    assert_eq!(set_address.bytes(), &0x2000u32.to_be_bytes());
    bus.node_sends(Message::system(
        node,
        SysFunction::BootloaderSetAddressAck,
        0,
        &[],
    ))
    .await;

    let read = bus.daemon_sent().await;
    assert_eq!(read.sys_function(), Some(SysFunction::BootloaderRead));
    assert_eq!(read.sys_function_param().1, 64);
    let page: Vec<u8> = (0x40..0x80).collect();
    bus.node_sends(Message::system(
        node,
        SysFunction::BootloaderReadAck,
        0,
        &page,
    ))
    .await;

    let leave = bus.daemon_sent().await;
    assert_eq!(leave.sys_function(), Some(SysFunction::BootloaderLeave));

    // Progress, then the assembled image back to the requesting client.
    let mut saw_success = false;
    loop {
        let event = expect_event(&mut events, "download progress or image").await;
        match event {
            Event::NodeFirmwareProgress(progress) => {
                if progress.progress == ProgressReport::Success {
                    saw_success = true;
                }
            }
            Event::NodeFirmware(firmware) => {
                assert!(saw_success, "image must arrive after the success report");
                assert_eq!(firmware.node, node);
                assert!(firmware.download);
                assert_eq!(firmware.blocks.len(), 1);
                assert_eq!(firmware.blocks[0].offset, 0x2000);
                assert_eq!(firmware.blocks[0].data, page);
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_firmware_upload_rejected_below_app_origin() {
    let mut bus = TestBus::start().await;
    let node = bus.register_node(udid(1), 3).await;

    let client = EventConn::connect(&bus.addr, "flash", TOKEN)
        .await
        .expect("connect");
    let mut events = client.subscribe();

    let mut firmware = NodeFirmware::upload(node);
    firmware.append_block(0x1FFF, &[0u8; 64]);

    let ack = client
        .request_ack(Event::NodeFirmwareUpload(firmware))
        .await
        .expect("upload request");
    assert_eq!(ack, AckCode::BadRequest);

    let event = expect_event(&mut events, "failed progress").await;
    match event {
        Event::NodeFirmwareProgress(progress) => {
            assert_eq!(progress.progress, ProgressReport::Failed);
        }
        other => panic!("expected failed progress, got {:?}", other),
    }

    // No bus activity at all.
    assert!(bus.bus_out.try_recv().is_err(), "no frames may be sent");

    // The connection stays usable.
    let reply = client
        .request(Event::NodeListRequest)
        .await
        .expect("follow-up request");
    assert!(matches!(reply, Event::NodeList(_)));

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_timeout_unregisters_node() {
    let cache = NodeIdCache::disabled();
    cache.set_entry(udid(5), 5);
    let mut bus = TestBus::start_with_cache(cache).await;

    let node = bus.register_node(udid(5), 3).await;
    assert_eq!(node, 5);

    let client = EventConn::connect(&bus.addr, "watch", TOKEN)
        .await
        .expect("connect");
    let mut events = client.subscribe();

    bus.controller.run_pinger(Duration::from_secs(1));

    // First a ping, once the node has been idle past one interval.
    let ping = bus.daemon_sent_within(Duration::from_secs(5)).await;
    assert_eq!(ping.sys_function(), Some(SysFunction::NodePing));
    assert_eq!(ping.node_id(), 5);

    // Then, with no reply, the unresponsive broadcast and a freed slot.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("unresponsive broadcast in time")
            .expect("event stream open");
        if let Event::NodeUpdate(update) = event {
            if update.state == NodeState::Unresponsive {
                assert_eq!(update.id, 5);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "never saw the unresponsive broadcast"
        );
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while bus.controller.nodes().find(5).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot 5 never freed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_driven_channel_lifecycle() {
    let bus = TestBus::start().await;

    let client = EventConn::connect(&bus.addr, "ctl", TOKEN)
        .await
        .expect("connect");

    // Create.
    let ack = client
        .request_ack(Event::ChannelUpdate(nocan::event::ChannelUpdate::new(
            0,
            "settings/mode",
            ChannelStatus::Created,
            &[],
        )))
        .await
        .expect("create");
    assert_eq!(ack, AckCode::Success);
    assert!(bus.controller.channels().lookup("settings/mode").is_some());

    // Update by name; the value lands in the registry.
    let ack = client
        .request_ack(Event::ChannelUpdate(nocan::event::ChannelUpdate::new(
            0,
            "settings/mode",
            ChannelStatus::Updated,
            b"eco",
        )))
        .await
        .expect("update");
    assert_eq!(ack, AckCode::Success);
    assert_eq!(
        bus.controller
            .channels()
            .lookup("settings/mode")
            .expect("channel")
            .value,
        b"eco"
    );

    // Request the value back.
    let reply = client
        .request(Event::ChannelUpdateRequest {
            id: 0xFFFF,
            name: "settings/mode".to_string(),
        })
        .await
        .expect("request");
    match reply {
        Event::ChannelUpdate(update) => {
            assert_eq!(update.status, ChannelStatus::Updated);
            assert_eq!(update.value, b"eco");
        }
        other => panic!("expected channel update, got {:?}", other),
    }

    // Destroy.
    let ack = client
        .request_ack(Event::ChannelUpdate(nocan::event::ChannelUpdate::new(
            0,
            "settings/mode",
            ChannelStatus::Destroyed,
            &[],
        )))
        .await
        .expect("destroy");
    assert_eq!(ack, AckCode::Success);
    assert!(bus.controller.channels().lookup("settings/mode").is_none());

    // Destroying it again is NotFound.
    let ack = client
        .request_ack(Event::ChannelUpdate(nocan::event::ChannelUpdate::new(
            0,
            "settings/mode",
            ChannelStatus::Destroyed,
            &[],
        )))
        .await
        .expect("destroy again");
    assert_eq!(ack, AckCode::NotFound);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_and_channel_list_requests() {
    let mut bus = TestBus::start().await;
    let node = bus.register_node(udid(7), 3).await;
    bus.controller.channels().register("a").expect("channel");
    bus.controller.channels().register("b").expect("channel");

    let client = EventConn::connect(&bus.addr, "list", TOKEN)
        .await
        .expect("connect");

    let reply = client.request(Event::NodeListRequest).await.expect("nodes");
    match reply {
        Event::NodeList(nodes) => {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, node);
            assert_eq!(nodes[0].state, NodeState::Connected);
        }
        other => panic!("expected node list, got {:?}", other),
    }

    let reply = client
        .request(Event::ChannelListRequest)
        .await
        .expect("channels");
    match reply {
        Event::ChannelList(channels) => {
            assert_eq!(channels.len(), 2);
            assert_eq!(channels[0].name, "a");
            assert_eq!(channels[1].name, "b");
        }
        other => panic!("expected channel list, got {:?}", other),
    }

    // Unknown node reads back as Unknown with a null udid.
    let reply = client
        .request(Event::NodeUpdateRequest(99))
        .await
        .expect("unknown node");
    match reply {
        Event::NodeUpdate(update) => {
            assert_eq!(update.id, 99);
            assert_eq!(update.state, NodeState::Unknown);
            assert!(update.udid.is_null());
        }
        other => panic!("expected node update, got {:?}", other),
    }

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_auth_token_is_rejected() {
    let bus = TestBus::start().await;
    let result = EventConn::connect(&bus.addr, "intruder", "wrong-token").await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_system_properties_request() {
    let bus = TestBus::start().await;
    let client = EventConn::connect(&bus.addr, "props", TOKEN)
        .await
        .expect("connect");

    let reply = client
        .request(Event::SystemPropertiesRequest)
        .await
        .expect("properties");
    match reply {
        Event::SystemProperties(props) => {
            assert!(!props.as_string("nocand_version").is_empty());
        }
        other => panic!("expected system properties, got {:?}", other),
    }

    client.close().await;
}
