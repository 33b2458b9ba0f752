// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event server: accept loop, per-client pumps and filtered broadcast.
//!
//! Each accepted connection runs the authenticated handshake and then two
//! tasks: a writer draining a bounded outbound queue, and a reader decoding
//! events and running their handlers inline. Handlers only touch bus-side
//! operations through queues, so they never block for long; a watchdog
//! disconnects clients whose handler stalls anyway.

mod handlers;

use crate::controller::NetworkController;
use nocan::event::{codec, AckCode, ChannelFilter, Event};
use nocan::secure::{SecureStream, SecureWriter};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Depth of each client's outbound queue.
const OUTBOUND_QUEUE_SIZE: usize = 16;

/// Budget for one inline handler invocation.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(3);

/// One event queued toward a client, with its correlation msg id.
struct OutboundEvent {
    msg_id: u16,
    event: Event,
}

/// A connected client, shared between its pumps and the broadcast path.
pub struct ClientHandle {
    id: u64,
    peer: SocketAddr,
    name: Mutex<String>,
    out: mpsc::Sender<OutboundEvent>,
    term: Notify,
    filter: Mutex<ChannelFilter>,
    connected: AtomicBool,
    /// Set once the hello exchange is done; broadcasts skip clients that
    /// are still mid-handshake.
    ready: AtomicBool,
}

impl ClientHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue an event toward the client; false when the client is gone or
    /// its queue is full.
    pub fn send(&self, msg_id: u16, event: Event) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.out.try_send(OutboundEvent { msg_id, event }).is_ok()
    }

    pub fn set_filter(&self, filter: ChannelFilter) {
        *self.filter.lock() = filter;
    }

    fn admits(&self, event: &Event) -> bool {
        match event {
            Event::ChannelUpdate(update) => self.filter.lock().admits(update.id),
            _ => true,
        }
    }
}

impl std::fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.peer)
    }
}

struct ClientList {
    top_id: u64,
    clients: Vec<Arc<ClientHandle>>,
}

struct ServerInner {
    auth_token: String,
    clients: Mutex<ClientList>,
}

/// Shared handle to the event server.
#[derive(Clone)]
pub struct EventServer {
    inner: Arc<ServerInner>,
}

impl EventServer {
    #[must_use]
    pub fn new(auth_token: &str) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                auth_token: auth_token.to_string(),
                clients: Mutex::new(ClientList {
                    top_id: 0,
                    clients: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().clients.len()
    }

    /// Broadcast a spontaneous event to every connected client.
    ///
    /// Channel updates honor each client's filter; `exclude` suppresses the
    /// echo to an originating client. Clients whose queue rejects the event
    /// are torn down.
    pub fn broadcast(&self, event: Event, exclude: Option<u64>) {
        let recipients: Vec<Arc<ClientHandle>> = {
            let list = self.inner.clients.lock();
            list.clients
                .iter()
                .filter(|client| client.ready.load(Ordering::Acquire))
                .filter(|client| Some(client.id) != exclude)
                .filter(|client| client.admits(&event))
                .cloned()
                .collect()
        };

        for client in recipients {
            if !client.send(0, event.clone()) {
                warn!("Client {} cannot accept events, removing", client);
                self.remove_client(&client);
            }
        }
    }

    fn remove_client(&self, client: &Arc<ClientHandle>) {
        client.connected.store(false, Ordering::Release);
        // notify_one stores a permit, so the writer sees the termination
        // even if it is mid-write when this fires.
        client.term.notify_one();

        let mut list = self.inner.clients.lock();
        let before = list.clients.len();
        list.clients.retain(|candidate| candidate.id != client.id);
        if list.clients.len() < before {
            debug!("Deleting client {}, closing channel and socket", client);
        }
    }

    /// Accept clients forever.
    pub async fn serve(&self, listener: TcpListener, controller: NetworkController) {
        match listener.local_addr() {
            Ok(addr) => info!("Listening for clients at {}", addr),
            Err(_) => info!("Listening for clients"),
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    let controller = controller.clone();
                    tokio::spawn(async move {
                        server.run_client(stream, peer, controller).await;
                    });
                }
                Err(e) => {
                    error!("Server could not accept connection: {}", e);
                }
            }
        }
    }

    async fn run_client(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        controller: NetworkController,
    ) {
        let secure = match SecureStream::server_handshake(stream, &self.inner.auth_token).await {
            Ok(secure) => secure,
            Err(e) => {
                info!("Client at {} failed to authenticate: {}", peer, e);
                return;
            }
        };
        let peer_name = secure.peer_name().to_string();
        let (mut reader, writer) = secure.into_split();

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let client = {
            let mut list = self.inner.clients.lock();
            let client = Arc::new(ClientHandle {
                id: list.top_id,
                peer,
                name: Mutex::new(peer_name),
                out: out_tx,
                term: Notify::new(),
                filter: Mutex::new(ChannelFilter::default()),
                connected: AtomicBool::new(true),
                ready: AtomicBool::new(false),
            });
            list.top_id += 1;
            list.clients.push(client.clone());
            client
        };
        info!("Client {} successfully authenticated", client);

        let writer_client = client.clone();
        let writer_task = tokio::spawn(async move {
            writer_pump(writer, out_rx, writer_client).await;
        });

        self.reader_loop(&mut reader, &client, &controller).await;

        self.remove_client(&client);
        // The writer observes the termination notify and exits; awaiting it
        // guarantees no further writes to this client's socket.
        let _ = writer_task.await;
    }

    async fn reader_loop(
        &self,
        reader: &mut nocan::secure::SecureReader,
        client: &Arc<ClientHandle>,
        controller: &NetworkController,
    ) {
        let mut expected_msg_id: u16 = 1;
        let mut got_hello = false;

        loop {
            let record = match reader.read_record().await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    info!("Client {} closed connection", client);
                    return;
                }
                Err(e) => {
                    warn!("Client {} read error: {}", client, e);
                    return;
                }
            };

            let (msg_id, event) = match codec::decode_event(&record) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Client {} sent an undecodable event: {}", client, e);
                    return;
                }
            };

            if msg_id != expected_msg_id {
                warn!(
                    "Client {} sent msg id {} while {} was expected",
                    client, msg_id, expected_msg_id
                );
                client.send(msg_id, Event::ServerAck(AckCode::BadRequest));
                return;
            }
            expected_msg_id = match expected_msg_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };

            if !got_hello {
                match event {
                    Event::ClientHello { tool, major, minor } => {
                        debug!(
                            "Client {} is {} v{}.{}",
                            client, tool, major, minor
                        );
                        *client.name.lock() = tool;
                        client.send(
                            msg_id,
                            Event::ServerHello {
                                tool: "nocand".to_string(),
                                major: nocan::event::client::HELLO_MAJOR,
                                minor: nocan::event::client::HELLO_MINOR,
                            },
                        );
                        client.ready.store(true, Ordering::Release);
                        got_hello = true;
                        continue;
                    }
                    other => {
                        warn!(
                            "Client {} sent {} before the hello exchange",
                            client,
                            other.name()
                        );
                        client.send(msg_id, Event::ServerAck(AckCode::BadRequest));
                        return;
                    }
                }
            }

            debug!(
                "Processing event {} from client {}",
                event.name(),
                client
            );
            let outcome = tokio::time::timeout(
                HANDLER_TIMEOUT,
                handlers::dispatch(self, controller, client, msg_id, event),
            )
            .await;
            match outcome {
                Ok(true) => {}
                Ok(false) => return,
                Err(_) => {
                    error!(
                        "Handler for client {} took more than {:?}, disconnecting",
                        client, HANDLER_TIMEOUT
                    );
                    return;
                }
            }
        }
    }
}

async fn writer_pump(
    mut writer: SecureWriter,
    mut queue: mpsc::Receiver<OutboundEvent>,
    client: Arc<ClientHandle>,
) {
    loop {
        let item = tokio::select! {
            item = queue.recv() => item,
            _ = client.term.notified() => break,
        };
        let Some(item) = item else { break };

        let encoded = codec::encode_event(item.msg_id, &item.event);
        if let Err(e) = writer.write_record(&encoded).await {
            warn!("Client {} write error: {}", client, e);
            break;
        }
    }
    // Flush anything queued before the teardown, so a final ack still
    // reaches the client.
    while let Ok(item) = queue.try_recv() {
        let encoded = codec::encode_event(item.msg_id, &item.event);
        if writer.write_record(&encoded).await.is_err() {
            break;
        }
    }
    writer.shutdown().await;
}
