// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event client runtime.
//!
//! [`EventConn`] wraps an authenticated connection to the daemon. Requests
//! are correlated through their msg id: a background reader resolves each
//! response against a pending-request map, while spontaneous events
//! (msg id 0) fan out to subscribers.

use super::codec::{decode_event, encode_event};
use super::types::Event;
use super::EventError;
use crate::secure::{SecureReader, SecureStream, SecureWriter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Protocol version sent in the client hello.
pub const HELLO_MAJOR: u8 = 2;
pub const HELLO_MINOR: u8 = 0;

/// How long a request may wait for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Reconnect backoff bounds for [`EventConn::connect_with_retry`].
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(1024);

/// Capacity of the spontaneous-event fanout channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct SendState {
    writer: SecureWriter,
    next_msg_id: u16,
}

/// A connected event client.
pub struct EventConn {
    send: tokio::sync::Mutex<SendState>,
    pending: Arc<Mutex<HashMap<u16, oneshot::Sender<Event>>>>,
    events: broadcast::Sender<Event>,
    closed: Arc<AtomicBool>,
}

impl EventConn {
    /// Connect, authenticate and perform the hello exchange.
    pub async fn connect(addr: &str, tool: &str, token: &str) -> Result<Self, EventError> {
        let stream = TcpStream::connect(addr).await?;
        let secure = SecureStream::client_handshake(stream, tool, token)
            .await
            .map_err(|e| EventError::Protocol(e.to_string()))?;
        let (mut reader, mut writer) = secure.into_split();

        let hello = Event::ClientHello {
            tool: tool.to_string(),
            major: HELLO_MAJOR,
            minor: HELLO_MINOR,
        };
        writer
            .write_record(&encode_event(1, &hello))
            .await
            .map_err(|e| EventError::Protocol(e.to_string()))?;

        let record = reader
            .read_record()
            .await
            .map_err(|e| EventError::Protocol(e.to_string()))?
            .ok_or(EventError::Closed)?;
        let (msg_id, reply) = decode_event(&record)?;
        match reply {
            Event::ServerHello { .. } if msg_id == 1 => {}
            Event::ServerHello { .. } => {
                return Err(EventError::Protocol(format!(
                    "msg id mismatch on server hello: expected 1, got {}",
                    msg_id
                )));
            }
            other => {
                return Err(EventError::Protocol(format!(
                    "expected server-hello-event, got {}",
                    other.name()
                )));
            }
        }

        let pending: Arc<Mutex<HashMap<u16, oneshot::Sender<Event>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_reader(
            reader,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        Ok(Self {
            send: tokio::sync::Mutex::new(SendState {
                writer,
                next_msg_id: 2,
            }),
            pending,
            events,
            closed,
        })
    }

    /// Connect with exponential backoff, doubling from 2 s up to 1024 s.
    pub async fn connect_with_retry(addr: &str, tool: &str, token: &str) -> Self {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match Self::connect(addr, tool, token).await {
                Ok(conn) => return conn,
                Err(e) => {
                    debug!("connection to {} failed: {}, retrying in {:?}", addr, e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Send a request and wait up to 3 s for the correlated response.
    pub async fn request(&self, event: Event) -> Result<Event, EventError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        let msg_id;
        {
            let mut send = self.send.lock().await;
            msg_id = send.next_msg_id;
            send.next_msg_id = match send.next_msg_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            self.pending
                .lock()
                .expect("pending map lock")
                .insert(msg_id, tx);
            if let Err(e) = send.writer.write_record(&encode_event(msg_id, &event)).await {
                self.pending.lock().expect("pending map lock").remove(&msg_id);
                return Err(EventError::Protocol(e.to_string()));
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(EventError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending map lock").remove(&msg_id);
                Err(EventError::Timeout)
            }
        }
    }

    /// Send a request and interpret the response as a server ack.
    pub async fn request_ack(&self, event: Event) -> Result<super::types::AckCode, EventError> {
        match self.request(event).await? {
            Event::ServerAck(code) => Ok(code),
            other => Err(EventError::Protocol(format!(
                "expected server-ack-event, got {}",
                other.name()
            ))),
        }
    }

    /// Subscribe to spontaneous events (msg id 0).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Whether the reader observed the connection closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the write direction; the server tears the connection down.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send.lock().await.writer.shutdown().await;
    }
}

async fn run_reader(
    mut reader: SecureReader,
    pending: Arc<Mutex<HashMap<u16, oneshot::Sender<Event>>>>,
    events: broadcast::Sender<Event>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let record = match reader.read_record().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("server closed the event connection");
                break;
            }
            Err(e) => {
                warn!("event connection read error: {}", e);
                break;
            }
        };

        let (msg_id, event) = match decode_event(&record) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("undecodable event from server: {}", e);
                break;
            }
        };

        if msg_id == 0 {
            // Spontaneous event; nobody listening is fine.
            let _ = events.send(event);
            continue;
        }

        let continuation = pending.lock().expect("pending map lock").remove(&msg_id);
        match continuation {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                warn!("response with unknown msg id {}, closing connection", msg_id);
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    // Dropping the map wakes every in-flight request with Closed.
    pending.lock().expect("pending map lock").clear();
}
