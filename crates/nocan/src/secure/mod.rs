// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authenticated record stream between daemon and clients.
//!
//! # How it works
//!
//! 1. Both sides frame every exchange as `u32 BE length | bytes`.
//! 2. The client opens with its tool name and a 16-byte nonce.
//! 3. The server answers with its own nonce and a proof digest binding the
//!    shared auth token to both nonces.
//! 4. The client verifies the proof and returns the mirrored digest; the
//!    server verifies it before accepting any event traffic.
//!
//! Either verification failure closes the connection. The token itself never
//! crosses the wire. After the handshake the stream is a plain sequence of
//! records; event framing runs inside record payloads.

pub mod digest;

use digest::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Upper bound for a single record.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

const NONCE_SIZE: usize = 16;
const PROOF_SIZE: usize = 32;

/// Secure stream errors.
#[derive(Debug, Error)]
pub enum SecureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection during the handshake")]
    Closed,
    #[error("malformed handshake record")]
    Malformed,
    #[error("authentication proof mismatch")]
    BadProof,
    #[error("record length {0} exceeds maximum")]
    RecordTooLarge(usize),
}

/// An authenticated, record-framed TCP stream.
pub struct SecureStream {
    reader: SecureReader,
    writer: SecureWriter,
    peer_name: String,
}

/// Read half of a [`SecureStream`].
pub struct SecureReader {
    half: OwnedReadHalf,
}

/// Write half of a [`SecureStream`].
pub struct SecureWriter {
    half: OwnedWriteHalf,
}

impl SecureStream {
    /// Connect-side handshake: prove knowledge of `token` to the server.
    pub async fn client_handshake(
        stream: TcpStream,
        name: &str,
        token: &str,
    ) -> Result<Self, SecureError> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = SecureReader { half: read_half };
        let mut writer = SecureWriter { half: write_half };

        let client_nonce = fresh_nonce();
        let mut hello = Vec::with_capacity(1 + name.len() + NONCE_SIZE);
        let name_len = name.len().min(255);
        hello.push(name_len as u8);
        hello.extend_from_slice(&name.as_bytes()[..name_len]);
        hello.extend_from_slice(&client_nonce);
        writer.write_record(&hello).await?;

        let reply = reader.read_record().await?.ok_or(SecureError::Closed)?;
        if reply.len() != NONCE_SIZE + PROOF_SIZE {
            return Err(SecureError::Malformed);
        }
        let server_nonce: [u8; NONCE_SIZE] = reply[..NONCE_SIZE].try_into().unwrap_or_default();
        let expected = proof(token, &client_nonce, &server_nonce, b"server");
        if !digest_eq(&reply[NONCE_SIZE..], &expected) {
            return Err(SecureError::BadProof);
        }

        let answer = proof(token, &server_nonce, &client_nonce, b"client");
        writer.write_record(&answer).await?;

        Ok(Self {
            reader,
            writer,
            peer_name: String::new(),
        })
    }

    /// Accept-side handshake: challenge the client and verify its proof.
    pub async fn server_handshake(stream: TcpStream, token: &str) -> Result<Self, SecureError> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = SecureReader { half: read_half };
        let mut writer = SecureWriter { half: write_half };

        let hello = reader.read_record().await?.ok_or(SecureError::Closed)?;
        if hello.is_empty() {
            return Err(SecureError::Malformed);
        }
        let name_len = usize::from(hello[0]);
        if hello.len() != 1 + name_len + NONCE_SIZE {
            return Err(SecureError::Malformed);
        }
        let peer_name = String::from_utf8_lossy(&hello[1..1 + name_len]).into_owned();
        let client_nonce: [u8; NONCE_SIZE] =
            hello[1 + name_len..].try_into().unwrap_or_default();

        let server_nonce = fresh_nonce();
        let mut challenge = Vec::with_capacity(NONCE_SIZE + PROOF_SIZE);
        challenge.extend_from_slice(&server_nonce);
        challenge.extend_from_slice(&proof(token, &client_nonce, &server_nonce, b"server"));
        writer.write_record(&challenge).await?;

        let answer = reader.read_record().await?.ok_or(SecureError::Closed)?;
        let expected = proof(token, &server_nonce, &client_nonce, b"client");
        if !digest_eq(&answer, &expected) {
            return Err(SecureError::BadProof);
        }

        Ok(Self {
            reader,
            writer,
            peer_name,
        })
    }

    /// Name announced by the peer during the handshake (server side only).
    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub async fn read_record(&mut self) -> Result<Option<Vec<u8>>, SecureError> {
        self.reader.read_record().await
    }

    pub async fn write_record(&mut self, payload: &[u8]) -> Result<(), SecureError> {
        self.writer.write_record(payload).await
    }

    /// Split into independently owned halves for reader/writer tasks.
    #[must_use]
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl SecureReader {
    /// Read one record; `Ok(None)` on orderly EOF at a record boundary.
    pub async fn read_record(&mut self) -> Result<Option<Vec<u8>>, SecureError> {
        let mut len_buf = [0u8; 4];
        match self.half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(SecureError::Io(e)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(SecureError::RecordTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.half.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

impl SecureWriter {
    pub async fn write_record(&mut self, payload: &[u8]) -> Result<(), SecureError> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(SecureError::RecordTooLarge(payload.len()));
        }
        self.half
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.half.write_all(payload).await?;
        self.half.flush().await?;
        Ok(())
    }

    /// Close the write direction, letting the peer observe EOF.
    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

fn proof(token: &str, first: &[u8], second: &[u8], label: &[u8]) -> [u8; PROOF_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(first);
    hasher.update(second);
    hasher.update(label);
    hasher.finalize()
}

/// Constant-time digest comparison.
fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Session-unique nonce from the clock, thread id and a process counter.
fn fresh_nonce() -> [u8; NONCE_SIZE] {
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tid_hash = {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    };

    let mut seed = [0u8; 24];
    seed[..8].copy_from_slice(&nanos.to_le_bytes());
    seed[8..16].copy_from_slice(&count.to_le_bytes());
    seed[16..].copy_from_slice(&tid_hash.to_le_bytes());

    let digest = digest::sha256(&seed);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}
