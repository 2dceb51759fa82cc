//! Framed stream connection
//!
//! Wraps one TCP stream with the envelope codec. A [`Connection`] is owned by exactly
//! one task; everyone else talks to it through a [`ConnectionHandle`].

use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{CodecError, Decoder, Encoder, Frame, Message};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Represents a stream connection to the other peer
pub struct Connection {
    /// Remote peer address
    remote_addr: SocketAddr,
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle on {}: {}", remote_addr, e);
        }

        Self {
            remote_addr,
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send one envelope
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive one envelope. `Ok(None)` means the peer closed the stream cleanly.
    ///
    /// Cancel safe: the only suspension point is the socket read, and bytes already
    /// read stay buffered for the next call.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Shut down the write half; the peer sees end-of-stream
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A handle for feeding envelopes to the task that owns a [`Connection`]
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    /// Distinguishes successive connections of the same peer socket
    id: u64,
    remote_addr: SocketAddr,
    sender: mpsc::Sender<Message>,
    shutdown: mpsc::Sender<()>,
}

impl ConnectionHandle {
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        sender: mpsc::Sender<Message>,
        shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            sender,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue an envelope for sending
    pub async fn send(&self, message: Message) -> ConnectionResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Ask the owning task to close the connection
    pub fn close(&self) {
        // A full channel means a close is already queued.
        let _ = self.shutdown.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, server_peer) = accepted.unwrap();
        (Connection::new(client, addr), Connection::new(server, server_peer))
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (mut a, mut b) = pair().await;

        a.send(&Message::new(MessageKind::Chat, json!("hi"))).await.unwrap();
        a.send(&Message::introduce("alice")).await.unwrap();

        let first = b.recv().await.unwrap().unwrap();
        let second = b.recv().await.unwrap().unwrap();
        assert_eq!(first.message.body, json!("hi"));
        assert_eq!(second.message, Message::introduce("alice"));
        assert_eq!(b.stats().messages_received, 2);
        assert_eq!(a.stats().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_clean_close() {
        let (mut a, mut b) = pair().await;
        a.close().await.unwrap();
        assert!(b.recv().await.unwrap().is_none());
    }
}
