//! # Client Connection
//!
//! Wraps one accepted `TcpStream`. Every operation here is non-blocking: reads
//! use `try_read_buf` and stop at the first `WouldBlock`, replies use
//! `try_write` and park whatever the kernel refuses in an outbound buffer that
//! is flushed on the connection's next turn. A connection is either live (it
//! still owns its socket) or retired (the socket has been dropped); there is no
//! half-open state.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes reserved in the inbound buffer before each socket read.
const READ_CHUNK: usize = 4096;

/// Replies a client leaves unread beyond this size retire the connection.
const MAX_PENDING_REPLY_BYTES: usize = 64 * 1024;

/// Any failure on an established connection other than "no data yet".
#[derive(Debug, Error)]
pub enum ConnectionFault {
    #[error("peer closed the connection")]
    Closed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("undecodable line: {0}")]
    Decode(#[from] LinesCodecError),

    #[error("peer stopped reading replies ({0} bytes pending)")]
    Stalled(usize),

    #[error("connection already retired")]
    Detached,
}

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    admitted_at: DateTime<Utc>,
    stream: Option<TcpStream>,
    codec: LinesCodec,
    inbox: BytesMut,
    outbox: BytesMut,
}

impl Connection {
    /// Wraps a freshly accepted stream. The stream must be registered with the
    /// tokio reactor, which is always the case for streams from `TcpListener::accept`.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            admitted_at: Utc::now(),
            stream: Some(stream),
            codec: LinesCodec::new(),
            inbox: BytesMut::with_capacity(READ_CHUNK),
            outbox: BytesMut::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    pub fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    /// Returns the next complete line, without its terminator.
    ///
    /// Lines already buffered are returned before the socket is touched. If no
    /// complete line is available after draining what the socket has right now,
    /// returns `Ok(None)`; a trailing partial line stays buffered for the next call.
    ///
    /// # Errors
    /// [`ConnectionFault::Closed`] on EOF (a buffered partial line is discarded
    /// with the connection), [`ConnectionFault::Io`] on any socket error other
    /// than `WouldBlock`, [`ConnectionFault::Decode`] on invalid UTF-8.
    pub fn read_line(&mut self) -> Result<Option<String>, ConnectionFault> {
        let stream = self.stream.as_ref().ok_or(ConnectionFault::Detached)?;

        loop {
            if let Some(line) = self.codec.decode(&mut self.inbox)? {
                return Ok(Some(line));
            }

            self.inbox.reserve(READ_CHUNK);
            match stream.try_read_buf(&mut self.inbox) {
                Ok(0) => return Err(ConnectionFault::Closed),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queues `reply` for the client and writes as much of it as the socket accepts now.
    pub fn write_reply(&mut self, reply: &[u8]) -> Result<(), ConnectionFault> {
        if self.stream.is_none() {
            return Err(ConnectionFault::Detached);
        }
        self.outbox.extend_from_slice(reply);
        self.flush()?;

        if self.outbox.len() > MAX_PENDING_REPLY_BYTES {
            return Err(ConnectionFault::Stalled(self.outbox.len()));
        }
        Ok(())
    }

    /// Writes pending reply bytes until done or until the socket would block.
    pub fn flush(&mut self) -> Result<(), ConnectionFault> {
        let stream = self.stream.as_ref().ok_or(ConnectionFault::Detached)?;

        while !self.outbox.is_empty() {
            match stream.try_write(&self.outbox) {
                Ok(0) => return Err(ConnectionFault::Closed),
                Ok(n) => self.outbox.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn pending_reply_bytes(&self) -> usize {
        self.outbox.len()
    }

    /// Releases the socket and both buffers. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Dropping the stream closes both directions.
            drop(stream);
            self.inbox.clear();
            self.outbox.clear();
            log::debug!("Connection {} ({}) closed", self.id, self.peer);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("live", &self.is_live())
            .field("buffered", &self.inbox.len())
            .field("pending_reply", &self.outbox.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpSocket};
    use tokio::time::sleep;

    /// A server-side `Connection` and the client stream connected to it.
    pub(crate) async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(server, peer), client)
    }

    /// Like [`pair`], but with small kernel buffers between the two ends, so that
    /// replies the client does not read back up into the outbox quickly.
    pub(crate) async fn tight_pair() -> (Connection, TcpStream) {
        let server = TcpSocket::new_v4().unwrap();
        // Accepted sockets inherit the listener's send buffer size.
        server.set_send_buffer_size(4096).unwrap();
        server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = server.listen(8).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpSocket::new_v4().unwrap();
        client.set_recv_buffer_size(4096).unwrap();
        let client = client.connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (Connection::new(stream, peer), client)
    }

    /// Gives the reactor time to observe socket readiness.
    pub(crate) async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_idle_connection_would_block() {
        let (mut conn, _client) = pair().await;
        settle().await;
        assert!(conn.read_line().unwrap().is_none());
        assert!(conn.is_live());
    }

    #[tokio::test]
    async fn test_reads_complete_lines_in_order() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"hello\r\nworld\n").await.unwrap();
        settle().await;

        assert_eq!(conn.read_line().unwrap().as_deref(), Some("hello"));
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("world"));
        assert!(conn.read_line().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_terminator() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"put cpu 1").await.unwrap();
        settle().await;
        assert!(conn.read_line().unwrap().is_none());

        client.write_all(b"0 1\n").await.unwrap();
        settle().await;
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("put cpu 10 1"));
    }

    #[tokio::test]
    async fn test_eof_after_buffered_lines() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"last\npartial").await.unwrap();
        drop(client);
        settle().await;

        assert_eq!(conn.read_line().unwrap().as_deref(), Some("last"));
        assert!(matches!(conn.read_line(), Err(ConnectionFault::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_fault() {
        let (mut conn, mut client) = pair().await;
        client.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        settle().await;
        assert!(matches!(conn.read_line(), Err(ConnectionFault::Decode(_))));
    }

    #[tokio::test]
    async fn test_reply_reaches_client() {
        let (mut conn, mut client) = pair().await;
        conn.write_reply(b"pong\n").unwrap();
        assert_eq!(conn.pending_reply_bytes(), 0);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong\n");
    }

    #[tokio::test]
    async fn test_unread_replies_stall_the_connection() {
        let (mut conn, _client) = tight_pair().await;
        let chunk = [b'x'; 1024];

        let mut fault = None;
        for _ in 0..2048 {
            if let Err(e) = conn.write_reply(&chunk) {
                fault = Some(e);
                break;
            }
        }
        match fault {
            Some(ConnectionFault::Stalled(pending)) => assert!(pending > MAX_PENDING_REPLY_BYTES),
            other => panic!("expected a stalled connection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_reply_is_flushed_once_client_reads() {
        let (mut conn, mut client) = tight_pair().await;
        let reply = vec![b'r'; 60 * 1024];
        conn.write_reply(&reply).unwrap();
        assert!(conn.pending_reply_bytes() > 0);

        let reader = tokio::spawn(async move {
            let mut received = vec![0u8; 60 * 1024];
            client.read_exact(&mut received).await.map(|_| received)
        });
        while !reader.is_finished() {
            conn.flush().unwrap();
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reader.await.unwrap().unwrap(), reply);
        assert_eq!(conn.pending_reply_bytes(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, mut client) = pair().await;
        conn.close();
        conn.close();
        assert!(!conn.is_live());
        assert!(matches!(conn.read_line(), Err(ConnectionFault::Detached)));
        assert!(matches!(conn.write_reply(b"x"), Err(ConnectionFault::Detached)));

        // The client observes EOF once the server side is gone.
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
