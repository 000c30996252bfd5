//! Line Framing
//!
//! Wraps a duplex byte stream as a feed of newline-terminated text messages
//! plus a deadline-bounded line writer.
//!
//! ```text
//!   stream ──► read task ──► mpsc<String> ──► consumer
//!   consumer ──► LineConn::send ──► write half (timeout)
//! ```
//!
//! The read task owns the read half. It ends on EOF, read error, an oversized
//! line, or [`LineConn::close`]; when it ends the message channel closes, and
//! that closing is the consumer's signal that the connection is gone.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Longest accepted line in bytes, excluding the newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Messages buffered between the read task and the consumer.
const INCOMING_CAPACITY: usize = 64;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,
    /// The peer did not accept the line within the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A line-framed connection.
pub struct LineConn {
    peer: SocketAddr,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for LineConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineConn")
            .field("peer", &self.peer)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl LineConn {
    /// Split `stream`, start its read task, and return the connection with its message feed.
    pub fn start<S>(stream: S, peer: SocketAddr, write_timeout: Duration) -> (Self, mpsc::Receiver<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(read_loop(BufReader::new(reader), peer, incoming_tx, closed_rx));

        let conn = Self {
            peer,
            writer: Box::new(writer),
            write_timeout,
            closed: closed_tx,
        };
        (conn, incoming_rx)
    }

    /// Peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one message followed by a newline, bounded by the write deadline.
    ///
    /// Failures are logged here; the caller decides whether to close.
    pub async fn send<M: fmt::Display>(&mut self, message: M) -> Result<(), FramingError> {
        if self.is_closed() {
            return Err(FramingError::Closed);
        }

        let mut line = message.to_string();
        line.push('\n');

        let writer = &mut self.writer;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("{}: write failed: {}", self.peer, e);
                Err(FramingError::Io(e))
            }
            Err(_) => {
                warn!("{}: write timed out after {:?}", self.peer, self.write_timeout);
                Err(FramingError::WriteTimeout(self.write_timeout))
            }
        }
    }

    /// Stop reading and shut the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!("{}: closing connection", self.peer);
        if let Ok(Err(e)) = tokio::time::timeout(self.write_timeout, self.writer.shutdown()).await {
            debug!("{}: shutdown failed: {}", self.peer, e);
        }
    }
}

impl Drop for LineConn {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    peer: SocketAddr,
    incoming: mpsc::Sender<String>,
    mut closed: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 1);

        let read = tokio::select! {
            result = limited.read_until(b'\n', &mut buf) => result,
            _ = closed.changed() => break,
        };

        match read {
            Ok(0) => {
                debug!("{}: end of stream", peer);
                break;
            }
            Ok(_) => {
                if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
                    warn!("{}: line longer than {} bytes, dropping connection", peer, MAX_LINE_LEN);
                    break;
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if incoming.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("{}: read failed: {}", peer, e);
                break;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "10.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_lines_delivered_in_order_and_trimmed() {
        let (local, mut remote) = duplex(1024);
        let (_conn, mut incoming) = LineConn::start(local, peer(), Duration::from_secs(1));

        remote.write_all(b"regserv 28785\r\n  reqauth 1 alice \nlookup 2 bob\n").await.unwrap();

        assert_eq!(incoming.recv().await.unwrap(), "regserv 28785");
        assert_eq!(incoming.recv().await.unwrap(), "reqauth 1 alice");
        assert_eq!(incoming.recv().await.unwrap(), "lookup 2 bob");
    }

    #[tokio::test]
    async fn test_eof_closes_feed() {
        let (local, mut remote) = duplex(1024);
        let (_conn, mut incoming) = LineConn::start(local, peer(), Duration::from_secs(1));

        remote.write_all(b"succreg\n").await.unwrap();
        drop(remote);

        assert_eq!(incoming.recv().await.unwrap(), "succreg");
        assert!(incoming.recv().await.is_none());
        assert!(incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_line_ends_feed() {
        let (local, mut remote) = duplex(16 * 1024);
        let (_conn, mut incoming) = LineConn::start(local, peer(), Duration::from_secs(1));

        let long = format!("{}\nlookup 1 a\n", "x".repeat(MAX_LINE_LEN + 10));
        remote.write_all(long.as_bytes()).await.unwrap();

        assert!(incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_appends_newline() {
        let (local, mut remote) = duplex(1024);
        let (mut conn, _incoming) = LineConn::start(local, peer(), Duration::from_secs(1));

        conn.send("succreg").await.unwrap();
        conn.send(format!("chalauth {} {}", 7, "+abc")).await.unwrap();

        let mut buf = vec![0u8; 64];
        let mut got = String::new();
        while !got.ends_with("+abc\n") {
            let n = remote.read(&mut buf).await.unwrap();
            got.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert_eq!(got, "succreg\nchalauth 7 +abc\n");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_feed() {
        let (local, mut remote) = duplex(1024);
        let (mut conn, mut incoming) = LineConn::start(local, peer(), Duration::from_secs(1));

        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(incoming.recv().await.is_none());
        assert!(matches!(conn.send("succreg").await, Err(FramingError::Closed)));

        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_times_out_on_stalled_peer() {
        let (local, _remote) = duplex(8);
        let (mut conn, _incoming) = LineConn::start(local, peer(), Duration::from_millis(50));

        let result = conn.send("x".repeat(64)).await;
        assert!(matches!(result, Err(FramingError::WriteTimeout(_))));
    }

    #[tokio::test]
    async fn test_peer_addr_is_stable() {
        let (local, _remote) = duplex(64);
        let (conn, _incoming) = LineConn::start(local, peer(), Duration::from_secs(1));
        assert_eq!(conn.peer_addr(), peer());
        assert_eq!(conn.peer_addr(), peer());
    }
}
