//! Master Server
//!
//! TCP accept loop. Each accepted connection gets its own line-framed
//! [`ConnectionHandler`] task; a broadcast channel tells every task to close
//! on shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, instrument, warn};

use super::framing::LineConn;
use super::handler::ConnectionHandler;
use crate::config::MasterConfig;
use crate::info::InfoQuery;
use crate::storage::Store;

/// Master server errors.
#[derive(Debug, thiserror::Error)]
pub enum MasterServerError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// The master server.
pub struct MasterServer {
    config: MasterConfig,
    store: Arc<dyn Store>,
    info: Arc<dyn InfoQuery>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl MasterServer {
    /// Create a server over the given collaborators.
    pub fn new(config: MasterConfig, store: Arc<dyn Store>, info: Arc<dyn InfoQuery>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (local_addr, _) = watch::channel(None);

        Self {
            config,
            store,
            info,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            local_addr,
        }
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    #[instrument(skip(self), fields(bind_addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), MasterServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr.send_replace(Some(local_addr));
        info!("Master server listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Acquire) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Spawn the handler task for an accepted connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let (conn, incoming) = LineConn::start(stream, addr, self.config.write_timeout);
        let handler = ConnectionHandler::new(conn, self.store.clone(), self.info.clone());
        let shutdown_rx = self.shutdown_tx.subscribe();
        let connections = self.connections.clone();

        connections.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            handler.run(incoming, shutdown_rx).await;
            connections.fetch_sub(1, Ordering::AcqRel);
            info!("Connection {} cleaned up", addr);
        });
    }

    /// Address the listener is bound to, once it is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.local_addr.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|addr| *addr)
    }

    /// Tell the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Currently open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_key_pair, solve, Challenge};
    use crate::info::fake::FakeInfo;
    use crate::network::protocol::Reply;
    use crate::storage::{MemoryStore, UserStore};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_config() -> MasterConfig {
        MasterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    fn start(config: MasterConfig, store: Arc<MemoryStore>) -> Arc<MasterServer> {
        let server = Arc::new(MasterServer::new(config, store, Arc::new(FakeInfo::reachable("test"))));
        let running = server.clone();
        tokio::spawn(async move { running.run().await });
        server
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = MasterServer::new(
            test_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeInfo::reachable("test")),
        );
        assert_eq!(server.connection_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_register_and_authenticate_over_tcp() {
        let store = Arc::new(MemoryStore::new());
        let (private, public) = generate_key_pair().unwrap();
        store.add_user("alice", &public, false).unwrap();

        let server = start(test_config(), store);
        let addr = server.local_addr().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"regserv 28785\nreqauth 3 alice\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "succreg");

        let line = lines.next_line().await.unwrap().unwrap();
        let Reply::ChalAuth { request_id, challenge } = Reply::parse(&line).unwrap() else {
            panic!("expected chalauth, got {}", line);
        };
        let challenge: Challenge = challenge.parse().unwrap();
        let answer = solve(&challenge, &private);

        writer
            .write_all(format!("confauth {} {}\n", request_id, answer).as_bytes())
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "succauth 3");
        assert_eq!(server.connection_count(), 1);

        server.shutdown();
        let closed = tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = MasterConfig {
            max_connections: 1,
            ..test_config()
        };
        let server = start(config, Arc::new(MemoryStore::new()));
        let addr = server.local_addr().await.unwrap();

        let first = TcpStream::connect(addr).await.unwrap();
        let (first_reader, mut first_writer) = first.into_split();
        let mut first_lines = BufReader::new(first_reader).lines();
        first_writer.write_all(b"regserv 28785\n").await.unwrap();
        assert_eq!(first_lines.next_line().await.unwrap().unwrap(), "succreg");

        let second = TcpStream::connect(addr).await.unwrap();
        let (second_reader, _second_writer) = second.into_split();
        let mut second_lines = BufReader::new(second_reader).lines();
        let rejected = tokio::time::timeout(Duration::from_secs(2), second_lines.next_line()).await.unwrap();
        assert!(matches!(rejected, Ok(None) | Err(_)));

        server.shutdown();
    }
}
