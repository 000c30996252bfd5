//! Game Server Info
//!
//! Queries a registering game server over its UDP info port (game port + 1)
//! to confirm it is reachable and to learn its description. Mod
//! identification is a separate, best-effort query.

pub mod extinfo;

pub use extinfo::UdpInfoQuery;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Info query errors.
#[derive(Debug, Error)]
pub enum InfoError {
    /// No info port can be derived from the game address.
    #[error("no info port for {0}")]
    InvalidAddress(SocketAddr),
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// No reply within the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// Reply did not decode.
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Basic server info from the ping reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicInfo {
    /// Connected players.
    pub num_clients: i32,
    /// Network protocol version.
    pub protocol_version: i32,
    /// Current game mode.
    pub game_mode: i32,
    /// Seconds left in the match.
    pub seconds_left: i32,
    /// Player slots.
    pub max_clients: i32,
    /// Master mode (open, veto, locked, private...).
    pub master_mode: i32,
    /// Whether the game is paused.
    pub paused: bool,
    /// Game speed in percent.
    pub game_speed: i32,
    /// Current map.
    pub map: String,
    /// Server description.
    pub description: String,
}

/// Reachability and identification queries against a game server.
#[async_trait]
pub trait InfoQuery: Send + Sync {
    /// Basic info of the game server listening on `game_addr`.
    async fn basic_info(&self, game_addr: SocketAddr) -> Result<BasicInfo, InfoError>;

    /// Name of the server mod, `None` for vanilla servers.
    async fn server_mod(&self, game_addr: SocketAddr) -> Result<Option<String>, InfoError>;
}

/// Info port address for a game address.
pub fn info_addr(game_addr: SocketAddr) -> Result<SocketAddr, InfoError> {
    let port = game_addr
        .port()
        .checked_add(1)
        .ok_or(InfoError::InvalidAddress(game_addr))?;
    Ok(SocketAddr::new(game_addr.ip(), port))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_addr_is_next_port() {
        let game: SocketAddr = "192.0.2.5:28785".parse().unwrap();
        assert_eq!(info_addr(game).unwrap(), "192.0.2.5:28786".parse().unwrap());
    }

    #[test]
    fn test_info_addr_overflow() {
        let game: SocketAddr = "192.0.2.5:65535".parse().unwrap();
        assert!(matches!(info_addr(game), Err(InfoError::InvalidAddress(_))));
    }
}
