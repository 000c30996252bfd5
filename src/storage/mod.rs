//! Storage Collaborators
//!
//! Narrow interfaces the connection handler uses to reach durable state:
//! users and their public keys, game server identities, and match records.
//! Implementations serialize their own writes; handlers share one store
//! behind an `Arc<dyn Store>`.

pub mod memory;

pub use memory::MemoryStore;

use std::net::IpAddr;

use thiserror::Error;

use crate::auth::PublicKey;
use crate::network::protocol::PlayerStats;

/// Durable game server identity.
pub type ServerId = i64;

/// Durable match record identity.
pub type GameId = i64;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under that key.
    #[error("not found")]
    NotFound,
    /// Insert collided with an existing record.
    #[error("already exists")]
    AlreadyExists,
    /// A stored public key no longer parses.
    #[error("stored public key is corrupt: {0}")]
    CorruptKey(String),
    /// Backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Users and their public keys.
pub trait UserStore: Send + Sync {
    /// Public key registered for `name`.
    fn public_key(&self, name: &str) -> Result<PublicKey, StoreError>;

    /// Add a user. With `overwrite` false an existing name fails with [`StoreError::AlreadyExists`].
    fn add_user(&self, name: &str, key: &PublicKey, overwrite: bool) -> Result<(), StoreError>;

    /// Delete a user.
    fn delete_user(&self, name: &str) -> Result<(), StoreError>;

    /// Whether `name` is registered.
    fn user_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Record a successful authentication for `name`.
    fn touch_user(&self, name: &str) -> Result<(), StoreError>;
}

/// Game server identities.
pub trait ServerStore: Send + Sync {
    /// Look up or create the identity for the server at `ip:port`, refreshing its description and mod.
    fn server_id(
        &self,
        ip: IpAddr,
        port: u16,
        description: &str,
        server_mod: Option<&str>,
    ) -> Result<ServerId, StoreError>;

    /// Record activity from a server.
    fn touch_server(&self, id: ServerId) -> Result<(), StoreError>;
}

/// Match records.
pub trait GameStore: Send + Sync {
    /// Create a game record for a finished match.
    fn add_game(&self, server: ServerId, mode: i64, map: &str) -> Result<GameId, StoreError>;

    /// Store one player's line for a game.
    fn add_stats(&self, game: GameId, stats: &PlayerStats) -> Result<(), StoreError>;
}

/// Everything a connection handler needs.
pub trait Store: UserStore + ServerStore + GameStore {}

impl<T: UserStore + ServerStore + GameStore> Store for T {}
