//! In-Memory Store
//!
//! Process-local implementation of every storage trait. Users can be seeded
//! from a JSON file mapping names to encoded public keys:
//!
//! ```json
//! { "alice": "+2c0e4c7fa6f47a1a2d4d5a9e1ab1b53c4f63b3fa8c5e5f3d", "root": "-..." }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{GameId, GameStore, ServerId, ServerStore, StoreError, UserStore};
use crate::auth::PublicKey;
use crate::network::protocol::PlayerStats;

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Encoded public key as stored.
    pub public_key: String,
    /// When the user was added.
    pub created_at: DateTime<Utc>,
    /// Last successful authentication.
    pub last_authed_at: Option<DateTime<Utc>>,
}

/// A game server seen by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Identity.
    pub id: ServerId,
    /// Address the server registered from.
    pub ip: IpAddr,
    /// Game port.
    pub port: u16,
    /// Server description from its info reply.
    pub description: String,
    /// Server mod, when identified.
    pub server_mod: Option<String>,
    /// First registration.
    pub first_seen_at: DateTime<Utc>,
    /// Last registration or submission.
    pub last_active_at: DateTime<Utc>,
}

/// A finished match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    /// Identity.
    pub id: GameId,
    /// Server that hosted the match.
    pub server: ServerId,
    /// Game mode number.
    pub mode: i64,
    /// Map name.
    pub map: String,
    /// When the stats arrived.
    pub recorded_at: DateTime<Utc>,
}

/// One player's line of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    /// Match.
    pub game: GameId,
    /// Player name.
    pub name: String,
    /// Frags.
    pub frags: i64,
    /// Deaths.
    pub deaths: i64,
    /// Damage dealt.
    pub damage: i64,
    /// Potential damage of shots fired.
    pub shot_damage: i64,
    /// Flags scored.
    pub flags: i64,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    servers: BTreeMap<ServerId, ServerRecord>,
    games: BTreeMap<GameId, GameRecord>,
    stats: Vec<StatsRecord>,
    next_server_id: ServerId,
    next_game_id: GameId,
}

/// Store backed by in-process tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load users from a JSON file of `name -> public key`. Existing names are overwritten.
    pub fn load_users(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Backend(format!("reading {}: {}", path.display(), e)))?;
        let count = self.load_users_json(&text)?;
        info!("Loaded {} users from {}", count, path.display());
        Ok(count)
    }

    /// Load users from JSON text of `name -> public key`.
    pub fn load_users_json(&self, text: &str) -> Result<usize, StoreError> {
        let entries: BTreeMap<String, String> =
            serde_json::from_str(text).map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut keys = Vec::with_capacity(entries.len());
        for (name, key) in &entries {
            let key: PublicKey = key
                .parse()
                .map_err(|e| StoreError::CorruptKey(format!("{}: {}", name, e)))?;
            keys.push((name.as_str(), key));
        }

        for (name, key) in &keys {
            self.add_user(name, key, true)?;
        }
        Ok(keys.len())
    }

    /// Snapshot of one user.
    pub fn user(&self, name: &str) -> Option<UserRecord> {
        self.read().ok()?.users.get(name).cloned()
    }

    /// Snapshot of all known servers.
    pub fn servers(&self) -> Vec<ServerRecord> {
        self.read()
            .map(|t| t.servers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all games.
    pub fn games(&self) -> Vec<GameRecord> {
        self.read()
            .map(|t| t.games.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stat lines stored for `game`.
    pub fn stats(&self, game: GameId) -> Vec<StatsRecord> {
        self.read()
            .map(|t| t.stats.iter().filter(|s| s.game == game).cloned().collect())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

impl UserStore for MemoryStore {
    fn public_key(&self, name: &str) -> Result<PublicKey, StoreError> {
        let tables = self.read()?;
        let user = tables.users.get(name).ok_or(StoreError::NotFound)?;
        user.public_key
            .parse()
            .map_err(|e| StoreError::CorruptKey(format!("{}: {}", name, e)))
    }

    fn add_user(&self, name: &str, key: &PublicKey, overwrite: bool) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !overwrite && tables.users.contains_key(name) {
            return Err(StoreError::AlreadyExists);
        }
        tables.users.insert(
            name.to_string(),
            UserRecord {
                public_key: key.to_string(),
                created_at: Utc::now(),
                last_authed_at: None,
            },
        );
        Ok(())
    }

    fn delete_user(&self, name: &str) -> Result<(), StoreError> {
        self.write()?
            .users
            .remove(name)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn user_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.read()?.users.contains_key(name))
    }

    fn touch_user(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let user = tables.users.get_mut(name).ok_or(StoreError::NotFound)?;
        user.last_authed_at = Some(Utc::now());
        Ok(())
    }
}

impl ServerStore for MemoryStore {
    fn server_id(
        &self,
        ip: IpAddr,
        port: u16,
        description: &str,
        server_mod: Option<&str>,
    ) -> Result<ServerId, StoreError> {
        let mut tables = self.write()?;
        let now = Utc::now();

        if let Some(server) = tables
            .servers
            .values_mut()
            .find(|s| s.ip == ip && s.port == port)
        {
            server.description = description.to_string();
            server.server_mod = server_mod.map(str::to_string);
            server.last_active_at = now;
            return Ok(server.id);
        }

        tables.next_server_id += 1;
        let id = tables.next_server_id;
        tables.servers.insert(
            id,
            ServerRecord {
                id,
                ip,
                port,
                description: description.to_string(),
                server_mod: server_mod.map(str::to_string),
                first_seen_at: now,
                last_active_at: now,
            },
        );
        Ok(id)
    }

    fn touch_server(&self, id: ServerId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let server = tables.servers.get_mut(&id).ok_or(StoreError::NotFound)?;
        server.last_active_at = Utc::now();
        Ok(())
    }
}

impl GameStore for MemoryStore {
    fn add_game(&self, server: ServerId, mode: i64, map: &str) -> Result<GameId, StoreError> {
        let mut tables = self.write()?;
        if !tables.servers.contains_key(&server) {
            return Err(StoreError::NotFound);
        }

        tables.next_game_id += 1;
        let id = tables.next_game_id;
        tables.games.insert(
            id,
            GameRecord {
                id,
                server,
                mode,
                map: map.to_string(),
                recorded_at: Utc::now(),
            },
        );
        Ok(id)
    }

    fn add_stats(&self, game: GameId, stats: &PlayerStats) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !tables.games.contains_key(&game) {
            return Err(StoreError::NotFound);
        }
        tables.stats.push(StatsRecord {
            game,
            name: stats.name.clone(),
            frags: stats.frags,
            deaths: stats.deaths,
            damage: stats.damage,
            shot_damage: stats.shot_damage,
            flags: stats.flags,
        });
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
