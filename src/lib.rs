//! # Cube Master
//!
//! Master server for Cube 2 game servers: game servers register with it,
//! authenticate their players through it with a P-192 challenge-response,
//! and report match stats to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CUBE MASTER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  auth/           - Curve primitives and auth routing         │
//! │  ├── keys.rs     - P-192 key pairs and their text form       │
//! │  ├── challenge.rs- Challenge issuance and solving            │
//! │  └── manager.rs  - Auth providers by domain                  │
//! │                                                              │
//! │  network/        - Master side of the line protocol          │
//! │  ├── protocol.rs - Wire messages                             │
//! │  ├── framing.rs  - Newline framing with write deadlines      │
//! │  ├── ledger.rs   - Request ID correlation                    │
//! │  ├── handler.rs  - Per-connection state machine              │
//! │  └── server.rs   - TCP accept loop                           │
//! │                                                              │
//! │  client/         - Game server side                          │
//! │  ├── session.rs  - Registration, reconnects, admin           │
//! │  ├── provider.rs - Player auth through the master            │
//! │  └── bans.rs     - Global ban list                           │
//! │                                                              │
//! │  storage/        - Users, servers, games (in memory)         │
//! │  info/           - UDP server info and mod identification    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authentication
//!
//! A user is a name and a public key `pub = priv * G`. To authenticate, the
//! master sends `s * G` for a fresh scalar `s`; the player answers with the X
//! coordinate of `priv * (s * G)`, which the master checks against the X
//! coordinate of `s * pub`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod info;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use auth::{
    generate_challenge, generate_key_pair, solve, AuthManager, AuthProvider, Challenge, PrivateKey, PublicKey, Role,
    Solution,
};
pub use client::{MasterSession, SessionConfig, SessionEvent, SessionHandle};
pub use config::{MasterConfig, DEFAULT_PORT};
pub use network::{MasterServer, Reply, Request};
pub use storage::{MemoryStore, Store};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
