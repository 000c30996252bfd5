//! Game Server Client
//!
//! The other end of the master protocol: a game server's session with the
//! master, the auth provider riding on it, and the ban list it feeds.

pub mod bans;
pub mod provider;
pub mod session;

pub use bans::{BanList, GlobalBan, InvalidSubnet, MemoryBanList, Subnet};
pub use provider::RemoteAuthProvider;
pub use session::{
    AdminCredentials, AdminError, MasterSession, ReconnectPolicy, SessionConfig, SessionError, SessionEvent,
    SessionHandle,
};
