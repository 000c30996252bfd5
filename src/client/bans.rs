//! Global Bans
//!
//! Bans pushed by the master server with `addgban`. The argument is a dotted
//! IPv4 prefix: `1.2.3` bans 1.2.3.0/24, `1.2.3.4` bans a single address, and
//! explicit CIDR (`10.0.0.0/8`) is accepted too.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

/// Unparsable ban argument.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid subnet '{0}'")]
pub struct InvalidSubnet(pub String);

/// An IPv4 network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Network with the host bits cleared.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, InvalidSubnet> {
        if prefix_len > 32 {
            return Err(InvalidSubnet(format!("{}/{}", addr, prefix_len)));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix_len));
        Ok(Self { network, prefix_len })
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `ip` lies inside the network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix_len) == u32::from(self.network)
    }
}

fn mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n)),
    }
}

impl FromStr for Subnet {
    type Err = InvalidSubnet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSubnet(s.to_string());
        let s = s.trim();

        if let Some((addr, prefix)) = s.split_once('/') {
            let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
            let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
            return Subnet::new(addr, prefix);
        }

        let parts = s
            .split('.')
            .map(str::parse::<u8>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid());
        }

        let mut octets = [0u8; 4];
        octets[..parts.len()].copy_from_slice(&parts);
        Subnet::new(Ipv4Addr::from(octets), 8 * parts.len() as u8)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Receiver of bans from the master server.
pub trait BanList: Send + Sync {
    /// Add a ban that applies across servers.
    fn add_global_ban(&self, subnet: Subnet, reason: &str);

    /// Drop every global ban.
    fn clear_global_bans(&self);
}

/// One global ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalBan {
    /// Banned network.
    pub subnet: Subnet,
    /// Why, as shown to the banned player.
    pub reason: String,
    /// When the ban arrived.
    pub added_at: DateTime<Utc>,
}

/// Ban list kept in memory.
#[derive(Debug, Default)]
pub struct MemoryBanList {
    bans: RwLock<Vec<GlobalBan>>,
}

impl MemoryBanList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `ip` is covered by any ban.
    pub fn is_banned(&self, ip: Ipv4Addr) -> bool {
        self.bans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|ban| ban.subnet.contains(ip))
    }

    /// Snapshot of current bans.
    pub fn bans(&self) -> Vec<GlobalBan> {
        self.bans.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl BanList for MemoryBanList {
    fn add_global_ban(&self, subnet: Subnet, reason: &str) {
        let mut bans = self.bans.write().unwrap_or_else(PoisonError::into_inner);
        if bans.iter().any(|ban| ban.subnet == subnet) {
            return;
        }
        info!("Adding global ban for {} ({})", subnet, reason);
        bans.push(GlobalBan {
            subnet,
            reason: reason.to_string(),
            added_at: Utc::now(),
        });
    }

    fn clear_global_bans(&self) {
        let mut bans = self.bans.write().unwrap_or_else(PoisonError::into_inner);
        info!("Clearing {} global bans", bans.len());
        bans.clear();
    }
}
