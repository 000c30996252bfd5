//! Master Server Configuration
//!
//! Defaults suit a public master server; every field can be overridden from
//! the environment. Unparsable values keep the default and log a warning.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default master server port.
pub const DEFAULT_PORT: u16 = 28787;

/// Master server configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline for writing one reply.
    pub write_timeout: Duration,
    /// Deadline for game server info queries.
    pub info_timeout: Duration,
    /// JSON file of users to load at startup.
    pub users_file: Option<PathBuf>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            max_connections: 1000,
            write_timeout: Duration::from_secs(10),
            info_timeout: Duration::from_secs(10),
            users_file: None,
        }
    }
}

impl MasterConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: parse_or(&lookup, "MASTER_BIND_ADDR", defaults.bind_addr),
            max_connections: parse_or(&lookup, "MASTER_MAX_CONNECTIONS", defaults.max_connections),
            write_timeout: Duration::from_secs(parse_or(
                &lookup,
                "MASTER_WRITE_TIMEOUT_SECS",
                defaults.write_timeout.as_secs(),
            )),
            info_timeout: Duration::from_secs(parse_or(
                &lookup,
                "MASTER_INFO_TIMEOUT_SECS",
                defaults.info_timeout.as_secs(),
            )),
            users_file: lookup("MASTER_USERS_FILE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}='{}', using {:?}", key, raw, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = MasterConfig::default();
        assert_eq!(config.bind_addr.port(), 28787);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert!(config.users_file.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config = MasterConfig::from_lookup(lookup_from(&[
            ("MASTER_BIND_ADDR", "127.0.0.1:4000"),
            ("MASTER_MAX_CONNECTIONS", "5"),
            ("MASTER_WRITE_TIMEOUT_SECS", "3"),
            ("MASTER_INFO_TIMEOUT_SECS", "4"),
            ("MASTER_USERS_FILE", "/etc/master/users.json"),
        ]));

        assert_eq!(config.bind_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.write_timeout, Duration::from_secs(3));
        assert_eq!(config.info_timeout, Duration::from_secs(4));
        assert_eq!(config.users_file, Some(PathBuf::from("/etc/master/users.json")));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = MasterConfig::from_lookup(lookup_from(&[
            ("MASTER_BIND_ADDR", "not an address"),
            ("MASTER_MAX_CONNECTIONS", "-3"),
            ("MASTER_USERS_FILE", ""),
        ]));

        assert_eq!(config.bind_addr, MasterConfig::default().bind_addr);
        assert_eq!(config.max_connections, 1000);
        assert!(config.users_file.is_none());
    }
}
