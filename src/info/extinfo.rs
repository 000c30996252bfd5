//! Cube 2 UDP Info Protocol
//!
//! Replies echo the request bytes, then carry Cube 2 packed integers:
//! one byte for -126..=127, `0x80` + i16 LE, or `0x81` + i32 LE. Strings are
//! one packed integer per character, terminated by 0.
//!
//! - basic info: request `[1]`, reply `clients, nattrs, attrs.., map, description`
//! - extinfo uptime with mod flag: request `[0, 0, 1]`, reply
//!   `EXT_ACK, EXT_VERSION, uptime [, mod id]`

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{info_addr, BasicInfo, InfoError, InfoQuery};

const BASIC_INFO_REQUEST: [u8; 1] = [1];
const UPTIME_WITH_MOD_REQUEST: [u8; 3] = [0, 0, 1];

const EXT_ACK: i32 = -1;
const EXT_VERSION: i32 = 105;

const MAX_PACKET: usize = 5000;
const DEFAULT_SPEED: i32 = 100;

/// Mod IDs appended to the uptime reply by modded servers.
const KNOWN_MODS: [(i32, &str); 7] = [
    (-2, "hopmod"),
    (-3, "oomod"),
    (-4, "spaghettimod"),
    (-5, "suckerserv"),
    (-6, "remod"),
    (-7, "noobmod"),
    (-8, "zeromod"),
];

/// [`InfoQuery`] over UDP.
#[derive(Debug, Clone)]
pub struct UdpInfoQuery {
    timeout: Duration,
}

impl UdpInfoQuery {
    /// Query with a per-request reply deadline.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn query(&self, game_addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>, InfoError> {
        let target = info_addr(game_addr)?;
        let local = match target.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        socket.send(request).await?;

        let mut buf = vec![0u8; MAX_PACKET];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| InfoError::Timeout(self.timeout))??;
        buf.truncate(len);

        if !buf.starts_with(request) {
            return Err(InfoError::Malformed("reply does not echo the request".to_string()));
        }
        debug!("{}: {} byte info reply", target, len);
        Ok(buf.split_off(request.len()))
    }
}

#[async_trait]
impl InfoQuery for UdpInfoQuery {
    async fn basic_info(&self, game_addr: SocketAddr) -> Result<BasicInfo, InfoError> {
        let reply = self.query(game_addr, &BASIC_INFO_REQUEST).await?;
        parse_basic_info(&reply)
    }

    async fn server_mod(&self, game_addr: SocketAddr) -> Result<Option<String>, InfoError> {
        let reply = self.query(game_addr, &UPTIME_WITH_MOD_REQUEST).await?;
        parse_server_mod(&reply)
    }
}

fn parse_basic_info(reply: &[u8]) -> Result<BasicInfo, InfoError> {
    let mut p = Packet::new(reply);

    let num_clients = p.get_int()?;
    let num_attrs = p.get_int()?;
    if !(5..=32).contains(&num_attrs) {
        return Err(InfoError::Malformed(format!("{} attributes", num_attrs)));
    }
    let attrs = (0..num_attrs)
        .map(|_| p.get_int())
        .collect::<Result<Vec<_>, _>>()?;

    let (paused, game_speed) = if attrs.len() >= 7 {
        (attrs[5] != 0, attrs[6])
    } else {
        (false, DEFAULT_SPEED)
    };

    Ok(BasicInfo {
        num_clients,
        protocol_version: attrs[0],
        game_mode: attrs[1],
        seconds_left: attrs[2],
        max_clients: attrs[3],
        master_mode: attrs[4],
        paused,
        game_speed,
        map: p.get_string()?,
        description: p.get_string()?,
    })
}

fn parse_server_mod(reply: &[u8]) -> Result<Option<String>, InfoError> {
    let mut p = Packet::new(reply);

    let ack = p.get_int()?;
    let version = p.get_int()?;
    if ack != EXT_ACK || version != EXT_VERSION {
        return Err(InfoError::Malformed(format!("extinfo ack {} version {}", ack, version)));
    }
    let _uptime = p.get_int()?;

    if p.is_empty() {
        return Ok(None);
    }
    let id = p.get_int()?;
    let name = KNOWN_MODS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("unknown mod {}", id));
    Ok(Some(name))
}

/// Read cursor over Cube 2 packed data.
struct Packet<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Packet<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], InfoError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| InfoError::Malformed("truncated reply".to_string()))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn get_int(&mut self) -> Result<i32, InfoError> {
        let [b] = self.take::<1>()?;
        match b as i8 {
            -128 => Ok(i32::from(i16::from_le_bytes(self.take::<2>()?))),
            -127 => Ok(i32::from_le_bytes(self.take::<4>()?)),
            n => Ok(i32::from(n)),
        }
    }

    fn get_string(&mut self) -> Result<String, InfoError> {
        let mut out = String::new();
        loop {
            match self.get_int()? {
                0 => return Ok(out),
                c @ 0x20..=0x7e => out.push(char::from(c as u8)),
                _ => out.push('?'),
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
