//! Network addresses of remote nodes
//!
//! A [`NetAddress`] couples a node's identity with the IP endpoint it can be
//! dialed on. Equality and the string form (`id@ip:port`) cover all three
//! parts.

use crate::{NetworkError, NetworkResult, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NetAddress {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Parse `id@host:port`, resolving `host` through DNS when it is not a
    /// literal IP address
    pub async fn resolve(s: &str) -> NetworkResult<Self> {
        if let Ok(addr) = s.parse() {
            return Ok(addr);
        }

        let (id, host_port) = split_id(s)?;
        let mut resolved = tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", s, e)))?;
        let socket_addr = resolved
            .next()
            .ok_or_else(|| NetworkError::InvalidAddress(format!("{}: no addresses", s)))?;

        Ok(Self::new(id, socket_addr))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// `ip:port` form used to open a connection
    pub fn dial_string(&self) -> String {
        self.socket_addr().to_string()
    }

    /// Checks the address can identify a remote endpoint at all
    pub fn validate(&self) -> NetworkResult<()> {
        let ip = self.canonical_ip();
        if self.port == 0 {
            return Err(NetworkError::InvalidAddress(format!("{}: zero port", self)));
        }
        let invalid = match ip {
            IpAddr::V4(v4) => v4.is_unspecified() || v4.is_broadcast(),
            IpAddr::V6(v6) => v6.is_unspecified() || rfc3849(&v6),
        };
        if invalid {
            return Err(NetworkError::InvalidAddress(format!("{}: invalid IP", self)));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Loopback or the 0.0.0.0/8 block
    pub fn is_local(&self) -> bool {
        match self.canonical_ip() {
            IpAddr::V4(v4) => v4.is_loopback() || v4.octets()[0] == 0,
            IpAddr::V6(v6) => v6.is_loopback(),
        }
    }

    /// Valid and reachable over the public internet
    pub fn is_routable(&self) -> bool {
        if !self.is_valid() || self.is_local() {
            return false;
        }
        match self.canonical_ip() {
            IpAddr::V4(v4) => {
                !(v4_in(&v4, [10, 0, 0, 0], 8)
                    || v4_in(&v4, [172, 16, 0, 0], 12)
                    || v4_in(&v4, [192, 168, 0, 0], 16)
                    || v4_in(&v4, [169, 254, 0, 0], 16)
                    || v4_in(&v4, [100, 64, 0, 0], 10)
                    || v4_in(&v4, [192, 0, 2, 0], 24)
                    || v4_in(&v4, [198, 51, 100, 0], 24)
                    || v4_in(&v4, [203, 0, 113, 0], 24))
            }
            IpAddr::V6(v6) => {
                !(v6_in(&v6, Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7)
                    || v6_in(&v6, Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 64)
                    || v6_in(&v6, Ipv6Addr::new(0x2001, 0x10, 0, 0, 0, 0, 0, 0), 28))
            }
        }
    }

    /// Network group used to spread addresses across buckets so a single
    /// operator cannot fill the book from one network block
    pub fn group_key(&self, strict: bool) -> String {
        if strict && self.is_local() {
            return "local".to_string();
        }
        if strict && !self.is_routable() {
            return "unroutable".to_string();
        }

        let v6 = match self.canonical_ip() {
            IpAddr::V4(v4) => return v4_group(v4),
            IpAddr::V6(v6) => v6,
        };
        let octets = v6.octets();

        // RFC6145 / RFC6052: the embedded IPv4 address is in the last 4 bytes
        if v6_in(&v6, Ipv6Addr::new(0, 0, 0, 0, 0xffff, 0, 0, 0), 96)
            || v6_in(&v6, Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), 96)
        {
            return v4_group(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
        }
        // RFC3964 (6to4): bytes 2..6
        if v6_in(&v6, Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16) {
            return v4_group(Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5]));
        }
        // RFC4380 (Teredo): last 4 bytes XOR 0xff
        if v6_in(&v6, Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32) {
            return v4_group(Ipv4Addr::new(
                octets[12] ^ 0xff,
                octets[13] ^ 0xff,
                octets[14] ^ 0xff,
                octets[15] ^ 0xff,
            ));
        }

        // he.net gets /36, everything else /32
        let bits = if v6_in(&v6, Ipv6Addr::new(0x2001, 0x470, 0, 0, 0, 0, 0, 0), 32) {
            36
        } else {
            32
        };
        Ipv6Addr::from(u128::from(v6) & prefix_mask_128(bits)).to_string()
    }

    /// IPv4-mapped IPv6 addresses are treated as plain IPv4
    fn canonical_ip(&self) -> IpAddr {
        match self.ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        }
    }
}

fn split_id(s: &str) -> NetworkResult<(NodeId, &str)> {
    let (id, host_port) = s
        .split_once('@')
        .ok_or_else(|| NetworkError::InvalidAddress(format!("{}: missing node ID", s)))?;
    Ok((id.parse()?, host_port))
}

fn v4_group(ip: Ipv4Addr) -> String {
    let masked = u32::from(ip) & 0xffff_0000;
    Ipv4Addr::from(masked).to_string()
}

fn v4_in(ip: &Ipv4Addr, prefix: [u8; 4], bits: u32) -> bool {
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    (u32::from(*ip) & mask) == (u32::from(Ipv4Addr::from(prefix)) & mask)
}

fn prefix_mask_128(bits: u32) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - bits)
    }
}

fn v6_in(ip: &Ipv6Addr, prefix: Ipv6Addr, bits: u32) -> bool {
    let mask = prefix_mask_128(bits);
    (u128::from(*ip) & mask) == (u128::from(prefix) & mask)
}

/// IPv6 documentation range
fn rfc3849(ip: &Ipv6Addr) -> bool {
    v6_in(ip, Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32)
}

impl FromStr for NetAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, host_port) = split_id(s)?;
        let socket_addr: SocketAddr = host_port
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", s, e)))?;
        Ok(Self::new(id, socket_addr))
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.socket_addr())
    }
}

impl fmt::Debug for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
