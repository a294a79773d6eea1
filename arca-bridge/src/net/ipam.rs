//! Per-network IPv4 address allocation.
//!
//! Host addresses are handed out sequentially within the subnet, skipping
//! the network address, the gateway, anything whose last octet is 0, 1,
//! or 255, and addresses already in use.

use arca_shared::{ArcaError, ArcaResult};
use std::collections::HashSet;
use std::net::Ipv4Addr;

#[derive(Debug)]
pub struct IpAllocator {
    network: u32,
    prefix: u8,
    gateway: Ipv4Addr,
    used: HashSet<Ipv4Addr>,
    cursor: u32,
}

/// Parse `a.b.c.d/len` into (network address, prefix length).
pub fn parse_cidr(cidr: &str) -> ArcaResult<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| ArcaError::InvalidArgument(format!("invalid CIDR {cidr:?}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| ArcaError::InvalidArgument(format!("invalid CIDR {cidr:?}")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| ArcaError::InvalidArgument(format!("invalid CIDR {cidr:?}")))?;
    if len > 30 {
        return Err(ArcaError::InvalidArgument(format!(
            "prefix /{len} leaves no room for hosts"
        )));
    }
    let mask = prefix_mask(len);
    Ok((Ipv4Addr::from(u32::from(addr) & mask), len))
}

fn prefix_mask(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len) }
}

/// Dotted-quad netmask for a prefix length.
pub fn netmask(len: u8) -> Ipv4Addr {
    Ipv4Addr::from(prefix_mask(len))
}

/// Allocate the next free `172.<X>.0.0/16` from the persisted cursor,
/// skipping bytes whose subnet would overlap an existing network.
/// Returns `(subnet, gateway)` and advances the cursor.
pub fn allocate_bridge_subnet(
    store: &crate::db::StateStore,
) -> ArcaResult<(String, String)> {
    use arca_shared::constants::subnet::LAST_BYTE;

    let existing = store.load_all_networks()?;
    let start = store.next_subnet_byte()?;

    for byte in start..=LAST_BYTE {
        let candidate = format!("172.{byte}.0.0/16");
        let overlaps = existing
            .iter()
            .filter(|n| !n.subnet.is_empty())
            .any(|n| subnets_overlap(&candidate, &n.subnet).unwrap_or(true));
        if !overlaps {
            store.set_next_subnet_byte((byte + 1).min(LAST_BYTE))?;
            return Ok((candidate, format!("172.{byte}.0.1")));
        }
    }
    Err(ArcaError::Exhausted("bridge subnet"))
}

/// True if the two CIDR ranges share any address.
pub fn subnets_overlap(a: &str, b: &str) -> ArcaResult<bool> {
    let (net_a, len_a) = parse_cidr(a)?;
    let (net_b, len_b) = parse_cidr(b)?;
    let shared = len_a.min(len_b);
    let mask = prefix_mask(shared);
    Ok(u32::from(net_a) & mask == u32::from(net_b) & mask)
}

impl IpAllocator {
    pub fn new(subnet: &str, gateway: Ipv4Addr) -> ArcaResult<Self> {
        let (network, prefix) = parse_cidr(subnet)?;
        Ok(Self {
            network: u32::from(network),
            prefix,
            gateway,
            used: HashSet::new(),
            cursor: 2,
        })
    }

    fn host_count(&self) -> u32 {
        1u32 << (32 - self.prefix)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix) == self.network
    }

    fn assignable(&self, ip: Ipv4Addr) -> bool {
        let last = ip.octets()[3];
        self.contains(ip) && ip != self.gateway && !matches!(last, 0 | 1 | 255)
    }

    /// Allocate a specific address or the next free one.
    pub fn allocate(&mut self, requested: Option<Ipv4Addr>) -> ArcaResult<Ipv4Addr> {
        if let Some(ip) = requested {
            if !self.assignable(ip) {
                return Err(ArcaError::InvalidArgument(format!(
                    "address {ip} is not assignable in this subnet"
                )));
            }
            if !self.used.insert(ip) {
                return Err(ArcaError::StateConflict(format!(
                    "address {ip} is already in use"
                )));
            }
            return Ok(ip);
        }

        let span = self.host_count();
        for _ in 0..span {
            let candidate = Ipv4Addr::from(self.network + self.cursor);
            self.cursor = (self.cursor + 1) % span;
            if self.cursor == 0 {
                self.cursor = 2;
            }
            if self.assignable(candidate) && self.used.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(ArcaError::Exhausted("subnet address"))
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        self.used.remove(&ip);
    }

    /// Record an address seen in persisted state.
    pub fn mark_used(&mut self, ip: Ipv4Addr) {
        if self.contains(ip) {
            self.used.insert(ip);
        }
    }
}
