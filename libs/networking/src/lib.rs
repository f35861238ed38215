//! IPv4 CIDR helpers for VPC subnet planning.
//!
//! This library provides:
//! - A validated [`Ipv4Cidr`] type (always stored in masked form)
//! - Containment, overlap and aligned sub-block iteration
//! - The carrier-grade NAT "unroutable" space used for non-routed subnets
//! - Sizing rules for spreading one subnet group across availability zones

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// CIDR parsing and planning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrError {
    /// Invalid IPv4 address.
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Invalid or missing prefix length.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Requested sub-block is larger than its parent.
    #[error("cannot carve /{requested} out of {parent}")]
    PrefixTooShort { parent: Ipv4Cidr, requested: u8 },

    /// Too many availability zones for one subnet group.
    #[error("more than {max} availability zones is not supported (asked for {requested})")]
    TooManyZones { requested: usize, max: usize },
}

// ============================================================================
// Ipv4Cidr
// ============================================================================

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    /// Network address (host bits cleared).
    address: Ipv4Addr,

    /// Prefix length (0..=32).
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a CIDR, masking away host bits.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, CidrError> {
        if prefix_len > 32 {
            return Err(CidrError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        Ok(Self {
            address: Ipv4Addr::from(u32::from(address) & mask(prefix_len)),
            prefix_len,
        })
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.address
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of addresses covered.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    fn first(&self) -> u64 {
        u64::from(u32::from(self.address))
    }

    fn last(&self) -> u64 {
        self.first() + self.size() - 1
    }

    /// Whether `addr` falls inside this network.
    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix_len) == u32::from(self.address)
    }

    /// Whether `other` is entirely inside this network (equal counts).
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix_len >= self.prefix_len && self.contains_addr(other.address)
    }

    /// Whether the two networks share any address.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The enclosing network with a shorter prefix.
    pub fn supernet(&self, prefix_len: u8) -> Result<Ipv4Cidr, CidrError> {
        if prefix_len > self.prefix_len {
            return Err(CidrError::InvalidPrefix(format!(
                "/{} is not a supernet of {}",
                prefix_len, self
            )));
        }
        Self::new(self.address, prefix_len)
    }

    /// All aligned sub-blocks of the given prefix length, in address order.
    pub fn subnets(&self, prefix_len: u8) -> Result<Subnets, CidrError> {
        if prefix_len < self.prefix_len {
            return Err(CidrError::PrefixTooShort {
                parent: *self,
                requested: prefix_len,
            });
        }
        if prefix_len > 32 {
            return Err(CidrError::InvalidPrefix(prefix_len.to_string()));
        }
        Ok(Subnets {
            next: self.first(),
            last: self.last(),
            step: 1u64 << (32 - u32::from(prefix_len)),
            prefix_len,
        })
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

/// Iterator over aligned sub-blocks, see [`Ipv4Cidr::subnets`].
#[derive(Debug, Clone)]
pub struct Subnets {
    next: u64,
    last: u64,
    step: u64,
    prefix_len: u8,
}

impl Iterator for Subnets {
    type Item = Ipv4Cidr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.last {
            return None;
        }
        let address = Ipv4Addr::from(self.next as u32);
        self.next += self.step;
        Some(Ipv4Cidr {
            address,
            prefix_len: self.prefix_len,
        })
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(CidrError::InvalidPrefix(format!("missing '/' in CIDR: {}", s)));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| CidrError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| CidrError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The default route, `0.0.0.0/0`.
pub const DEFAULT_ROUTE: Ipv4Cidr = Ipv4Cidr {
    address: Ipv4Addr::UNSPECIFIED,
    prefix_len: 0,
};

// ============================================================================
// Free-space search
// ============================================================================

/// First aligned `/prefix_len` block of `within` that overlaps nothing in `used`.
pub fn first_free_block(within: &Ipv4Cidr, prefix_len: u8, used: &[Ipv4Cidr]) -> Option<Ipv4Cidr> {
    within
        .subnets(prefix_len)
        .ok()?
        .find(|candidate| !used.iter().any(|u| u.overlaps(candidate)))
}

/// Smallest prefix (between /16 and /28) able to hold `addresses` addresses.
pub fn prefix_for_address_count(addresses: u64) -> Option<u8> {
    (16..=28u8)
        .rev()
        .find(|prefix| addresses <= 1u64 << (32 - u32::from(*prefix)))
}

// ============================================================================
// Availability-zone sizing
// ============================================================================

/// Largest number of AZs a single subnet group may span.
pub const MAX_ZONES_PER_GROUP: usize = 8;

/// How many bits a per-AZ block is split from its aggregate.
///
/// One AZ uses the aggregate as-is; two need one extra bit, three or four
/// need two, five to eight need three.
pub fn zone_split_bits(zone_count: usize) -> Result<u8, CidrError> {
    match zone_count {
        0 | 1 => Ok(0),
        2 => Ok(1),
        3..=4 => Ok(2),
        5..=MAX_ZONES_PER_GROUP => Ok(3),
        _ => Err(CidrError::TooManyZones {
            requested: zone_count,
            max: MAX_ZONES_PER_GROUP,
        }),
    }
}

// ============================================================================
// Unroutable space
// ============================================================================

/// The shared address space unroutable subnets are carved from.
pub const UNROUTABLE_SUPERNET: Ipv4Cidr = Ipv4Cidr {
    address: Ipv4Addr::new(100, 64, 0, 0),
    prefix_len: 10,
};

/// Prefix length of one unroutable VPC CIDR.
pub const UNROUTABLE_BLOCK_PREFIX: u8 = 16;

/// Every `/16` an unroutable VPC CIDR may use (`100.64.0.0/16` .. `100.127.0.0/16`).
pub fn unroutable_blocks() -> Subnets {
    Subnets {
        next: UNROUTABLE_SUPERNET.first(),
        last: UNROUTABLE_SUPERNET.last(),
        step: 1u64 << (32 - u32::from(UNROUTABLE_BLOCK_PREFIX)),
        prefix_len: UNROUTABLE_BLOCK_PREFIX,
    }
}

/// Whether `cidr` lies in unroutable space.
pub fn is_unroutable(cidr: &Ipv4Cidr) -> bool {
    UNROUTABLE_SUPERNET.contains(cidr)
}

/// The unroutable `/16` enclosing `cidr`, if it lies in unroutable space.
pub fn unroutable_block_of(cidr: &Ipv4Cidr) -> Option<Ipv4Cidr> {
    if !is_unroutable(cidr) || cidr.prefix_len < UNROUTABLE_BLOCK_PREFIX {
        return None;
    }
    cidr.supernet(UNROUTABLE_BLOCK_PREFIX).ok()
}

/// Per-AZ subnets of an unroutable `/16`, one per zone in order.
pub fn split_unroutable_block(
    block: &Ipv4Cidr,
    zone_count: usize,
) -> Result<Vec<Ipv4Cidr>, CidrError> {
    let prefix = UNROUTABLE_BLOCK_PREFIX + zone_split_bits(zone_count)?;
    Ok(block.subnets(prefix)?.take(zone_count.max(1)).collect())
}
