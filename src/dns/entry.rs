//! Resolved address entries.

use crate::dns::wire::RecordType;
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use time::OffsetDateTime;

/// IP address family a resolver instance is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V6,
    V4,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// The address record type queried for this family.
    pub fn record_type(self) -> RecordType {
        match self {
            Family::V4 => RecordType::A,
            Family::V6 => RecordType::Aaaa,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// A single resolved address and the time it stops being valid.
///
/// Entries sort IPv6 before IPv4, then by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entry {
    address: IpAddr,
    expires_at: Option<OffsetDateTime>,
}

impl Entry {
    /// Creates an entry that never expires (IP literals, hosts file).
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            expires_at: None,
        }
    }

    pub fn with_expiry(address: IpAddr, expires_at: OffsetDateTime) -> Self {
        Self {
            address,
            expires_at: Some(expires_at),
        }
    }

    /// Creates an entry valid for `ttl` seconds from now.
    pub fn with_ttl(address: IpAddr, ttl: u32) -> Self {
        Self::with_expiry(
            address,
            OffsetDateTime::now_utc() + time::Duration::seconds(i64::from(ttl)),
        )
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn family(&self) -> Family {
        Family::of(&self.address)
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

impl From<IpAddr> for Entry {
    fn from(address: IpAddr) -> Self {
        Entry::new(address)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family()
            .cmp(&other.family())
            .then_with(|| self.address.cmp(&other.address))
            .then_with(|| self.expires_at.cmp(&other.expires_at))
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.address, f)
    }
}

/// Removes repeated addresses, keeping the first occurrence.
pub fn dedup_entries(entries: &mut Vec<Entry>) {
    let mut seen = Vec::with_capacity(entries.len());
    entries.retain(|entry| {
        if seen.contains(&entry.address) {
            false
        } else {
            seen.push(entry.address);
            true
        }
    });
}
