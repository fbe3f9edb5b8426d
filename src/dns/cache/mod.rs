//! Resolution cache.
//!
//! Maps lower-cased hostnames to the raw answer records (addresses and
//! aliases) that resolved them. The number of hostnames is bounded; when
//! the bound is reached the least recently inserted hostname is dropped.
//! Records carry an absolute expiry derived from their TTL and are
//! filtered out lazily on lookup.
//!
//! Storage is pluggable through [`CacheStore`]: [`MemoryStore`] keeps
//! everything in process, [`SqliteStore`] persists to disk. Callers only
//! ever see [`ResolverCache`], a cloneable handle that serializes access
//! to the store.

mod memory;
mod persistent;

pub use memory::MemoryStore;
pub use persistent::SqliteStore;

use crate::base::neterror::NetError;
use crate::dns::entry::{dedup_entries, Entry, Family};
use crate::dns::hosts::HostsFile;
use crate::dns::wire::{Record, RecordData};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

/// Maximum number of hostnames kept by default.
pub const MAX_CACHE_SIZE: usize = 512;

// Bound on alias indirections followed during a lookup.
const MAX_ALIAS_DEPTH: usize = 16;

/// Payload of a cached record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachedData {
    Address(IpAddr),
    Alias(String),
}

/// A cached answer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub name: String,
    pub data: CachedData,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

impl CachedRecord {
    /// Converts a decoded answer, anchoring its TTL at `now`.
    pub fn from_record(record: &Record, now: OffsetDateTime) -> Self {
        let data = match &record.data {
            RecordData::Address(ip) => CachedData::Address(*ip),
            RecordData::Alias(target) => CachedData::Alias(normalize(target)),
        };
        Self {
            name: normalize(&record.name),
            data,
            expires_at: now + time::Duration::seconds(i64::from(record.ttl)),
        }
    }

    pub fn address(name: &str, ip: IpAddr, expires_at: OffsetDateTime) -> Self {
        Self {
            name: normalize(name),
            data: CachedData::Address(ip),
            expires_at,
        }
    }

    pub fn alias(name: &str, target: &str, expires_at: OffsetDateTime) -> Self {
        Self {
            name: normalize(name),
            data: CachedData::Alias(normalize(target)),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    fn family(&self) -> Option<Family> {
        match &self.data {
            CachedData::Address(ip) => Some(Family::of(ip)),
            CachedData::Alias(_) => None,
        }
    }
}

/// Backing storage for [`ResolverCache`].
///
/// Stores keep hostnames in insertion order; `insert` moves a hostname to
/// the newest position, `update` rewrites its records in place.
pub trait CacheStore: Send {
    fn get(&mut self, hostname: &str) -> Result<Option<Vec<CachedRecord>>, NetError>;

    fn insert(&mut self, hostname: &str, records: Vec<CachedRecord>) -> Result<(), NetError>;

    fn update(&mut self, hostname: &str, records: Vec<CachedRecord>) -> Result<(), NetError>;

    fn remove(&mut self, hostname: &str) -> Result<bool, NetError>;

    /// The least recently inserted hostname.
    fn oldest(&mut self) -> Result<Option<String>, NetError>;

    /// All hostnames, oldest first.
    fn hostnames(&mut self) -> Result<Vec<String>, NetError>;

    fn len(&mut self) -> Result<usize, NetError>;

    fn clear(&mut self) -> Result<(), NetError>;

    /// Opens a batch of writes applied together by `commit`.
    fn begin(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    /// Discards every write since `begin`.
    fn rollback(&mut self) -> Result<(), NetError> {
        Ok(())
    }
}

struct Inner {
    store: Box<dyn CacheStore>,
    max_size: usize,
}

/// Thread-safe handle to a resolution cache.
///
/// Clones share the same store. Storage failures of a persisted backend are
/// logged and treated as cache misses.
#[derive(Clone)]
pub struct ResolverCache {
    inner: Arc<Mutex<Inner>>,
    hosts: Arc<HostsFile>,
}

impl Default for ResolverCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for ResolverCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverCache")
            .field("max_size", &self.inner.lock().max_size)
            .field("hosts", &self.hosts.path())
            .finish_non_exhaustive()
    }
}

impl ResolverCache {
    /// Volatile cache without hosts file lookups.
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Cache persisted in the SQLite file at `path`.
    pub fn persistent(path: &Path) -> Result<Self, NetError> {
        Ok(Self::with_store(SqliteStore::open(path)?))
    }

    pub fn with_store(store: impl CacheStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                store: Box::new(store),
                max_size: MAX_CACHE_SIZE,
            })),
            hosts: Arc::new(HostsFile::empty()),
        }
    }

    pub fn with_max_size(self, max_size: usize) -> Self {
        self.inner.lock().max_size = max_size.max(1);
        self
    }

    pub fn with_hosts(mut self, hosts: HostsFile) -> Self {
        self.hosts = Arc::new(hosts);
        self
    }

    /// Resolves without the network: IP literal, then cache, then hosts
    /// file.
    pub fn resolve(&self, hostname: &str) -> Option<Vec<Entry>> {
        if let Some(ip) = parse_ip_literal(hostname) {
            return Some(vec![Entry::new(ip)]);
        }

        if let Some(entries) = self.get(hostname) {
            return Some(entries);
        }

        let ips = self.hosts.lookup(hostname);
        if ips.is_empty() {
            None
        } else {
            tracing::trace!(host = %hostname, count = ips.len(), "hosts file hit");
            Some(ips.iter().copied().map(Entry::new).collect())
        }
    }

    /// Unexpired addresses cached for `hostname`, following aliases.
    pub fn get(&self, hostname: &str) -> Option<Vec<Entry>> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock();
        let mut entries = Vec::new();

        if let Err(e) = lookup(inner.store.as_mut(), &normalize(hostname), now, 0, &mut entries) {
            tracing::warn!(host = %hostname, error = %e, "cache lookup failed");
            return None;
        }

        dedup_entries(&mut entries);
        if entries.is_empty() {
            None
        } else {
            Some(entries)
        }
    }

    /// Stores decoded answer records for `hostname`.
    pub fn set(&self, hostname: &str, family: Family, records: &[Record]) {
        let now = OffsetDateTime::now_utc();
        let records = records
            .iter()
            .map(|record| CachedRecord::from_record(record, now))
            .collect();
        self.insert_records(hostname, family, records);
    }

    /// Stores records for `hostname`; records named after another host are
    /// also indexed under that name.
    pub fn insert_records(&self, hostname: &str, family: Family, records: Vec<CachedRecord>) {
        let hostname = normalize(hostname);
        let mut inner = self.inner.lock();

        let mut others: Vec<(String, Vec<CachedRecord>)> = Vec::new();
        for record in &records {
            if record.name == hostname {
                continue;
            }
            match others.iter_mut().find(|(name, _)| *name == record.name) {
                Some((_, list)) => list.push(record.clone()),
                None => others.push((record.name.clone(), vec![record.clone()])),
            }
        }

        let result = atomically(&mut inner, |inner| {
            insert(inner, &hostname, family, records)?;
            for (name, list) in others {
                insert(inner, &name, family, list)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(host = %hostname, error = %e, "cache insert failed");
        }
    }

    /// Removes `ip` from `hostname` and from every alias target it leads
    /// to. A name is dropped once a lookup of it would return no address.
    pub fn evict(&self, hostname: &str, ip: IpAddr) {
        let hostname = normalize(hostname);
        let mut inner = self.inner.lock();

        if let Err(e) = atomically(&mut inner, |inner| evict_address(inner, &hostname, ip)) {
            tracing::warn!(host = %hostname, error = %e, "cache evict failed");
        }
    }

    /// Number of cached hostnames.
    pub fn len(&self) -> usize {
        self.inner.lock().store.len().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cache size unavailable");
            0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached hostnames, oldest first.
    pub fn hostnames(&self) -> Vec<String> {
        self.inner.lock().store.hostnames().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cache listing failed");
            Vec::new()
        })
    }

    pub fn clear(&self) {
        if let Err(e) = self.inner.lock().store.clear() {
            tracing::warn!(error = %e, "cache clear failed");
        }
    }
}

fn insert(
    inner: &mut Inner,
    hostname: &str,
    family: Family,
    records: Vec<CachedRecord>,
) -> Result<(), NetError> {
    let existing = inner.store.get(hostname)?;

    if existing.is_none() {
        while inner.store.len()? >= inner.max_size {
            let Some(oldest) = inner.store.oldest()? else {
                break;
            };
            tracing::trace!(host = %oldest, "cache full, dropping oldest hostname");
            inner.store.remove(&oldest)?;
        }
    }

    // Fresh records of this family replace the previous ones.
    let mut merged: Vec<CachedRecord> = existing.unwrap_or_default();
    merged.retain(|r| r.family() != Some(family) && !records.iter().any(|n| n.data == r.data));

    let merged = match family {
        Family::V6 => records.into_iter().chain(merged).collect(),
        Family::V4 => merged.into_iter().chain(records).collect(),
    };
    inner.store.insert(hostname, merged)
}

fn atomically(
    inner: &mut Inner,
    writes: impl FnOnce(&mut Inner) -> Result<(), NetError>,
) -> Result<(), NetError> {
    inner.store.begin()?;
    match writes(inner) {
        Ok(()) => inner.store.commit(),
        Err(e) => {
            if let Err(rollback) = inner.store.rollback() {
                tracing::warn!(error = %rollback, "cache rollback failed");
            }
            Err(e)
        }
    }
}

fn evict_address(inner: &mut Inner, hostname: &str, ip: IpAddr) -> Result<(), NetError> {
    let mut chain = Vec::new();
    alias_chain(inner.store.as_mut(), hostname, 0, &mut chain)?;

    for name in &chain {
        let Some(mut records) = inner.store.get(name)? else {
            continue;
        };
        let before = records.len();
        records.retain(|r| r.data != CachedData::Address(ip));
        if records.len() != before {
            inner.store.update(name, records)?;
        }
    }

    // Targets first, so an emptied target also empties the names above it.
    let now = OffsetDateTime::now_utc();
    for name in chain.iter().rev() {
        let mut remaining = Vec::new();
        lookup(inner.store.as_mut(), name, now, 0, &mut remaining)?;
        if remaining.is_empty() {
            tracing::debug!(host = %name, "evicted last cached address");
            inner.store.remove(name)?;
        }
    }
    Ok(())
}

/// `hostname` followed by the alias targets reachable from it.
fn alias_chain(
    store: &mut dyn CacheStore,
    hostname: &str,
    depth: usize,
    chain: &mut Vec<String>,
) -> Result<(), NetError> {
    if depth > MAX_ALIAS_DEPTH || chain.iter().any(|name| name == hostname) {
        return Ok(());
    }
    let Some(records) = store.get(hostname)? else {
        return Ok(());
    };
    chain.push(hostname.to_string());

    for record in records {
        if let CachedData::Alias(target) = record.data {
            alias_chain(store, &target, depth + 1, chain)?;
        }
    }
    Ok(())
}

fn lookup(
    store: &mut dyn CacheStore,
    hostname: &str,
    now: OffsetDateTime,
    depth: usize,
    out: &mut Vec<Entry>,
) -> Result<(), NetError> {
    if depth > MAX_ALIAS_DEPTH {
        return Ok(());
    }
    let Some(records) = store.get(hostname)? else {
        return Ok(());
    };

    let total = records.len();
    let live: Vec<CachedRecord> = records
        .into_iter()
        .filter(|r| !r.is_expired_at(now))
        .collect();

    if live.is_empty() {
        tracing::trace!(host = %hostname, "cached records expired");
        store.remove(hostname)?;
        return Ok(());
    }
    if live.len() != total {
        store.update(hostname, live.clone())?;
    }

    for record in live {
        match record.data {
            CachedData::Address(ip) => out.push(Entry::with_expiry(ip, record.expires_at)),
            CachedData::Alias(target) => {
                if target != hostname {
                    lookup(store, &target, now, depth + 1, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Parses `hostname` as an IP address, accepting bracketed IPv6.
pub fn parse_ip_literal(hostname: &str) -> Option<IpAddr> {
    let host = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname);
    host.parse().ok()
}

/// Cache key form of a hostname.
pub fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
