//! Multi-family resolution.
//!
//! [`MultiResolver`] owns one [`FamilyResolver`] per configured address
//! family. A request is first answered from the cache or hosts file when
//! possible; otherwise it is submitted to every requested family and the
//! answers are merged into one address list per request.
//!
//! When an IPv4 answer arrives while the IPv6 query is still outstanding,
//! emission is deferred by the resolution delay so a slightly slower IPv6
//! answer still wins. Each request emits exactly once.

use crate::base::neterror::NetError;
use crate::dns::backend::FamilyResolver;
use crate::dns::cache::{parse_ip_literal, ResolverCache};
use crate::dns::entry::{dedup_entries, Entry, Family};
use crate::dns::hosts::HostsFile;
use crate::dns::options::ResolverOptions;
use crate::dns::{Interest, RequestId, Resolution};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Result delivered once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Resolved {
        id: RequestId,
        hostname: String,
        addresses: Vec<Entry>,
    },
    Failed {
        id: RequestId,
        hostname: String,
        error: NetError,
    },
}

impl Emission {
    pub fn id(&self) -> RequestId {
        match self {
            Emission::Resolved { id, .. } | Emission::Failed { id, .. } => *id,
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            Emission::Resolved { hostname, .. } | Emission::Failed { hostname, .. } => hostname,
        }
    }

    pub fn into_result(self) -> Result<Vec<Entry>, NetError> {
        match self {
            Emission::Resolved { addresses, .. } => Ok(addresses),
            Emission::Failed { error, .. } => Err(error),
        }
    }
}

#[derive(Debug)]
struct Pending {
    hostname: String,
    /// Families whose resolver has not answered yet.
    outstanding: Vec<Family>,
    addresses: Vec<Entry>,
    errors: Vec<NetError>,
    emitted: bool,
    /// Set while an IPv4 answer waits for IPv6.
    delayed_until: Option<Instant>,
}

/// Coordinates the per-family resolvers.
///
/// Every request returned by [`resolve`](Self::resolve) keeps its slot,
/// including late answers merged after the emission, until it is released
/// with [`close`](Self::close) or [`close_all`](Self::close_all).
#[derive(Debug)]
pub struct MultiResolver {
    resolvers: Vec<FamilyResolver>,
    cache: ResolverCache,
    use_cache: bool,
    resolution_delay: Duration,
    pending: HashMap<RequestId, Pending>,
    emissions: Vec<Emission>,
    next_id: u64,
}

impl MultiResolver {
    /// Creates one resolver per family in `options.families`, sharing a
    /// volatile cache backed by the configured hosts file.
    pub fn new(options: &ResolverOptions) -> io::Result<Self> {
        let hosts = match &options.hosts_path {
            Some(path) => HostsFile::new(path.clone()),
            None => HostsFile::empty(),
        };
        Self::with_cache(options, ResolverCache::in_memory().with_hosts(hosts))
    }

    pub fn with_cache(options: &ResolverOptions, cache: ResolverCache) -> io::Result<Self> {
        let resolvers = options
            .families
            .iter()
            .map(|family| FamilyResolver::new(*family, options, cache.clone()))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self::with_resolvers(options, cache, resolvers))
    }

    /// Coordinates already constructed resolvers.
    pub fn with_resolvers(
        options: &ResolverOptions,
        cache: ResolverCache,
        resolvers: Vec<FamilyResolver>,
    ) -> Self {
        Self {
            resolvers,
            cache,
            use_cache: options.cache,
            resolution_delay: options.resolution_delay,
            pending: HashMap::new(),
            emissions: Vec::new(),
            next_id: 0,
        }
    }

    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    pub fn families(&self) -> Vec<Family> {
        self.resolvers.iter().map(|r| r.family()).collect()
    }

    pub fn resolvers(&self) -> &[FamilyResolver] {
        &self.resolvers
    }

    /// Resolves `hostname` for every configured family.
    ///
    /// The caller must `close` the returned id once it no longer needs
    /// [`addresses`](Self::addresses).
    pub fn resolve(&mut self, hostname: &str) -> RequestId {
        let families = self.families();
        self.resolve_families(hostname, &families)
    }

    /// Resolves `hostname` for the given families only.
    pub fn resolve_families(&mut self, hostname: &str, families: &[Family]) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);

        let mut wanted: Vec<Family> = Vec::new();
        for family in families {
            if !wanted.contains(family) && self.resolvers.iter().any(|r| r.family() == *family) {
                wanted.push(*family);
            }
        }
        tracing::debug!(host = %hostname, request = %id, families = ?wanted, "resolving");

        self.pending.insert(
            id,
            Pending {
                hostname: hostname.to_string(),
                outstanding: Vec::new(),
                addresses: Vec::new(),
                errors: Vec::new(),
                emitted: false,
                delayed_until: None,
            },
        );

        if wanted.is_empty() {
            let error = NetError::not_resolved(hostname, "no resolver for requested families");
            self.emit_failure(id, error);
        } else if !self.early_resolve(id, hostname, &wanted) {
            self.lazy_resolve(id, hostname, &wanted);
        }
        id
    }

    /// Answers from an IP literal, the cache or the hosts file.
    fn early_resolve(&mut self, id: RequestId, hostname: &str, families: &[Family]) -> bool {
        let entries = if self.use_cache {
            self.cache.resolve(hostname)
        } else {
            parse_ip_literal(hostname).map(|ip| vec![Entry::new(ip)])
        };
        let Some(entries) = entries else {
            return false;
        };

        let mut groups: Vec<(Family, Vec<Entry>)> = families
            .iter()
            .map(|family| {
                let addrs: Vec<Entry> = entries
                    .iter()
                    .filter(|e| e.family() == *family)
                    .cloned()
                    .collect();
                (*family, addrs)
            })
            .filter(|(_, addrs)| !addrs.is_empty())
            .collect();
        if groups.is_empty() {
            return false;
        }
        // Prefer the family with more addresses, IPv6 on ties.
        groups.sort_by(|(f1, a1), (f2, a2)| a2.len().cmp(&a1.len()).then(f1.cmp(f2)));

        let addresses: Vec<Entry> = groups.into_iter().flat_map(|(_, addrs)| addrs).collect();
        tracing::debug!(host = %hostname, count = addresses.len(), "resolved without lookup");
        if let Some(pending) = self.pending.get_mut(&id) {
            pending.addresses = addresses;
        }
        self.emit_addresses(id);
        true
    }

    fn lazy_resolve(&mut self, id: RequestId, hostname: &str, families: &[Family]) {
        let mut failures = Vec::new();
        let mut submitted = Vec::new();
        for resolver in self.resolvers.iter_mut().filter(|r| families.contains(&r.family())) {
            match resolver.submit(id, hostname) {
                Ok(()) => submitted.push(resolver.family()),
                Err(e) => {
                    tracing::debug!(host = %hostname, family = %resolver.family(), error = %e, "submit failed");
                    failures.push(e);
                }
            }
        }

        if let Some(pending) = self.pending.get_mut(&id) {
            pending.outstanding = submitted;
            pending.errors = failures;
        }
        self.settle(id);
    }

    pub fn poll(&mut self) -> Vec<Emission> {
        self.poll_at(Instant::now())
    }

    /// Drives every resolver and returns the requests that completed.
    pub fn poll_at(&mut self, now: Instant) -> Vec<Emission> {
        let resolutions: Vec<Resolution> = self
            .resolvers
            .iter_mut()
            .flat_map(|r| r.poll_at(now))
            .collect();
        for resolution in resolutions {
            self.on_resolution(resolution, now);
        }

        let due: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| !p.emitted && p.delayed_until.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            tracing::debug!(request = %id, "resolution delay elapsed");
            self.emit_addresses(id);
        }

        std::mem::take(&mut self.emissions)
    }

    fn on_resolution(&mut self, resolution: Resolution, now: Instant) {
        let Resolution {
            id, family, result, ..
        } = resolution;
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        pending.outstanding.retain(|f| *f != family);

        match result {
            Ok(entries) => {
                merge(&mut pending.addresses, family, entries);
                if pending.emitted {
                    tracing::trace!(request = %id, family = %family, "late answer merged");
                    return;
                }
                let waiting_for_v6 = family == Family::V4 && pending.outstanding.contains(&Family::V6);
                if waiting_for_v6 && !self.resolution_delay.is_zero() {
                    if pending.delayed_until.is_none() {
                        tracing::debug!(host = %pending.hostname, delay = ?self.resolution_delay, "deferring IPv4 answer");
                        pending.delayed_until = Some(now + self.resolution_delay);
                    }
                    return;
                }
                self.emit_addresses(id);
            }
            Err(e) => {
                tracing::debug!(host = %pending.hostname, family = %family, error = %e, "family resolution failed");
                pending.errors.push(e);
                self.settle(id);
            }
        }
    }

    /// Emits once no family is outstanding.
    fn settle(&mut self, id: RequestId) {
        let Some(pending) = self.pending.get(&id) else {
            return;
        };
        if pending.emitted || !pending.outstanding.is_empty() {
            return;
        }
        if !pending.addresses.is_empty() {
            self.emit_addresses(id);
            return;
        }
        let error = pending
            .errors
            .first()
            .cloned()
            .unwrap_or_else(|| NetError::not_resolved(&pending.hostname, "no address records"));
        self.emit_failure(id, error);
    }

    fn emit_addresses(&mut self, id: RequestId) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        if pending.emitted {
            return;
        }
        pending.emitted = true;
        pending.delayed_until = None;
        tracing::debug!(host = %pending.hostname, count = pending.addresses.len(), "resolved");
        self.emissions.push(Emission::Resolved {
            id,
            hostname: pending.hostname.clone(),
            addresses: pending.addresses.clone(),
        });
    }

    fn emit_failure(&mut self, id: RequestId, error: NetError) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        if pending.emitted {
            return;
        }
        pending.emitted = true;
        self.emissions.push(Emission::Failed {
            id,
            hostname: pending.hostname.clone(),
            error,
        });
    }

    /// Addresses collected so far for `id`, IPv6 first.
    ///
    /// Answers that arrive after the emission are merged here.
    pub fn addresses(&self, id: RequestId) -> Option<&[Entry]> {
        self.pending.get(&id).map(|p| p.addresses.as_slice())
    }

    /// Forgets `id`: cancels its lookups and any pending resolution delay.
    pub fn close(&mut self, id: RequestId) {
        if self.pending.remove(&id).is_some() {
            for resolver in &mut self.resolvers {
                resolver.cancel(id);
            }
        }
        self.emissions.retain(|e| e.id() != id);
    }

    /// Closes every resolver and drops all requests without emitting.
    pub fn close_all(&mut self) {
        for resolver in &mut self.resolvers {
            resolver.close();
        }
        self.pending.clear();
        self.emissions.clear();
    }

    /// Removes `ip` from the cached addresses of `hostname` after a failed
    /// connection attempt.
    pub fn evict(&self, hostname: &str, ip: IpAddr) {
        self.cache.evict(hostname, ip);
    }

    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.emissions.is_empty() {
            return Some(Duration::ZERO);
        }
        let delays = self
            .pending
            .values()
            .filter(|p| !p.emitted)
            .filter_map(|p| p.delayed_until)
            .map(|at| at.saturating_duration_since(now));
        self.resolvers
            .iter()
            .filter_map(|r| r.next_timeout(now))
            .chain(delays)
            .min()
    }

    /// Descriptors to wait on, with the readiness each resolver needs.
    pub fn interests(&self) -> Vec<(RawFd, Interest)> {
        self.resolvers
            .iter()
            .filter_map(|r| Some((r.file_descriptor()?, r.interests()?)))
            .collect()
    }

    /// True when no request is waiting for an emission.
    pub fn is_idle(&self) -> bool {
        self.emissions.is_empty() && self.pending.values().all(|p| p.emitted)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Adds a family's entries to the merged list, IPv6 ahead of IPv4.
fn merge(addresses: &mut Vec<Entry>, family: Family, entries: Vec<Entry>) {
    match family {
        Family::V6 => {
            let rest = std::mem::replace(addresses, entries);
            addresses.extend(rest);
        }
        Family::V4 => addresses.extend(entries),
    }
    dedup_entries(addresses);
}
