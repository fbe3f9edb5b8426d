//! Native non-blocking DNS resolver.
//!
//! One [`NativeResolver`] serves one address family. It owns a socket to
//! the active nameserver and a table of in-flight queries keyed by
//! candidate name, and is driven from the outside: the event loop polls it
//! when its descriptor is ready or when [`NativeResolver::next_timeout`]
//! elapses.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --submit--> Open --(no work left)--> Closed --submit--> Open
//! ```
//!
//! A request walks its candidate names one at a time. `NXDOMAIN` moves to
//! the next candidate; a truncated answer reopens the resolver over TCP;
//! an alias-only answer re-queries the alias target; timeouts retry
//! through the timeout sequence and then through the nameserver list.

mod candidates;
mod transport;

pub use candidates::candidates;
pub use transport::{connect, Connector, DnsTransport, TcpTransport, UdpTransport};

use crate::base::neterror::NetError;
use crate::dns::cache::{normalize, ResolverCache};
use crate::dns::entry::{dedup_entries, Entry, Family};
use crate::dns::options::{ResolverOptions, SocketKind};
use crate::dns::wire::{self, Outcome, Record, RecordData};
use crate::dns::{Interest, RequestId, Resolution};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Maximum number of aliases followed for one request.
pub const MAX_CNAME_HOPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Open,
    Closed,
}

struct Query {
    /// Name as put on the wire.
    name: String,
    waiters: Vec<RequestId>,
    timeouts: VecDeque<Duration>,
    attempts: usize,
    txid: u16,
    /// `None` until the query is written to the current transport.
    deadline: Option<Instant>,
    sent_at: Option<Instant>,
}

struct Request {
    origin: String,
    candidates: VecDeque<String>,
    /// Key of the query this request waits on.
    current: String,
    /// Alias records collected while following a CNAME chain.
    chain: Vec<Record>,
    hops: usize,
}

/// Resolver for one address family speaking DNS to the configured
/// nameservers.
pub struct NativeResolver {
    family: Family,
    nameservers: Vec<SocketAddr>,
    ndots: usize,
    search: Vec<String>,
    timeouts: Vec<Duration>,
    configured_kind: SocketKind,
    use_cache: bool,
    cache: ResolverCache,
    connector: Connector,
    state: State,
    transport: Option<Box<dyn DnsTransport>>,
    socket_kind: SocketKind,
    ns_index: usize,
    queries: HashMap<String, Query>,
    requests: HashMap<RequestId, Request>,
    ready: Vec<Resolution>,
}

impl std::fmt::Debug for NativeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeResolver")
            .field("family", &self.family)
            .field("state", &self.state)
            .field("socket_kind", &self.socket_kind)
            .field("ns_index", &self.ns_index)
            .field("queries", &self.queries.len())
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl NativeResolver {
    pub fn new(family: Family, options: &ResolverOptions, cache: ResolverCache) -> Self {
        Self::with_connector(family, options, cache, Box::new(connect))
    }

    /// Creates a resolver whose sockets come from `connector`.
    pub fn with_connector(
        family: Family,
        options: &ResolverOptions,
        cache: ResolverCache,
        connector: Connector,
    ) -> Self {
        let mut timeouts = options.timeouts.clone();
        if timeouts.is_empty() {
            timeouts.push(Duration::from_secs(2));
        }
        Self {
            family,
            nameservers: options.nameservers.for_family(family).to_vec(),
            ndots: options.ndots,
            search: options.search.clone(),
            timeouts,
            configured_kind: options.socket_kind,
            use_cache: options.cache,
            cache,
            connector,
            state: State::Idle,
            transport: None,
            socket_kind: options.socket_kind,
            ns_index: 0,
            queries: HashMap::new(),
            requests: HashMap::new(),
            ready: Vec::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn socket_kind(&self) -> SocketKind {
        self.socket_kind
    }

    /// Nameserver currently queried.
    pub fn nameserver(&self) -> Option<SocketAddr> {
        self.nameservers.get(self.ns_index).copied()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.ready.is_empty()
    }

    /// Registers a resolution of `hostname` for request `id`.
    pub fn submit(&mut self, id: RequestId, hostname: &str) -> Result<(), NetError> {
        if self.nameservers.is_empty() {
            return Err(NetError::NoNameserver);
        }

        let mut names: VecDeque<String> = candidates(hostname, self.ndots, &self.search).into();
        let Some(first) = names.pop_front() else {
            return Err(NetError::not_resolved(hostname, "no candidate names"));
        };
        tracing::debug!(host = %hostname, family = %self.family, candidates = names.len() + 1, "resolving");

        self.requests.insert(
            id,
            Request {
                origin: hostname.to_string(),
                candidates: names,
                current: String::new(),
                chain: Vec::new(),
                hops: 0,
            },
        );
        self.start_query(id, &first);
        Ok(())
    }

    /// Drives socket I/O and timeouts.
    pub fn poll(&mut self) -> Vec<Resolution> {
        self.poll_at(Instant::now())
    }

    /// Like [`NativeResolver::poll`] with an explicit current time.
    pub fn poll_at(&mut self, now: Instant) -> Vec<Resolution> {
        if !self.queries.is_empty() {
            self.read();
            self.expire(now);
            self.write(now);
        }
        if self.queries.is_empty() {
            if self.transport.is_some() {
                self.close_transport();
                self.state = State::Closed;
            }
            self.socket_kind = self.configured_kind;
        }
        std::mem::take(&mut self.ready)
    }

    /// Time until the resolver needs to be polled again.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        let mut next: Option<Duration> = None;
        for query in self.queries.values() {
            let wait = match query.deadline {
                Some(deadline) => deadline.saturating_duration_since(now),
                None => Duration::ZERO,
            };
            next = Some(next.map_or(wait, |n| n.min(wait)));
        }
        next
    }

    pub fn interests(&self) -> Option<Interest> {
        if self.queries.is_empty() {
            return None;
        }
        let unsent = self.queries.values().any(|q| q.deadline.is_none());
        let wants_write = unsent || self.transport.as_ref().is_some_and(|t| t.wants_write());
        let wants_read = self.transport.is_some() && self.queries.values().any(|q| q.deadline.is_some());
        Interest::from_flags(wants_read, wants_write)
    }

    pub fn file_descriptor(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(|t| t.file_descriptor())
    }

    /// Drops every pending request without reporting it.
    pub fn close(&mut self) {
        self.queries.clear();
        self.requests.clear();
        self.ready.clear();
        self.close_transport();
        self.socket_kind = self.configured_kind;
        self.state = State::Closed;
    }

    /// Forgets request `id`; a shared query keeps running for others.
    pub fn cancel(&mut self, id: RequestId) {
        if let Some(request) = self.requests.remove(&id) {
            if let Some(query) = self.queries.get_mut(&request.current) {
                query.waiters.retain(|w| *w != id);
                if query.waiters.is_empty() {
                    self.queries.remove(&request.current);
                }
            }
        }
        self.ready.retain(|r| r.id != id);
    }

    fn start_query(&mut self, id: RequestId, name: &str) {
        let key = normalize(name);
        if let Some(request) = self.requests.get_mut(&id) {
            request.current = key.clone();
        }

        if let Some(query) = self.queries.get_mut(&key) {
            tracing::trace!(name = %name, "joining in-flight query");
            query.waiters.push(id);
            return;
        }
        self.queries.insert(
            key,
            Query {
                name: name.to_string(),
                waiters: vec![id],
                timeouts: self.timeouts.iter().copied().collect(),
                attempts: 0,
                txid: rand::random(),
                deadline: None,
                sent_at: None,
            },
        );
    }

    fn open(&mut self) -> Result<(), io::Error> {
        if self.transport.is_some() {
            return Ok(());
        }
        let Some(nameserver) = self.nameserver() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no nameserver left"));
        };
        let transport = (self.connector)(nameserver, self.socket_kind)?;
        tracing::debug!(nameserver = %nameserver, kind = ?self.socket_kind, family = %self.family, "resolver open");
        self.transport = Some(transport);
        self.state = State::Open;
        Ok(())
    }

    fn close_transport(&mut self) {
        if self.transport.take().is_some() {
            tracing::trace!(family = %self.family, "resolver transport closed");
        }
    }

    fn read(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.receive() {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(&message);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(family = %self.family, "nameserver closed the connection");
                self.broadcast(|host| NetError::transport(host, &e));
            }
            Err(e) => self.transport_failed(e),
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .queries
            .iter()
            .filter(|(_, q)| q.deadline.is_some_and(|d| d <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            let Some(query) = self.queries.get_mut(&key) else {
                continue;
            };
            query.timeouts.pop_front();
            if !query.timeouts.is_empty() {
                tracing::debug!(name = %query.name, attempt = query.attempts, "query timed out, retrying");
                query.deadline = None;
                continue;
            }

            if self.ns_index + 1 < self.nameservers.len() {
                self.ns_index += 1;
                tracing::debug!(nameserver = ?self.nameserver(), "query timed out, trying next nameserver");
                self.restart_all();
                return;
            }

            if let Some(query) = self.queries.remove(&key) {
                tracing::debug!(name = %query.name, attempts = query.attempts, "query timed out");
                let attempts = query.attempts;
                self.fail_waiters(query.waiters, |host| NetError::DnsTimedOut {
                    host: host.to_string(),
                    attempts,
                });
            }
        }
    }

    fn write(&mut self, now: Instant) {
        if !self.queries.values().any(|q| q.deadline.is_none())
            && !self.transport.as_ref().is_some_and(|t| t.wants_write())
        {
            return;
        }
        if let Err(e) = self.open() {
            self.transport_failed(e);
            return;
        }

        let unsent: Vec<String> = self
            .queries
            .iter()
            .filter(|(_, q)| q.deadline.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        let record_type = self.family.record_type();

        for key in unsent {
            let encoded = match self.queries.get(&key) {
                Some(query) => wire::encode_query(&query.name, record_type, query.txid),
                None => continue,
            };
            let message = match encoded {
                Ok(message) => message,
                Err(e) => {
                    if let Some(query) = self.queries.remove(&key) {
                        self.fail_waiters(query.waiters, |host| e.clone().for_host(host));
                    }
                    continue;
                }
            };
            let Some(query) = self.queries.get_mut(&key) else {
                continue;
            };
            let interval = query.timeouts.front().copied().unwrap_or(Duration::ZERO);
            query.deadline = Some(now + interval);
            query.sent_at = Some(now);
            query.attempts += 1;
            tracing::trace!(name = %query.name, txid = query.txid, rtype = %record_type, "sending query");

            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            if let Err(e) = transport.send(&message) {
                self.transport_failed(e);
                return;
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.flush() {
                self.transport_failed(e);
            }
        }
    }

    /// Moves to the next nameserver, or fails everything when none is left.
    fn transport_failed(&mut self, err: io::Error) {
        if self.ns_index + 1 < self.nameservers.len() {
            self.ns_index += 1;
            tracing::debug!(error = %err, nameserver = ?self.nameserver(), "nameserver unreachable, trying next");
            self.restart_all();
        } else {
            tracing::debug!(error = %err, family = %self.family, "nameserver unreachable");
            self.broadcast(|host| NetError::transport(host, &err));
        }
    }

    /// Reissues every query from a fresh transport with a full timeout
    /// sequence.
    fn restart_all(&mut self) {
        self.close_transport();
        for query in self.queries.values_mut() {
            query.timeouts = self.timeouts.iter().copied().collect();
            query.deadline = None;
            query.sent_at = None;
            query.txid = rand::random();
        }
    }

    fn handle_message(&mut self, message: &Bytes) {
        let response = wire::decode_response(message);
        let Some(key) = self.match_query(&response) else {
            tracing::debug!(txid = ?response.id, "dropping response matching no query");
            return;
        };

        match response.outcome {
            Outcome::Truncated => self.handle_truncated(&key),
            Outcome::NoDomain => {
                let Some(query) = self.queries.remove(&key) else {
                    return;
                };
                tracing::debug!(name = %query.name, "no such domain");
                for id in query.waiters {
                    self.next_candidate(id);
                }
            }
            Outcome::ServerError(rcode) => {
                if let Some(query) = self.queries.remove(&key) {
                    self.fail_waiters(query.waiters, |host| NetError::DnsServerFailed {
                        host: host.to_string(),
                        rcode,
                    });
                }
            }
            Outcome::DecodeError(reason) => {
                if let Some(query) = self.queries.remove(&key) {
                    tracing::debug!(name = %query.name, reason = %reason, "undecodable response");
                    self.fail_waiters(query.waiters, |host| NetError::malformed(host, reason.clone()));
                }
            }
            Outcome::Ok(records) => self.handle_answer(&key, records),
        }
    }

    /// Finds the sent query a response belongs to.
    fn match_query(&self, response: &wire::Response) -> Option<String> {
        let key = match &response.question {
            Some(question) => {
                let key = normalize(&question.name);
                if !self.queries.contains_key(&key) {
                    return None;
                }
                key
            }
            None => self
                .queries
                .iter()
                .filter(|(_, q)| q.sent_at.is_some())
                .find(|(_, q)| Some(q.txid) == response.id)
                .or_else(|| {
                    self.queries
                        .iter()
                        .filter(|(_, q)| q.sent_at.is_some())
                        .min_by_key(|(_, q)| q.sent_at)
                })
                .map(|(key, _)| key.clone())?,
        };

        let query = self.queries.get(&key)?;
        if query.sent_at.is_none() {
            return None;
        }
        if let Some(id) = response.id {
            if id != query.txid && response.question.is_some() {
                tracing::warn!(name = %query.name, expected = query.txid, got = id, "transaction id mismatch");
                return None;
            }
        }
        Some(key)
    }

    fn handle_truncated(&mut self, key: &str) {
        if self.socket_kind == SocketKind::Tcp {
            if let Some(query) = self.queries.remove(key) {
                self.fail_waiters(query.waiters, |host| {
                    NetError::malformed(host, "truncated response over TCP")
                });
            }
            return;
        }

        tracing::debug!(name = %key, "truncated response, retrying over TCP");
        self.socket_kind = SocketKind::Tcp;
        self.close_transport();
        for query in self.queries.values_mut() {
            query.deadline = None;
            query.sent_at = None;
        }
    }

    fn handle_answer(&mut self, key: &str, records: Vec<Record>) {
        let Some(query) = self.queries.remove(key) else {
            return;
        };
        let family = self.family;
        let addresses: Vec<&Record> = records
            .iter()
            .filter(|r| r.address().is_some_and(|ip| Family::of(&ip) == family))
            .collect();

        if addresses.is_empty() {
            match alias_target(&query.name, &records) {
                Some((target, aliases)) => {
                    for id in query.waiters {
                        self.follow_alias(id, &target, &aliases);
                    }
                }
                None => {
                    tracing::debug!(name = %query.name, "answer without address records");
                    self.fail_waiters(query.waiters, |host| {
                        NetError::not_resolved(host, "no address records")
                    });
                }
            }
            return;
        }

        let mut entries: Vec<Entry> = addresses
            .iter()
            .filter_map(|r| r.address().map(|ip| Entry::with_ttl(ip, r.ttl)))
            .collect();
        dedup_entries(&mut entries);
        tracing::debug!(name = %query.name, count = entries.len(), family = %family, "resolved");

        for id in query.waiters {
            let Some(request) = self.requests.remove(&id) else {
                continue;
            };
            if self.use_cache {
                let mut all = request.chain;
                all.extend(records.iter().cloned());
                self.cache.set(&request.origin, family, &all);
            }
            self.ready.push(Resolution {
                id,
                family,
                hostname: request.origin,
                result: Ok(entries.clone()),
            });
        }
    }

    fn follow_alias(&mut self, id: RequestId, target: &str, aliases: &[Record]) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.hops += aliases.len();
        request.chain.extend(aliases.iter().cloned());
        if request.hops > MAX_CNAME_HOPS {
            self.fail_waiters(vec![id], |host| NetError::not_resolved(host, "CNAME chain too long"));
            return;
        }

        if self.use_cache {
            let cached: Vec<Entry> = self
                .cache
                .get(target)
                .unwrap_or_default()
                .into_iter()
                .filter(|e| e.family() == self.family)
                .collect();
            if !cached.is_empty() {
                tracing::debug!(alias = %target, "alias target answered from cache");
                if let Some(request) = self.requests.remove(&id) {
                    self.cache.set(&request.origin, self.family, &request.chain);
                    self.ready.push(Resolution {
                        id,
                        family: self.family,
                        hostname: request.origin,
                        result: Ok(cached),
                    });
                }
                return;
            }
        }

        tracing::debug!(alias = %target, "following alias");
        let absolute = format!("{}.", target.trim_end_matches('.'));
        self.start_query(id, &absolute);
    }

    fn next_candidate(&mut self, id: RequestId) {
        let next = self
            .requests
            .get_mut(&id)
            .and_then(|request| request.candidates.pop_front());
        match next {
            Some(name) => {
                tracing::trace!(name = %name, "trying next candidate");
                self.start_query(id, &name);
            }
            None => self.fail_waiters(vec![id], |host| {
                NetError::not_resolved(host, "name or service not known")
            }),
        }
    }

    fn fail_waiters(&mut self, waiters: Vec<RequestId>, error: impl Fn(&str) -> NetError) {
        for id in waiters {
            if let Some(request) = self.requests.remove(&id) {
                self.ready.push(Resolution {
                    id,
                    family: self.family,
                    result: Err(error(&request.origin)),
                    hostname: request.origin,
                });
            }
        }
    }

    /// Fails every pending request and drops all query state.
    fn broadcast(&mut self, error: impl Fn(&str) -> NetError) {
        self.queries.clear();
        let waiters: Vec<RequestId> = self.requests.keys().copied().collect();
        self.fail_waiters(waiters, error);
        self.close_transport();
    }
}

/// Follows the alias records starting at `name` to the final target.
pub(crate) fn alias_target(name: &str, records: &[Record]) -> Option<(String, Vec<Record>)> {
    let mut current = normalize(name);
    let mut chain = Vec::new();

    while chain.len() <= MAX_CNAME_HOPS {
        let next = records.iter().find(|r| {
            matches!(r.data, RecordData::Alias(_)) && normalize(&r.name) == current
        });
        match next {
            Some(record) => {
                if let RecordData::Alias(target) = &record.data {
                    current = normalize(target);
                }
                chain.push(record.clone());
            }
            None => break,
        }
    }

    if chain.is_empty() {
        None
    } else {
        Some((current, chain))
    }
}
