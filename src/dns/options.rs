//! Resolver configuration.
//!
//! [`ResolverOptions`] is an immutable, pre-parsed view of the settings the
//! resolvers need: nameservers, `ndots`, the search list, the retry timeout
//! sequence and backend selection. Defaults are taken from
//! `/etc/resolv.conf` when it can be read.

use crate::dns::entry::Family;
use crate::dns::hosts::DEFAULT_HOSTS_PATH;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default location of the resolver configuration file.
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Public resolver used for DNS-over-HTTPS when no endpoint is configured.
pub const DEFAULT_DOH_URI: &str = "https://1.1.1.1/dns-query";

/// Delay granted to IPv6 when IPv4 answers first.
pub const RESOLUTION_DELAY: Duration = Duration::from_millis(50);

const DNS_PORT: u16 = 53;

/// Nameserver addresses, either shared by all families or split per family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nameservers {
    Shared(Vec<SocketAddr>),
    PerFamily {
        v4: Vec<SocketAddr>,
        v6: Vec<SocketAddr>,
    },
}

impl Nameservers {
    /// Nameservers the resolver for `family` should query.
    pub fn for_family(&self, family: Family) -> &[SocketAddr] {
        match self {
            Nameservers::Shared(all) => all,
            Nameservers::PerFamily { v4, .. } if family == Family::V4 => v4,
            Nameservers::PerFamily { v6, .. } => v6,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Nameservers::Shared(all) => all.is_empty(),
            Nameservers::PerFamily { v4, v6 } => v4.is_empty() && v6.is_empty(),
        }
    }
}

impl Default for Nameservers {
    fn default() -> Self {
        Nameservers::Shared(Vec::new())
    }
}

/// Transport used to talk to nameservers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketKind {
    #[default]
    Udp,
    Tcp,
}

/// Which resolver implementation serves each family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Native,
    Https,
    System,
}

/// HTTP method used for DNS-over-HTTPS queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DohMethod {
    #[default]
    Post,
    Get,
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Nameservers for the native resolver.
    pub nameservers: Nameservers,

    /// Names with at least this many dots are tried as-is first.
    pub ndots: usize,

    /// Search domains appended to relative names.
    pub search: Vec<String>,

    /// Per-attempt timeouts; one attempt per entry, per nameserver.
    pub timeouts: Vec<Duration>,

    /// Initial socket kind for the native resolver.
    pub socket_kind: SocketKind,

    /// Whether answers are read from and written to the cache.
    pub cache: bool,

    pub backend: BackendKind,

    /// DNS-over-HTTPS endpoint.
    pub doh_uri: Url,

    pub doh_method: DohMethod,

    /// Families to resolve, in preference order.
    pub families: Vec<Family>,

    /// How long an IPv4 answer waits for a pending IPv6 answer.
    pub resolution_delay: Duration,

    /// Hosts file consulted by cache lookups (`None` disables it).
    pub hosts_path: Option<PathBuf>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        let base = Self::builtin();
        match fs::read_to_string(RESOLV_CONF_PATH) {
            Ok(contents) => base.apply_resolv_conf(&contents),
            Err(e) => {
                tracing::debug!(path = RESOLV_CONF_PATH, error = %e, "resolv.conf not loaded");
                base
            }
        }
    }
}

impl ResolverOptions {
    /// Built-in defaults without consulting the system configuration.
    pub fn builtin() -> Self {
        Self {
            nameservers: Nameservers::default(),
            ndots: 1,
            search: Vec::new(),
            timeouts: vec![Duration::from_secs(2), Duration::from_secs(3)],
            socket_kind: SocketKind::Udp,
            cache: true,
            backend: BackendKind::Native,
            doh_uri: default_doh_uri(),
            doh_method: DohMethod::Post,
            families: vec![Family::V6, Family::V4],
            resolution_delay: RESOLUTION_DELAY,
            hosts_path: Some(PathBuf::from(DEFAULT_HOSTS_PATH)),
        }
    }

    /// Built-in defaults overridden by `resolv.conf` syntax.
    pub fn from_resolv_conf(contents: &str) -> Self {
        Self::builtin().apply_resolv_conf(contents)
    }

    fn apply_resolv_conf(mut self, contents: &str) -> Self {
        let mut nameservers = Vec::new();
        let mut search = None;
        let mut timeout = None;
        let mut attempts = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("nameserver") => {
                    if let Some(ip) = parts.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                        nameservers.push(SocketAddr::new(ip, DNS_PORT));
                    }
                }
                // The last search or domain line wins.
                Some("search") | Some("domain") => {
                    search = Some(parts.map(|d| d.trim_end_matches('.').to_string()).collect());
                }
                Some("options") => {
                    for opt in parts {
                        if let Some(val) = opt.strip_prefix("ndots:") {
                            if let Ok(n) = val.parse::<usize>() {
                                self.ndots = n.min(15);
                            }
                        } else if let Some(val) = opt.strip_prefix("timeout:") {
                            timeout = val.parse::<u64>().ok();
                        } else if let Some(val) = opt.strip_prefix("attempts:") {
                            attempts = val.parse::<usize>().ok();
                        }
                    }
                }
                _ => {}
            }
        }

        if !nameservers.is_empty() {
            self.nameservers = Nameservers::Shared(nameservers);
        }
        if let Some(search) = search {
            self.search = search;
        }
        if timeout.is_some() || attempts.is_some() {
            let secs = timeout.unwrap_or(2).max(1);
            let attempts = attempts.unwrap_or(self.timeouts.len()).clamp(1, 5);
            self.timeouts = vec![Duration::from_secs(secs); attempts];
        }
        self
    }

    pub fn with_nameservers(mut self, nameservers: Vec<SocketAddr>) -> Self {
        self.nameservers = Nameservers::Shared(nameservers);
        self
    }

    pub fn with_family_nameservers(mut self, v4: Vec<SocketAddr>, v6: Vec<SocketAddr>) -> Self {
        self.nameservers = Nameservers::PerFamily { v4, v6 };
        self
    }

    pub fn with_ndots(mut self, ndots: usize) -> Self {
        self.ndots = ndots;
        self
    }

    pub fn with_search(mut self, search: Vec<String>) -> Self {
        self.search = search;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Vec<Duration>) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_socket_kind(mut self, kind: SocketKind) -> Self {
        self.socket_kind = kind;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_doh(mut self, uri: Url, method: DohMethod) -> Self {
        self.doh_uri = uri;
        self.doh_method = method;
        self
    }

    pub fn with_families(mut self, families: Vec<Family>) -> Self {
        self.families = families;
        self
    }

    pub fn with_resolution_delay(mut self, delay: Duration) -> Self {
        self.resolution_delay = delay;
        self
    }

    pub fn with_hosts_path(mut self, path: Option<PathBuf>) -> Self {
        self.hosts_path = path;
        self
    }

    /// Sum of all per-attempt timeouts; the overall budget of backends that
    /// do not retry on their own.
    pub fn total_timeout(&self) -> Duration {
        self.timeouts.iter().sum()
    }
}

fn default_doh_uri() -> Url {
    Url::parse(DEFAULT_DOH_URI).expect("default DoH URI should parse")
}
