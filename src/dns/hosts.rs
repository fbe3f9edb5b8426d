//! Static host table (`/etc/hosts`).
//!
//! The file is read once, on first lookup. A missing or unreadable file
//! behaves like an empty table.

use crate::dns::cache::normalize;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default location of the system hosts file.
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Lazily loaded hostname → address table.
#[derive(Debug, Default)]
pub struct HostsFile {
    path: Option<PathBuf>,
    table: OnceLock<HashMap<String, Vec<IpAddr>>>,
}

impl HostsFile {
    /// Creates a table backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            table: OnceLock::new(),
        }
    }

    /// A table that never matches.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a table from already loaded file contents.
    pub fn from_contents(contents: &str) -> Self {
        let table = OnceLock::new();
        let _ = table.set(parse_hosts(contents));
        Self { path: None, table }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Addresses listed for `hostname`, in file order.
    pub fn lookup(&self, hostname: &str) -> &[IpAddr] {
        let key = normalize(hostname);
        self.table()
            .get(key.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn table(&self) -> &HashMap<String, Vec<IpAddr>> {
        self.table.get_or_init(|| match &self.path {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => parse_hosts(&contents),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "hosts file not loaded");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        })
    }
}

/// Parses hosts file syntax: `address name [aliases...]`, `#` comments.
pub fn parse_hosts(contents: &str) -> HashMap<String, Vec<IpAddr>> {
    let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();

    for line in contents.lines() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let mut parts = line.split_whitespace();
        let Some(ip) = parts.next().and_then(|s| s.parse::<IpAddr>().ok()) else {
            continue;
        };

        for name in parts {
            let addrs = table.entry(normalize(name)).or_default();
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
    }

    table
}
