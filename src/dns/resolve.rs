//! Async resolution interface.
//!
//! Connection establishment depends on [`Resolve`] rather than on a
//! concrete resolver, so the coordinator can be swapped for a fixed table
//! in tests.

use crate::base::neterror::NetError;
use crate::dns::entry::Entry;
use std::{fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc};

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Resolves hostnames for connection establishment.
///
/// Returned addresses carry port 0; callers set the port of the target
/// service. Implementations must be thread-safe.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Turns resolved entries into port-0 socket addresses, keeping order.
pub(crate) fn addrs_from_entries(entries: Vec<Entry>) -> Addrs {
    Box::new(
        entries
            .into_iter()
            .map(|entry| SocketAddr::new(entry.address(), 0)),
    )
}
