//! Hostname resolution.
//!
//! Turns hostnames into addresses for connection establishment using DNS
//! over UDP/TCP, DNS-over-HTTPS or the operating system resolver, with a
//! shared cache and dual-stack coordination.
//!
//! # Architecture
//!
//! - [`wire`]: DNS message codec.
//! - [`cache`]: [`ResolverCache`], hostname → records with TTL and LRU.
//! - [`native`], [`https`], [`system`]: per-family backends, unified by
//!   [`FamilyResolver`].
//! - [`multi`]: [`MultiResolver`], fans a request out to every family and
//!   applies the resolution delay.
//! - [`AsyncResolver`]: drives a [`MultiResolver`] on tokio and implements
//!   [`Resolve`].
//!
//! The backends and the coordinator are non-blocking state machines driven
//! by an external event loop through `poll`, `next_timeout`, `interests`
//! and the file descriptors they expose.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostresolver::dns::{AsyncResolver, Name, Resolve, ResolverOptions};
//!
//! let resolver = AsyncResolver::new(ResolverOptions::default())?;
//! let addrs = resolver.resolve(Name::new("example.com")).await?;
//! for addr in addrs {
//!     println!("Resolved: {}", addr);
//! }
//! ```

mod backend;
pub mod cache;
mod driver;
pub mod entry;
pub mod hosts;
pub mod https;
pub mod multi;
pub mod native;
pub mod options;
mod resolve;
pub mod system;
mod wakeup;
pub mod wire;

pub use backend::FamilyResolver;
pub use cache::ResolverCache;
pub use driver::AsyncResolver;
pub use entry::{Entry, Family};
pub use multi::{Emission, MultiResolver};
pub use options::{BackendKind, DohMethod, Nameservers, ResolverOptions, SocketKind};
pub use resolve::{Addrs, Name, Resolve, Resolving};

use crate::base::neterror::NetError;
use std::fmt;

/// Identifies one resolution request across resolvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of one request on one family resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: RequestId,
    pub family: Family,
    /// Hostname as submitted.
    pub hostname: String,
    pub result: Result<Vec<Entry>, NetError>,
}

/// Readiness a resolver waits for on its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    pub fn from_flags(read: bool, write: bool) -> Option<Self> {
        match (read, write) {
            (true, true) => Some(Interest::ReadWrite),
            (true, false) => Some(Interest::Read),
            (false, true) => Some(Interest::Write),
            (false, false) => None,
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Read | Interest::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }
}
