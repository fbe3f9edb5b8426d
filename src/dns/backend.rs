//! Backend selection.
//!
//! [`FamilyResolver`] wraps one of the per-family resolvers so the
//! coordinator can drive them uniformly.

use crate::base::neterror::NetError;
use crate::dns::cache::ResolverCache;
use crate::dns::entry::Family;
use crate::dns::https::{HttpsResolver, HyperDohClient};
use crate::dns::native::NativeResolver;
use crate::dns::options::{BackendKind, ResolverOptions};
use crate::dns::system::SystemResolver;
use crate::dns::{Interest, RequestId, Resolution};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Resolver for one address family.
#[derive(Debug)]
pub enum FamilyResolver {
    Native(NativeResolver),
    Https(HttpsResolver),
    System(SystemResolver),
}

macro_rules! delegate {
    ($self:ident, $r:ident => $body:expr) => {
        match $self {
            FamilyResolver::Native($r) => $body,
            FamilyResolver::Https($r) => $body,
            FamilyResolver::System($r) => $body,
        }
    };
}

impl FamilyResolver {
    /// Creates the backend selected by `options.backend`.
    pub fn new(family: Family, options: &ResolverOptions, cache: ResolverCache) -> io::Result<Self> {
        let resolver = match options.backend {
            BackendKind::Native => FamilyResolver::Native(NativeResolver::new(family, options, cache)),
            BackendKind::Https => {
                let client = HyperDohClient::new()?;
                FamilyResolver::Https(HttpsResolver::new(family, options, cache, Box::new(client)))
            }
            BackendKind::System => FamilyResolver::System(SystemResolver::new(family, options)?),
        };
        Ok(resolver)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            FamilyResolver::Native(_) => BackendKind::Native,
            FamilyResolver::Https(_) => BackendKind::Https,
            FamilyResolver::System(_) => BackendKind::System,
        }
    }

    pub fn family(&self) -> Family {
        delegate!(self, r => r.family())
    }

    pub fn submit(&mut self, id: RequestId, hostname: &str) -> Result<(), NetError> {
        delegate!(self, r => r.submit(id, hostname))
    }

    pub fn poll(&mut self) -> Vec<Resolution> {
        delegate!(self, r => r.poll())
    }

    pub fn poll_at(&mut self, now: Instant) -> Vec<Resolution> {
        delegate!(self, r => r.poll_at(now))
    }

    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        delegate!(self, r => r.next_timeout(now))
    }

    pub fn interests(&self) -> Option<Interest> {
        delegate!(self, r => r.interests())
    }

    pub fn file_descriptor(&self) -> Option<RawFd> {
        delegate!(self, r => r.file_descriptor())
    }

    pub fn is_empty(&self) -> bool {
        delegate!(self, r => r.is_empty())
    }

    pub fn cancel(&mut self, id: RequestId) {
        delegate!(self, r => r.cancel(id))
    }

    pub fn close(&mut self) {
        delegate!(self, r => r.close())
    }
}

impl From<NativeResolver> for FamilyResolver {
    fn from(resolver: NativeResolver) -> Self {
        FamilyResolver::Native(resolver)
    }
}

impl From<HttpsResolver> for FamilyResolver {
    fn from(resolver: HttpsResolver) -> Self {
        FamilyResolver::Https(resolver)
    }
}

impl From<SystemResolver> for FamilyResolver {
    fn from(resolver: SystemResolver) -> Self {
        FamilyResolver::System(resolver)
    }
}
