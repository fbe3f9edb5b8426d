//! Tokio driver for [`MultiResolver`].
//!
//! The coordinator is a poll-driven state machine. [`AsyncResolver`] owns
//! one on a background task, waits on its descriptors with [`AsyncFd`] and
//! on its next timeout with `tokio::time`, and answers
//! [`Resolve::resolve`] calls through oneshot channels.

use crate::base::neterror::NetError;
use crate::dns::cache::ResolverCache;
use crate::dns::entry::Entry;
use crate::dns::multi::MultiResolver;
use crate::dns::options::ResolverOptions;
use crate::dns::resolve::{addrs_from_entries, Name, Resolve, Resolving};
use crate::dns::{Interest, RequestId};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};

type Reply = oneshot::Sender<Result<Vec<Entry>, NetError>>;

enum Command {
    Resolve { hostname: String, reply: Reply },
}

/// Descriptor owned by a resolver, registered only while waiting.
struct Watched(RawFd);

impl AsRawFd for Watched {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Hostname resolver usable from async code.
///
/// Clones share the same background task and cache. The task stops once
/// every handle is dropped and the requests in flight have completed.
#[derive(Clone)]
pub struct AsyncResolver {
    commands: mpsc::UnboundedSender<Command>,
    cache: ResolverCache,
}

impl std::fmt::Debug for AsyncResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl AsyncResolver {
    /// Spawns a resolver task on the current tokio runtime.
    pub fn new(options: ResolverOptions) -> io::Result<Self> {
        Ok(Self::with_multi(MultiResolver::new(&options)?))
    }

    /// Drives an already configured coordinator.
    pub fn with_multi(multi: MultiResolver) -> Self {
        let cache = multi.cache().clone();
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(multi, rx));
        Self { commands, cache }
    }

    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    /// Drops `ip` from the cached addresses of `hostname`, typically after a
    /// connection attempt to it failed.
    pub fn evict(&self, hostname: &str, ip: IpAddr) {
        self.cache.evict(hostname, ip);
    }

    /// Resolves `hostname` to entries, IPv6 first.
    pub async fn lookup(&self, hostname: &str) -> Result<Vec<Entry>, NetError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Resolve {
            hostname: hostname.to_string(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return Err(stopped(hostname));
        }
        rx.await.unwrap_or_else(|_| Err(stopped(hostname)))
    }
}

impl Resolve for AsyncResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let entries = resolver.lookup(name.as_str()).await?;
            Ok(addrs_from_entries(entries))
        })
    }
}

fn stopped(hostname: &str) -> NetError {
    NetError::not_resolved(hostname, "resolver task stopped")
}

async fn run(mut multi: MultiResolver, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut waiters: HashMap<RequestId, Reply> = HashMap::new();
    let mut open = true;

    loop {
        for emission in multi.poll() {
            let id = emission.id();
            multi.close(id);
            if let Some(reply) = waiters.remove(&id) {
                let _ = reply.send(emission.into_result());
            }
        }
        if !open && waiters.is_empty() {
            break;
        }

        let timeout = multi.next_timeout(Instant::now());
        let watched: Vec<(AsyncFd<Watched>, Interest)> = multi
            .interests()
            .into_iter()
            .filter_map(|(fd, interest)| match register(fd, interest) {
                Ok(watched) => Some((watched, interest)),
                Err(e) => {
                    tracing::warn!(fd, error = %e, "failed to register resolver descriptor");
                    None
                }
            })
            .collect();

        tokio::select! {
            command = commands.recv(), if open => match command {
                Some(Command::Resolve { hostname, reply }) => {
                    let id = multi.resolve(&hostname);
                    waiters.insert(id, reply);
                }
                None => open = false,
            },
            _ = any_ready(&watched) => {}
            _ = sleep(timeout) => {}
        }
    }

    multi.close_all();
    tracing::debug!("resolver task stopped");
}

fn register(fd: RawFd, interest: Interest) -> io::Result<AsyncFd<Watched>> {
    let tokio_interest = match interest {
        Interest::Read => tokio::io::Interest::READABLE,
        Interest::Write => tokio::io::Interest::WRITABLE,
        Interest::ReadWrite => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
    };
    AsyncFd::with_interest(Watched(fd), tokio_interest)
}

async fn any_ready(watched: &[(AsyncFd<Watched>, Interest)]) {
    if watched.is_empty() {
        return futures::future::pending().await;
    }
    let waits = watched
        .iter()
        .map(|(fd, interest)| Box::pin(ready(fd, *interest)));
    futures::future::select_all(waits).await;
}

async fn ready(fd: &AsyncFd<Watched>, interest: Interest) {
    match interest {
        Interest::Read => {
            let _ = fd.readable().await;
        }
        Interest::Write => {
            let _ = fd.writable().await;
        }
        Interest::ReadWrite => {
            tokio::select! {
                _ = fd.readable() => {}
                _ = fd.writable() => {}
            }
        }
    }
}

async fn sleep(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::entry::Family;
    use std::net::{Ipv4Addr, SocketAddr};

    fn options() -> ResolverOptions {
        ResolverOptions::builtin()
            .with_hosts_path(None)
            .with_nameservers(Vec::new())
    }

    #[tokio::test]
    async fn test_ip_literal() {
        let resolver = AsyncResolver::new(options()).unwrap();

        let addrs: Vec<SocketAddr> = resolver
            .resolve(Name::new("192.0.2.10"))
            .await
            .unwrap()
            .collect();

        assert_eq!(addrs, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 0)]);
    }

    #[tokio::test]
    async fn test_no_nameserver() {
        let resolver = AsyncResolver::new(options()).unwrap();

        let err = resolver.lookup("example.com").await.unwrap_err();
        assert_eq!(err, NetError::NoNameserver);
        assert_eq!(err.as_i32(), -137);
    }

    #[tokio::test]
    async fn test_cached_answer() {
        let resolver = AsyncResolver::new(options().with_families(vec![Family::V4])).unwrap();
        let record = crate::dns::wire::Record {
            name: "cached.example".to_string(),
            ttl: 300,
            data: crate::dns::wire::RecordData::Address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4))),
        };
        resolver.cache().set("cached.example", Family::V4, &[record]);

        let entries = resolver.lookup("cached.example").await.unwrap();
        assert_eq!(entries[0].address(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4)));

        resolver.evict("cached.example", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4)));
        assert!(resolver.cache().get("cached.example").is_none());
    }
}
