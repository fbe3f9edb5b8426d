//! Resolution through the operating system resolver.
//!
//! `getaddrinfo` blocks, so lookups run on a dedicated worker thread. The
//! resolver hands jobs to the worker over a bounded queue and receives
//! `(family, request, result)` tuples back through a [`Handoff`] whose
//! descriptor the event loop polls like any other socket.

use crate::base::neterror::NetError;
use crate::dns::entry::{Entry, Family};
use crate::dns::options::ResolverOptions;
use crate::dns::wakeup::{handoff, Handoff, Notifier};
use crate::dns::{Interest, RequestId, Resolution};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Jobs the worker accepts before submissions are rejected.
pub const JOB_QUEUE_CAPACITY: usize = 64;

/// Blocking lookup primitive run on the worker thread.
pub type LookupFn = Arc<dyn Fn(&str) -> io::Result<Vec<IpAddr>> + Send + Sync>;

type Answer = (Family, RequestId, io::Result<Vec<IpAddr>>);

struct Job {
    id: RequestId,
    hostname: String,
}

struct Pending {
    hostname: String,
    deadline: Instant,
}

/// Resolver for one family backed by the system resolver.
pub struct SystemResolver {
    family: Family,
    timeout: Duration,
    jobs: Sender<Job>,
    answers: Handoff<Answer>,
    pending: HashMap<RequestId, Pending>,
    ready: Vec<Resolution>,
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver")
            .field("family", &self.family)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl SystemResolver {
    pub fn new(family: Family, options: &ResolverOptions) -> io::Result<Self> {
        Self::with_lookup(family, options, Arc::new(getaddrinfo))
    }

    /// Creates a resolver whose worker calls `lookup` instead of the OS.
    pub fn with_lookup(
        family: Family,
        options: &ResolverOptions,
        lookup: LookupFn,
    ) -> io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::bounded::<Job>(JOB_QUEUE_CAPACITY);
        let (notifier, answers) = handoff::<Answer>(JOB_QUEUE_CAPACITY)?;

        std::thread::Builder::new()
            .name("dns-system-resolver".to_string())
            .spawn(move || worker(family, queue, notifier, lookup))?;

        Ok(Self {
            family,
            timeout: options.total_timeout(),
            jobs,
            answers,
            pending: HashMap::new(),
            ready: Vec::new(),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn submit(&mut self, id: RequestId, hostname: &str) -> Result<(), NetError> {
        let job = Job {
            id,
            hostname: hostname.to_string(),
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(NetError::HostResolverQueueTooLarge),
            Err(TrySendError::Disconnected(_)) => {
                let err = io::Error::new(io::ErrorKind::BrokenPipe, "system resolver worker exited");
                return Err(NetError::transport(hostname, &err));
            }
        }
        tracing::debug!(host = %hostname, family = %self.family, "resolving via getaddrinfo");

        self.pending.insert(
            id,
            Pending {
                hostname: hostname.to_string(),
                deadline: Instant::now() + self.timeout,
            },
        );
        Ok(())
    }

    pub fn poll(&mut self) -> Vec<Resolution> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Vec<Resolution> {
        for (family, id, result) in self.answers.drain() {
            // Late answers for cancelled or timed out requests are dropped.
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            let result = match result {
                Ok(ips) => {
                    let entries: Vec<Entry> = ips
                        .into_iter()
                        .filter(|ip| Family::of(ip) == family)
                        .map(Entry::new)
                        .collect();
                    if entries.is_empty() {
                        Err(NetError::not_resolved(&pending.hostname, "no address records"))
                    } else {
                        tracing::debug!(host = %pending.hostname, count = entries.len(), "resolution complete");
                        Ok(entries)
                    }
                }
                Err(e) => {
                    tracing::debug!(host = %pending.hostname, error = %e, "getaddrinfo failed");
                    Err(NetError::not_resolved(&pending.hostname, e.to_string()))
                }
            };
            self.ready.push(Resolution {
                id,
                family,
                hostname: pending.hostname,
                result,
            });
        }

        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                self.ready.push(Resolution {
                    id,
                    family: self.family,
                    result: Err(NetError::DnsTimedOut {
                        host: pending.hostname.clone(),
                        attempts: 1,
                    }),
                    hostname: pending.hostname,
                });
            }
        }

        std::mem::take(&mut self.ready)
    }

    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.ready.is_empty() || !self.answers.is_empty() {
            return Some(Duration::ZERO);
        }
        self.pending
            .values()
            .map(|p| p.deadline.saturating_duration_since(now))
            .min()
    }

    pub fn interests(&self) -> Option<Interest> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Interest::Read)
        }
    }

    pub fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.answers.file_descriptor())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    pub fn cancel(&mut self, id: RequestId) {
        self.pending.remove(&id);
        self.ready.retain(|r| r.id != id);
    }

    /// Forgets all pending requests; their answers are discarded on arrival.
    pub fn close(&mut self) {
        self.pending.clear();
        self.ready.clear();
    }
}

fn worker(family: Family, queue: Receiver<Job>, notifier: Notifier<Answer>, lookup: LookupFn) {
    // Exits once the resolver drops its job sender.
    for job in queue.iter() {
        let result = lookup(&job.hostname);
        if notifier.send((family, job.id, result)).is_err() {
            break;
        }
    }
    tracing::trace!(family = %family, "system resolver worker stopped");
}

fn getaddrinfo(hostname: &str) -> io::Result<Vec<IpAddr>> {
    let host = hostname.trim_end_matches('.');
    Ok((host, 0u16).to_socket_addrs()?.map(|addr| addr.ip()).collect())
}
