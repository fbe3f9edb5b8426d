use std::io;
use thiserror::Error;

/// Errors produced while resolving a hostname.
///
/// Variants mirror the host resolver entries of Chromium's
/// `net_error_list.h`; [`NetError::as_i32`] returns the matching code.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum NetError {
    #[error("can't resolve host {host}: {reason}")]
    NameNotResolved { host: String, reason: String },
    #[error("No available nameserver")]
    NoNameserver,
    #[error("can't resolve host {host}: timed out after {attempts} attempt(s)")]
    DnsTimedOut { host: String, attempts: usize },
    #[error("can't resolve host {host}: {message}")]
    DnsTransport {
        host: String,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("can't resolve host {host}: malformed DNS response ({reason})")]
    DnsMalformedResponse { host: String, reason: String },
    #[error("can't resolve host {host}: DNS server failure (rcode {rcode})")]
    DnsServerFailed { host: String, rcode: u8 },
    #[error("Host resolver queue too large")]
    HostResolverQueueTooLarge,
    #[error("DNS cache storage error: {message}")]
    DnsCacheStorage { message: String },
}

/// Coarse classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The name does not exist, or no nameserver could be asked.
    Resolution,
    /// Every retry and nameserver was exhausted.
    Timeout,
    /// Socket-level failure unrelated to DNS semantics.
    Transport,
    /// The answer could not be decoded.
    Decode,
    /// The server answered with a failure response code.
    Server,
    /// The persisted cache could not be read or written.
    Storage,
}

impl NetError {
    pub fn not_resolved(host: impl Into<String>, reason: impl Into<String>) -> Self {
        NetError::NameNotResolved {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        NetError::DnsMalformedResponse {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(host: impl Into<String>, err: &io::Error) -> Self {
        NetError::DnsTransport {
            host: host.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            NetError::NameNotResolved { .. } | NetError::NoNameserver => ErrorClass::Resolution,
            NetError::DnsTimedOut { .. } => ErrorClass::Timeout,
            NetError::DnsTransport { .. } | NetError::HostResolverQueueTooLarge => {
                ErrorClass::Transport
            }
            NetError::DnsMalformedResponse { .. } => ErrorClass::Decode,
            NetError::DnsServerFailed { .. } => ErrorClass::Server,
            NetError::DnsCacheStorage { .. } => ErrorClass::Storage,
        }
    }

    /// Rebinds a host-scoped error to another hostname.
    ///
    /// Used when an error raised for a search-list candidate or a CNAME
    /// target is reported against the name the caller asked for.
    pub fn for_host(self, origin: &str) -> Self {
        match self {
            NetError::NameNotResolved { reason, .. } => NetError::NameNotResolved {
                host: origin.to_string(),
                reason,
            },
            NetError::DnsTimedOut { attempts, .. } => NetError::DnsTimedOut {
                host: origin.to_string(),
                attempts,
            },
            NetError::DnsTransport { kind, message, .. } => NetError::DnsTransport {
                host: origin.to_string(),
                kind,
                message,
            },
            NetError::DnsMalformedResponse { reason, .. } => NetError::DnsMalformedResponse {
                host: origin.to_string(),
                reason,
            },
            NetError::DnsServerFailed { rcode, .. } => NetError::DnsServerFailed {
                host: origin.to_string(),
                rcode,
            },
            other => other,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::NameNotResolved { .. } => -105,
            NetError::NoNameserver => -137,
            NetError::DnsTimedOut { .. } => -803,
            NetError::DnsTransport { kind, .. } => match kind {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe => -100,
                io::ErrorKind::ConnectionRefused => -102,
                io::ErrorKind::AddrNotAvailable => -108,
                io::ErrorKind::NotConnected => -112,
                _ => -104,
            },
            NetError::DnsMalformedResponse { .. } => -800,
            NetError::DnsServerFailed { .. } => -802,
            NetError::HostResolverQueueTooLarge => -119,
            // Custom codes start at -900
            NetError::DnsCacheStorage { .. } => -900,
        }
    }
}

impl From<rusqlite::Error> for NetError {
    fn from(err: rusqlite::Error) -> Self {
        NetError::DnsCacheStorage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::DnsCacheStorage {
            message: err.to_string(),
        }
    }
}
