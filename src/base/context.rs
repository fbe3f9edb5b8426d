//! Ergonomic error context helpers.
//!
//! Provides an extension trait for adding resolution context to `Result`
//! types, converting IO errors into host-scoped `NetError` variants.

use crate::base::neterror::NetError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add DNS resolution context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use hostresolver::base::context::IoResultExt;
    ///
    /// socket.send(&query).dns_context("example.com")?;
    /// // Error: "can't resolve host example.com: connection refused"
    /// ```
    fn dns_context(self, host: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn dns_context(self, host: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::transport(host, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_dns_context() {
        let result: Result<(), io::Error> =
            Err(Error::new(ErrorKind::ConnectionRefused, "connection refused"));
        let err = result.dns_context("unknown.example.com").unwrap_err();

        match &err {
            NetError::DnsTransport { host, kind, .. } => {
                assert_eq!(host, "unknown.example.com");
                assert_eq!(*kind, ErrorKind::ConnectionRefused);
            }
            _ => panic!("Expected DnsTransport"),
        }
        assert_eq!(
            err.to_string(),
            "can't resolve host unknown.example.com: connection refused"
        );
    }
}
