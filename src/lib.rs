//! # hostresolver
//!
//! Hostname resolution for a Chromium-inspired HTTP networking stack.
//!
//! `hostresolver` turns hostnames into addresses for connection
//! establishment. It speaks DNS over UDP and TCP, DNS-over-HTTPS, or
//! defers to the operating system resolver, and keeps answers in a shared
//! cache that can be persisted between runs.
//!
//! ## Features
//!
//! - **DNS wire codec**: query encoding, answer decoding, TCP framing
//! - **Native resolver**: non-blocking, search lists, nameserver failover,
//!   UDP to TCP escalation on truncation, CNAME chains
//! - **DNS-over-HTTPS**: `POST` and `GET`, wire and JSON answers over BoringSSL
//! - **System resolver**: `getaddrinfo` on a worker thread
//! - **Cache**: TTL expiry, LRU bound, hosts file, SQLite persistence
//! - **Dual stack**: per-family resolvers with a resolution delay favouring IPv6
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hostresolver::dns::{AsyncResolver, ResolverOptions};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let resolver = AsyncResolver::new(ResolverOptions::default())?;
//!     match resolver.lookup("example.com").await {
//!         Ok(entries) => println!("Resolved: {:?}", entries),
//!         Err(e) => println!("Error {}: {}", e.as_i32(), e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error definitions and error context helpers
//! - [`dns`] - Codec, cache, per-family resolvers and the coordinator

pub mod base;
pub mod dns;
