//! Base types and error handling.
//!
//! Provides foundational types mirroring Chromium's `net/base/`:
//! - [`NetError`](neterror::NetError): host resolver error codes matching `net_error_list.h`
//! - [`IoResultExt`](context::IoResultExt): resolution context for IO results

pub mod context;
pub mod neterror;

#[cfg(test)]
mod tests;
