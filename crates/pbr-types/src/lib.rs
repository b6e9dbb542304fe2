//! Shared value types for the pbrsyncd control plane.
//!
//! This crate provides the type-safe network primitives the policy model
//! and the kernel rule codec agree on:
//!
//! - [`Family`]: address family with the wire byte widths the kernel
//!   rule format uses (4 bytes for IPv4, 16 for IPv6)
//! - [`IpPrefix`]: an IP network prefix in CIDR notation

mod ip;

pub use ip::{Family, IpPrefix};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidPrefix(String),
}
