//! Error types for pbrsyncd.
//!
//! Configuration errors are rejected synchronously at the mutation call
//! and leave policy state untouched. Kernel transaction errors are
//! surfaced per sequence through its install status; nothing here is
//! fatal to the process.

use thiserror::Error;

/// Errors that can occur in pbrsyncd.
#[derive(Debug, Error)]
pub enum PbrError {
    /// A `set nexthop` already exists on the sequence.
    #[error("a `set nexthop` command already exists, please remove that first")]
    NexthopConfigured,

    /// A different nexthop-group is already bound to the sequence.
    #[error("nexthop-group {0} is already configured, please delete it before modifying")]
    GroupConfigured(String),

    /// The named group does not match the one bound to the sequence.
    #[error("nexthop-group {0} does not exist on this sequence to remove")]
    GroupMismatch(String),

    /// A second distinct inline nexthop was configured.
    #[error("if you would like more than one nexthop please use nexthop-groups")]
    UseNexthopGroup,

    /// Removal named a nexthop that is not the configured one.
    #[error("no matching nexthop to delete")]
    NexthopMismatch,

    /// Removal from an empty inline nexthop set.
    #[error("no nexthops to delete")]
    NoNexthops,

    /// VRF name lookup failed.
    #[error("vrf {0} is non-existent")]
    VrfNotFound(String),

    /// Interface name lookup failed within the given VRF.
    #[error("interface {ifname} does not exist in vrf {vrf}")]
    InterfaceNotFound { ifname: String, vrf: String },

    /// Referenced map does not exist.
    #[error("pbr-map {0} not found")]
    MapNotFound(String),

    /// Referenced sequence does not exist in the map.
    #[error("pbr-map {map} has no sequence {seqno}")]
    SequenceNotFound { map: String, seqno: u32 },

    /// Sequence number outside the accepted range.
    #[error("sequence number {0} out of range")]
    InvalidSeqno(u32),

    /// A kernel transaction is already in flight for the sequence.
    #[error("pbr-map {map} seq {seqno} already has a rule transaction in flight")]
    TransactionPending { map: String, seqno: u32 },

    /// Netlink socket or kernel transaction error.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Address or prefix parse error.
    #[error(transparent)]
    Parse(#[from] pbr_types::ParseError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pbrsyncd operations.
pub type Result<T> = std::result::Result<T, PbrError>;
