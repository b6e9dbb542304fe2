//! Policy-Based Routing Synchronization Daemon
//!
//! This crate keeps the kernel's forwarding-rule table synchronized
//! with declared policy: named maps of sequenced rules that match on
//! source/destination prefix and steer traffic into the routing table
//! of a nexthop-group.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────┐     ┌─────────────────┐
//! │  Configuration  │     │      pbrsyncd        │     │  Linux Kernel   │
//! │                 │     │                      │     │                 │
//! │  maps/sequences │────▶│  PbrSync (model +    │────▶│  FIB rule table │
//! │  pbr-policy     │     │  validity engine)    │     │                 │
//! │  bindings       │     │        │             │     │  RTM_NEWRULE    │
//! │                 │     │        ▼             │     │  RTM_DELRULE    │
//! └─────────────────┘     │  codec / channel     │◀────│  notifications  │
//!                         │  (netlink rules)     │     │                 │
//!                         └──────────────────────┘     └─────────────────┘
//! ```
//!
//! Mutations re-check sequence eligibility and converge the kernel on
//! the declared state; kernel-originated rule deletions are matched
//! against installed tuples and reasserted. The declared state always
//! wins.

pub mod codec;
pub mod config;
pub mod error;
pub mod kernel;
pub mod pbr_map;
pub mod pbr_sync;
pub mod registry;
pub mod types;

pub use config::PbrConfig;
pub use error::{PbrError, Result};
pub use kernel::{NetlinkRuleChannel, RecordingChannel, RuleChannel, RuleListener};
pub use pbr_map::{PbrInterface, PbrMap, PbrSequence};
pub use pbr_sync::PbrSync;
pub use registry::{
    GroupInfo, InterfaceRegistry, NexthopGroupRegistry, PbrContext, VrfRegistry, DEFAULT_VRF_NAME,
};
pub use types::{
    InstallStatus, KernelRule, Nexthop, RuleFilter, RuleOp, SequenceAction, SequenceState,
    SkipReason, VrfId,
};
