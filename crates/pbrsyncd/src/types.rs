//! Core types for PBR rule synchronization.

use pbr_types::{Family, IpPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Kernel rule priority assigned to the lowest sequence number. A
/// sequence's rule priority is `RULE_PRIORITY_BASE + seqno`, keeping
/// priorities monotonic with sequence order and clear of the kernel's
/// default rules (0, 32766, 32767).
pub const RULE_PRIORITY_BASE: u32 = 300;

/// Table ids below this fit the one-byte field in the kernel rule
/// header; larger ids travel in the extended table attribute.
pub const RULE_TABLE_THRESHOLD: u32 = 256;

/// First routing table id handed to internal nexthop-groups created
/// for inline `set nexthop` entries.
pub const INTERNAL_TABLE_BASE: u32 = 10000;

/// Highest accepted sequence number.
pub const SEQNO_MAX: u32 = 65535;

/// VRF identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VrfId(pub u32);

impl VrfId {
    /// The default VRF.
    pub const DEFAULT: Self = VrfId(0);
}

impl fmt::Display for VrfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Operation carried by a kernel rule request or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// RTM_NEWRULE
    Add,
    /// RTM_DELRULE
    Delete,
}

/// A single resolved inline nexthop.
///
/// VRF and interface are resolved against the registries at
/// configuration time; an unresolvable name rejects the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nexthop {
    /// Gateway address; its family is the nexthop's family.
    pub gateway: IpAddr,
    /// Egress interface, when one was named.
    pub ifname: Option<String>,
    /// Resolved index of `ifname`.
    pub ifindex: Option<u32>,
    /// VRF the nexthop resolves in.
    pub vrf: VrfId,
}

impl Nexthop {
    pub fn family(&self) -> Family {
        Family::of(&self.gateway)
    }
}

/// Forwarding action of a sequence: a named nexthop-group or a single
/// inline nexthop, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceAction {
    /// Forward via a named, externally managed nexthop-group.
    Group(String),
    /// Forward via one inline nexthop.
    Nexthop(Nexthop),
}

/// Why a sequence is not installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No src or dst match clause configured.
    NoMatch,
    /// No nexthop or nexthop-group configured.
    NoAction,
    /// Src and dst match clauses have different families.
    FamilyConflict,
    /// The named nexthop-group does not resolve to a table yet.
    UnresolvedGroup,
    /// An interface the owning map is bound to does not exist.
    InterfaceMissing,
    /// The kernel rejected the rule transaction.
    KernelRejected,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NoMatch => "Invalid NO Match",
            SkipReason::NoAction => "Invalid NO nexthops",
            SkipReason::FamilyConflict => "Invalid SRC/DST family mismatch",
            SkipReason::UnresolvedGroup => "Invalid NH Group",
            SkipReason::InterfaceMissing => "Invalid Interface",
            SkipReason::KernelRejected => "Kernel rejected rule",
        };
        f.write_str(s)
    }
}

/// Install state machine of a sequence.
///
/// `InstallPending` is held across the blocking kernel transaction and
/// guards against submitting a second transaction for the same
/// sequence while one is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceState {
    /// Nothing configured yet.
    #[default]
    Unconfigured,
    /// Configured but not installable; see the recorded reason.
    Ineligible,
    /// Installable, not (fully) in the kernel.
    Eligible,
    /// A kernel transaction is in flight.
    InstallPending,
    /// All derived rules acknowledged by the kernel.
    Installed,
}

/// Install bookkeeping for a sequence.
#[derive(Debug, Clone, Default)]
pub struct InstallStatus {
    pub state: SequenceState,
    /// Opaque id assigned on first install, for idempotent
    /// re-submission. Zero until then.
    pub unique: u32,
    /// Installed-nexthop count reported by the group resolver.
    pub nhs_installed: u32,
    /// Why the sequence is not installed, when it is not.
    pub reason: Option<SkipReason>,
    /// Exact rule tuples currently acknowledged by the kernel; the
    /// keys reconciliation matches notifications against.
    pub rules: Vec<KernelRule>,
}

impl InstallStatus {
    pub fn installed(&self) -> bool {
        self.state == SequenceState::Installed
    }
}

/// Which filter fields a kernel rule carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub src: bool,
    pub dst: bool,
}

/// Ephemeral kernel-facing rule descriptor, constructed per
/// transaction from an eligible sequence and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRule {
    pub family: Family,
    /// Kernel rule priority (the sequence's ruleno).
    pub priority: u32,
    /// Interface the rule applies to; absent for unbound maps.
    pub ifname: Option<String>,
    pub src: Option<IpPrefix>,
    pub dst: Option<IpPrefix>,
    /// Active match fields.
    pub filter: RuleFilter,
    /// Target routing table.
    pub table: u32,
}

impl fmt::Display for KernelRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "family {} IF {} Pref {} Src {} Dst {} Table {}",
            self.family,
            self.ifname.as_deref().unwrap_or("-"),
            self.priority,
            self.src.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            self.dst.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            self.table
        )
    }
}
