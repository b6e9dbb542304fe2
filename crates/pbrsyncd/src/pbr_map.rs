//! PBR map and sequence model.
//!
//! A map owns its sequences, ordered by sequence number; an interface
//! holds at most one map binding. Eligibility (whether a sequence may
//! be installed as a kernel rule) is computed here; the driver in
//! [`crate::pbr_sync`] turns eligibility transitions into kernel
//! transactions.

use crate::registry::{GroupInfo, PbrContext};
use crate::types::{
    InstallStatus, KernelRule, RuleFilter, SequenceAction, SkipReason, RULE_PRIORITY_BASE,
};
use pbr_types::{Family, IpPrefix};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the internal nexthop-group synthesized for a sequence's
/// inline nexthop.
pub(crate) fn internal_group_name(map: &str, seqno: u32) -> String {
    format!("{}{}", map, seqno)
}

/// One ordered rule entry within a map.
#[derive(Debug, Clone)]
pub struct PbrSequence {
    pub(crate) seqno: u32,
    pub(crate) ruleno: u32,
    pub(crate) family: Option<Family>,
    pub(crate) src: Option<IpPrefix>,
    pub(crate) dst: Option<IpPrefix>,
    pub(crate) action: Option<SequenceAction>,
    pub(crate) install: InstallStatus,
}

impl PbrSequence {
    fn new(seqno: u32) -> Self {
        Self {
            seqno,
            ruleno: RULE_PRIORITY_BASE + seqno,
            family: None,
            src: None,
            dst: None,
            action: None,
            install: InstallStatus::default(),
        }
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Kernel rule priority derived from the sequence number.
    pub fn ruleno(&self) -> u32 {
        self.ruleno
    }

    /// Family of the most recently configured match clause.
    pub fn family(&self) -> Option<Family> {
        self.family
    }

    pub fn src(&self) -> Option<&IpPrefix> {
        self.src.as_ref()
    }

    pub fn dst(&self) -> Option<&IpPrefix> {
        self.dst.as_ref()
    }

    pub fn action(&self) -> Option<&SequenceAction> {
        self.action.as_ref()
    }

    pub fn install(&self) -> &InstallStatus {
        &self.install
    }

    /// Nothing configured at all.
    pub(crate) fn is_blank(&self) -> bool {
        self.src.is_none() && self.dst.is_none() && self.action.is_none()
    }

    /// Family the kernel rule must carry, from the present match
    /// clauses. Only meaningful once eligibility holds.
    fn wire_family(&self) -> Option<Family> {
        self.src
            .as_ref()
            .map(IpPrefix::family)
            .or_else(|| self.dst.as_ref().map(IpPrefix::family))
    }
}

/// A named policy map: sequences ordered by sequence number plus the
/// interfaces the map is bound to.
#[derive(Debug, Clone)]
pub struct PbrMap {
    pub(crate) name: String,
    pub(crate) sequences: BTreeMap<u32, PbrSequence>,
    pub(crate) incoming: BTreeSet<String>,
}

impl PbrMap {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sequences: BTreeMap::new(),
            incoming: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A map is valid when at least one of its sequences is eligible.
    pub fn valid(&self, ctx: &PbrContext) -> bool {
        self.sequences
            .values()
            .any(|seq| self.eligibility(seq, ctx).is_ok())
    }

    /// Sequences in ascending seqno order.
    pub fn sequences(&self) -> impl Iterator<Item = &PbrSequence> {
        self.sequences.values()
    }

    /// Bound interface names in ascending order.
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.incoming.iter().map(String::as_str)
    }

    pub fn sequence(&self, seqno: u32) -> Option<&PbrSequence> {
        self.sequences.get(&seqno)
    }

    pub(crate) fn sequence_mut(&mut self, seqno: u32) -> Option<&mut PbrSequence> {
        self.sequences.get_mut(&seqno)
    }

    /// Fetch or create the sequence, as entering `pbr-map NAME seq N`
    /// does.
    pub(crate) fn get_or_create_sequence(&mut self, seqno: u32) -> &mut PbrSequence {
        self.sequences
            .entry(seqno)
            .or_insert_with(|| PbrSequence::new(seqno))
    }

    pub(crate) fn add_interface(&mut self, ifname: &str) {
        self.incoming.insert(ifname.to_string());
    }

    pub(crate) fn remove_interface(&mut self, ifname: &str) {
        self.incoming.remove(ifname);
    }

    /// Whether a sequence may be installed, and through which group.
    ///
    /// Requires at least one match clause, agreeing families when both
    /// are present, every bound interface known to the registry, and a
    /// resolvable action.
    pub(crate) fn eligibility(
        &self,
        seq: &PbrSequence,
        ctx: &PbrContext,
    ) -> Result<GroupInfo, SkipReason> {
        if seq.src.is_none() && seq.dst.is_none() {
            return Err(SkipReason::NoMatch);
        }
        if let (Some(src), Some(dst)) = (&seq.src, &seq.dst) {
            if src.family() != dst.family() {
                return Err(SkipReason::FamilyConflict);
            }
        }
        for ifname in &self.incoming {
            if !ctx.interfaces.is_known(ifname) {
                return Err(SkipReason::InterfaceMissing);
            }
        }
        let group = match &seq.action {
            None => return Err(SkipReason::NoAction),
            Some(SequenceAction::Group(name)) => name.clone(),
            Some(SequenceAction::Nexthop(_)) => internal_group_name(&self.name, seq.seqno),
        };
        ctx.nexthop_groups
            .resolve(&group)
            .ok_or(SkipReason::UnresolvedGroup)
    }

    /// Kernel rules an eligible sequence should assert: one per bound
    /// interface, or a single interface-less rule for an unbound map.
    pub(crate) fn desired_rules(&self, seq: &PbrSequence, table: u32) -> Vec<KernelRule> {
        let Some(family) = seq.wire_family() else {
            return Vec::new();
        };
        let filter = RuleFilter {
            src: seq.src.is_some(),
            dst: seq.dst.is_some(),
        };
        let template = KernelRule {
            family,
            priority: seq.ruleno,
            ifname: None,
            src: seq.src,
            dst: seq.dst,
            filter,
            table,
        };
        if self.incoming.is_empty() {
            return vec![template];
        }
        self.incoming
            .iter()
            .map(|ifname| KernelRule {
                ifname: Some(ifname.clone()),
                ..template.clone()
            })
            .collect()
    }
}

/// Per-interface PBR attachment record, created on first use.
#[derive(Debug, Clone)]
pub struct PbrInterface {
    pub(crate) ifname: String,
    pub(crate) policy: Option<String>,
}

impl PbrInterface {
    pub(crate) fn new(ifname: &str) -> Self {
        Self {
            ifname: ifname.to_string(),
            policy: None,
        }
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Name of the bound map, if any.
    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }
}
