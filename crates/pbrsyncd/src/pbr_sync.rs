//! Policy model driver: configuration mutations, kernel rule
//! transactions and reconciliation.
//!
//! [`PbrSync`] owns the maps, the interface bindings, the resolver
//! context and the kernel channel, and is the single non-reentrant
//! mutation path: operator mutations and kernel notifications both
//! feed into it serially. Every mutation re-checks the affected
//! sequence and converges the kernel on the declared state; the only
//! blocking point is the channel's send-and-await-ack call.

use crate::codec;
use crate::error::{PbrError, Result};
use crate::kernel::RuleChannel;
use crate::pbr_map::{internal_group_name, PbrInterface, PbrMap};
use crate::registry::{GroupInfo, PbrContext, DEFAULT_VRF_NAME};
use crate::types::{
    KernelRule, Nexthop, RuleOp, SequenceAction, SequenceState, SkipReason, SEQNO_MAX,
};
use pbr_types::IpPrefix;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy)]
enum MatchClause {
    Src,
    Dst,
}

/// The PBR control plane: policy model plus kernel synchronization.
pub struct PbrSync<C: RuleChannel> {
    maps: BTreeMap<String, PbrMap>,
    interfaces: BTreeMap<String, PbrInterface>,
    ctx: PbrContext,
    channel: C,
    next_unique: u32,
}

impl<C: RuleChannel> PbrSync<C> {
    pub fn new(ctx: PbrContext, channel: C) -> Self {
        Self {
            maps: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            ctx,
            channel,
            next_unique: 1,
        }
    }

    // --- snapshot access (read-only; display and config replay) ---

    /// Maps in ascending name order.
    pub fn maps(&self) -> impl Iterator<Item = &PbrMap> {
        self.maps.values()
    }

    pub fn map(&self, name: &str) -> Option<&PbrMap> {
        self.maps.get(name)
    }

    /// Interface attachment records in ascending name order.
    pub fn bindings(&self) -> impl Iterator<Item = &PbrInterface> {
        self.interfaces.values()
    }

    pub fn context(&self) -> &PbrContext {
        &self.ctx
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Whether the named map has at least one eligible sequence.
    pub fn map_valid(&self, name: &str) -> bool {
        self.maps
            .get(name)
            .is_some_and(|m| m.valid(&self.ctx))
    }

    // --- sequence lookup helpers ---

    fn ensure_map(&mut self, name: &str) -> &mut PbrMap {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| PbrMap::new(name))
    }

    /// Fetch or create a sequence, as entering `pbr-map NAME seq N`
    /// does. The map is created on first reference.
    pub fn ensure_sequence(&mut self, map: &str, seqno: u32) -> Result<()> {
        if seqno == 0 || seqno > SEQNO_MAX {
            return Err(PbrError::InvalidSeqno(seqno));
        }
        self.ensure_map(map).get_or_create_sequence(seqno);
        Ok(())
    }

    fn sequence_ref(&self, map: &str, seqno: u32) -> Result<&crate::pbr_map::PbrSequence> {
        self.maps
            .get(map)
            .ok_or_else(|| PbrError::MapNotFound(map.to_string()))?
            .sequence(seqno)
            .ok_or(PbrError::SequenceNotFound {
                map: map.to_string(),
                seqno,
            })
    }

    fn sequence_mut(&mut self, map: &str, seqno: u32) -> Result<&mut crate::pbr_map::PbrSequence> {
        self.maps
            .get_mut(map)
            .ok_or_else(|| PbrError::MapNotFound(map.to_string()))?
            .sequence_mut(seqno)
            .ok_or(PbrError::SequenceNotFound {
                map: map.to_string(),
                seqno,
            })
    }

    // --- configuration mutations ---

    /// Set or clear the source match prefix.
    #[instrument(skip(self))]
    pub fn set_match_src(&mut self, map: &str, seqno: u32, prefix: Option<IpPrefix>) -> Result<()> {
        self.set_match(map, seqno, MatchClause::Src, prefix)
    }

    /// Set or clear the destination match prefix.
    #[instrument(skip(self))]
    pub fn set_match_dst(&mut self, map: &str, seqno: u32, prefix: Option<IpPrefix>) -> Result<()> {
        self.set_match(map, seqno, MatchClause::Dst, prefix)
    }

    fn set_match(
        &mut self,
        map: &str,
        seqno: u32,
        clause: MatchClause,
        prefix: Option<IpPrefix>,
    ) -> Result<()> {
        self.ensure_sequence(map, seqno)?;
        let seq = self.sequence_mut(map, seqno)?;

        let current = match clause {
            MatchClause::Src => seq.src,
            MatchClause::Dst => seq.dst,
        };
        // Exact prefix equality, not just the same covered network.
        if current == prefix {
            return Ok(());
        }

        match clause {
            MatchClause::Src => seq.src = prefix,
            MatchClause::Dst => seq.dst = prefix,
        }
        // The family follows the newest configured clause.
        if let Some(p) = prefix {
            seq.family = Some(p.family());
        }

        self.check_sequence(map, seqno)
    }

    /// Bind a named nexthop-group as the sequence action. A group that
    /// does not resolve yet is accepted and left pending.
    #[instrument(skip(self))]
    pub fn set_nexthop_group(&mut self, map: &str, seqno: u32, group: &str) -> Result<()> {
        self.ensure_sequence(map, seqno)?;
        {
            let seq = self.sequence_ref(map, seqno)?;
            match &seq.action {
                Some(SequenceAction::Nexthop(_)) => return Err(PbrError::NexthopConfigured),
                Some(SequenceAction::Group(existing)) if existing == group => return Ok(()),
                Some(SequenceAction::Group(existing)) => {
                    return Err(PbrError::GroupConfigured(existing.clone()));
                }
                None => {}
            }
        }
        if self.ctx.nexthop_groups.resolve(group).is_none() {
            warn!(
                group,
                "nexthop-group does not exist, map will not be applied until it is created"
            );
        }
        self.sequence_mut(map, seqno)?.action = Some(SequenceAction::Group(group.to_string()));
        self.check_sequence(map, seqno)
    }

    /// Remove the named nexthop-group binding.
    #[instrument(skip(self))]
    pub fn clear_nexthop_group(&mut self, map: &str, seqno: u32, group: &str) -> Result<()> {
        {
            let seq = self.sequence_ref(map, seqno)?;
            match &seq.action {
                Some(SequenceAction::Group(existing)) if existing == group => {}
                _ => return Err(PbrError::GroupMismatch(group.to_string())),
            }
        }
        self.sequence_mut(map, seqno)?.action = None;
        self.check_sequence(map, seqno)
    }

    fn resolve_nexthop(
        &self,
        gateway: IpAddr,
        ifname: Option<&str>,
        vrf: Option<&str>,
    ) -> Result<Nexthop> {
        let vrf_name = vrf.unwrap_or(DEFAULT_VRF_NAME);
        let vrf_id = self
            .ctx
            .vrfs
            .resolve(vrf_name)
            .ok_or_else(|| PbrError::VrfNotFound(vrf_name.to_string()))?;
        let ifindex = match ifname {
            Some(name) => Some(self.ctx.interfaces.resolve(vrf_id, name).ok_or_else(|| {
                PbrError::InterfaceNotFound {
                    ifname: name.to_string(),
                    vrf: vrf_name.to_string(),
                }
            })?),
            None => None,
        };
        Ok(Nexthop {
            gateway,
            ifname: ifname.map(str::to_string),
            ifindex,
            vrf: vrf_id,
        })
    }

    /// Configure the sequence's single inline nexthop. Adding the same
    /// nexthop again is a no-op; a second distinct one is rejected in
    /// favor of a named group.
    #[instrument(skip(self))]
    pub fn set_nexthop(
        &mut self,
        map: &str,
        seqno: u32,
        gateway: IpAddr,
        ifname: Option<&str>,
        vrf: Option<&str>,
    ) -> Result<()> {
        self.ensure_sequence(map, seqno)?;
        {
            let seq = self.sequence_ref(map, seqno)?;
            if let Some(SequenceAction::Group(existing)) = &seq.action {
                return Err(PbrError::GroupConfigured(existing.clone()));
            }
        }
        let nexthop = self.resolve_nexthop(gateway, ifname, vrf)?;
        {
            let seq = self.sequence_mut(map, seqno)?;
            if let Some(SequenceAction::Nexthop(existing)) = &seq.action {
                if *existing == nexthop {
                    return Ok(());
                }
                return Err(PbrError::UseNexthopGroup);
            }
            seq.action = Some(SequenceAction::Nexthop(nexthop));
        }
        // The inline nexthop lives in an internal single-entry group
        // with its own table.
        let group = internal_group_name(map, seqno);
        self.ctx.nexthop_groups.register_internal(&group);
        self.check_sequence(map, seqno)
    }

    /// Remove the inline nexthop; it must match the configured one.
    #[instrument(skip(self))]
    pub fn remove_nexthop(
        &mut self,
        map: &str,
        seqno: u32,
        gateway: IpAddr,
        ifname: Option<&str>,
        vrf: Option<&str>,
    ) -> Result<()> {
        let nexthop = self.resolve_nexthop(gateway, ifname, vrf)?;
        {
            let seq = self.sequence_ref(map, seqno)?;
            match &seq.action {
                Some(SequenceAction::Group(existing)) => {
                    return Err(PbrError::GroupConfigured(existing.clone()));
                }
                Some(SequenceAction::Nexthop(existing)) if *existing == nexthop => {}
                Some(SequenceAction::Nexthop(_)) => return Err(PbrError::NexthopMismatch),
                None => return Err(PbrError::NoNexthops),
            }
        }
        self.sequence_mut(map, seqno)?.action = None;
        self.ctx
            .nexthop_groups
            .release_internal(&internal_group_name(map, seqno));
        self.check_sequence(map, seqno)
    }

    /// Bind an interface to a map. Rebinding is an atomic swap: the
    /// old map's rules for this interface are uninstalled before
    /// anything installs under the new map.
    #[instrument(skip(self))]
    pub fn bind_policy(&mut self, ifname: &str, mapname: &str) -> Result<()> {
        let previous = self
            .interfaces
            .entry(ifname.to_string())
            .or_insert_with(|| PbrInterface::new(ifname))
            .policy
            .clone();
        if previous.as_deref() == Some(mapname) {
            return Ok(());
        }
        if let Some(old) = previous {
            self.detach_policy(&old, ifname)?;
        }
        if let Some(rec) = self.interfaces.get_mut(ifname) {
            rec.policy = Some(mapname.to_string());
        }
        self.ensure_map(mapname).add_interface(ifname);
        self.check_map(mapname)
    }

    /// Remove an interface's map binding. Naming a map that is not the
    /// bound one is a no-op.
    #[instrument(skip(self))]
    pub fn unbind_policy(&mut self, ifname: &str, mapname: &str) -> Result<()> {
        let bound = self.interfaces.get(ifname).and_then(|r| r.policy.clone());
        if bound.as_deref() != Some(mapname) {
            return Ok(());
        }
        if let Some(rec) = self.interfaces.get_mut(ifname) {
            rec.policy = None;
        }
        self.detach_policy(mapname, ifname)
    }

    /// Uninstall everything `mapname` installed for `ifname`, drop the
    /// interface from the map and re-sync the map's remaining intent.
    fn detach_policy(&mut self, mapname: &str, ifname: &str) -> Result<()> {
        let Some(m) = self.maps.get(mapname) else {
            return Ok(());
        };
        let seqnos: Vec<u32> = m.sequences.keys().copied().collect();
        for seqno in &seqnos {
            self.uninstall_interface_rules(mapname, *seqno, ifname)?;
        }
        if let Some(m) = self.maps.get_mut(mapname) {
            m.remove_interface(ifname);
        }
        for seqno in seqnos {
            self.check_sequence(mapname, seqno)?;
        }
        self.maybe_destroy_map(mapname);
        Ok(())
    }

    /// Delete one sequence: uninstall, remove, destroy the map when it
    /// becomes empty and unreferenced.
    #[instrument(skip(self))]
    pub fn delete_sequence(&mut self, map: &str, seqno: u32) -> Result<()> {
        self.sequence_ref(map, seqno)?;
        self.uninstall_rules(map, seqno)?;
        if let Some(m) = self.maps.get_mut(map) {
            if let Some(seq) = m.sequences.remove(&seqno) {
                if matches!(seq.action, Some(SequenceAction::Nexthop(_))) {
                    self.ctx
                        .nexthop_groups
                        .release_internal(&internal_group_name(map, seqno));
                }
            }
        }
        self.maybe_destroy_map(map);
        Ok(())
    }

    /// Delete a map, or just one of its sequences.
    #[instrument(skip(self))]
    pub fn delete_map(&mut self, map: &str, seqno: Option<u32>) -> Result<()> {
        let seqnos: Vec<u32> = {
            let m = self
                .maps
                .get(map)
                .ok_or_else(|| PbrError::MapNotFound(map.to_string()))?;
            match seqno {
                Some(s) => {
                    m.sequence(s).ok_or(PbrError::SequenceNotFound {
                        map: map.to_string(),
                        seqno: s,
                    })?;
                    vec![s]
                }
                None => m.sequences.keys().copied().collect(),
            }
        };
        for s in seqnos {
            self.delete_sequence(map, s)?;
        }
        Ok(())
    }

    fn maybe_destroy_map(&mut self, name: &str) {
        let referenced = self
            .interfaces
            .values()
            .any(|rec| rec.policy.as_deref() == Some(name));
        if let Some(m) = self.maps.get(name) {
            if m.sequences.is_empty() && m.incoming.is_empty() && !referenced {
                self.maps.remove(name);
                debug!(map = name, "destroyed empty pbr-map");
            }
        }
    }

    // --- resolver change notifications ---

    /// Register (or update) a nexthop-group and re-check every
    /// sequence naming it.
    #[instrument(skip(self))]
    pub fn register_group(&mut self, name: &str, info: GroupInfo) -> Result<()> {
        self.ctx.nexthop_groups.register(name, info);
        self.recheck_group(name)
    }

    /// Remove a nexthop-group and re-check every sequence naming it.
    #[instrument(skip(self))]
    pub fn unregister_group(&mut self, name: &str) -> Result<()> {
        self.ctx.nexthop_groups.unregister(name);
        self.recheck_group(name)
    }

    fn recheck_group(&mut self, name: &str) -> Result<()> {
        let affected: Vec<(String, u32)> = self
            .maps
            .values()
            .flat_map(|m| {
                m.sequences
                    .values()
                    .filter(|s| {
                        matches!(&s.action, Some(SequenceAction::Group(g)) if g == name)
                    })
                    .map(|s| (m.name().to_string(), s.seqno()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (map, seqno) in affected {
            self.check_sequence(&map, seqno)?;
        }
        Ok(())
    }

    /// Add an interface to the registry and re-check maps bound to it.
    #[instrument(skip(self))]
    pub fn register_interface(
        &mut self,
        vrf: crate::types::VrfId,
        name: &str,
        ifindex: u32,
    ) -> Result<()> {
        self.ctx.interfaces.register(vrf, name, ifindex);
        self.recheck_interface(name)
    }

    /// Drop an interface from the registry and re-check maps bound to
    /// it.
    #[instrument(skip(self))]
    pub fn unregister_interface(&mut self, vrf: crate::types::VrfId, name: &str) -> Result<()> {
        self.ctx.interfaces.unregister(vrf, name);
        self.recheck_interface(name)
    }

    /// Register a VRF. VRF names only matter while resolving nexthop
    /// mutations, so no re-check is needed.
    pub fn register_vrf(&mut self, name: &str, id: crate::types::VrfId) {
        self.ctx.vrfs.register(name, id);
    }

    fn recheck_interface(&mut self, name: &str) -> Result<()> {
        let affected: Vec<(String, u32)> = self
            .maps
            .values()
            .filter(|m| m.incoming.contains(name))
            .flat_map(|m| {
                m.sequences
                    .keys()
                    .map(|s| (m.name().to_string(), *s))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (map, seqno) in affected {
            self.check_sequence(&map, seqno)?;
        }
        Ok(())
    }

    // --- validity engine ---

    /// Re-check every sequence of a map.
    pub fn check_map(&mut self, map: &str) -> Result<()> {
        let seqnos: Vec<u32> = match self.maps.get(map) {
            Some(m) => m.sequences.keys().copied().collect(),
            None => return Ok(()),
        };
        for seqno in seqnos {
            self.check_sequence(map, seqno)?;
        }
        Ok(())
    }

    /// Recompute a sequence's eligibility and converge the kernel on
    /// it: install when newly eligible, uninstall when not, and record
    /// the reason.
    pub fn check_sequence(&mut self, map: &str, seqno: u32) -> Result<()> {
        let (eligibility, desired) = {
            let m = self
                .maps
                .get(map)
                .ok_or_else(|| PbrError::MapNotFound(map.to_string()))?;
            let seq = m.sequence(seqno).ok_or(PbrError::SequenceNotFound {
                map: map.to_string(),
                seqno,
            })?;
            match m.eligibility(seq, &self.ctx) {
                Ok(info) => (Ok(info), m.desired_rules(seq, info.table_id)),
                Err(reason) => (Err(reason), Vec::new()),
            }
        };

        match eligibility {
            Ok(info) => self.apply_rules(map, seqno, desired, info),
            Err(reason) => self.retire_sequence(map, seqno, reason),
        }
    }

    /// Converge the kernel on `desired` for an eligible sequence.
    /// Stale rules are removed before missing ones are added; failures
    /// leave the sequence eligible with `KernelRejected` recorded, to
    /// be re-attempted on the next mutation or re-check.
    fn apply_rules(
        &mut self,
        map: &str,
        seqno: u32,
        desired: Vec<KernelRule>,
        info: GroupInfo,
    ) -> Result<()> {
        let (pending, unchanged) = {
            let seq = self.sequence_ref(map, seqno)?;
            (
                seq.install.state == SequenceState::InstallPending,
                seq.install.installed() && seq.install.rules == desired,
            )
        };
        if pending {
            return Err(PbrError::TransactionPending {
                map: map.to_string(),
                seqno,
            });
        }
        if unchanged {
            // Nothing to ship; refresh the resolver-reported count.
            self.sequence_mut(map, seqno)?.install.nhs_installed = info.installed;
            return Ok(());
        }

        let unique = self.next_unique;
        let mut assigned = false;
        let (stale, fresh) = {
            let seq = self.sequence_mut(map, seqno)?;
            if seq.install.unique == 0 {
                seq.install.unique = unique;
                assigned = true;
            }
            seq.install.state = SequenceState::InstallPending;
            let current = &seq.install.rules;
            let stale: Vec<KernelRule> = current
                .iter()
                .filter(|rule| !desired.contains(rule))
                .cloned()
                .collect();
            let fresh: Vec<KernelRule> = desired
                .iter()
                .filter(|rule| !current.contains(rule))
                .cloned()
                .collect();
            (stale, fresh)
        };
        if assigned {
            self.next_unique += 1;
        }

        let mut failed = false;
        let mut rejected: Vec<KernelRule> = Vec::new();
        for rule in &stale {
            if !self.transact(rule, RuleOp::Delete) {
                failed = true;
            }
        }
        for rule in &fresh {
            if !self.transact(rule, RuleOp::Add) {
                rejected.push(rule.clone());
                failed = true;
            }
        }

        let seq = self.sequence_mut(map, seqno)?;
        // Rules already present stay; rejected ones are not recorded.
        seq.install.rules = desired
            .into_iter()
            .filter(|r| !rejected.contains(r))
            .collect();
        seq.install.nhs_installed = info.installed;
        if failed {
            seq.install.state = SequenceState::Eligible;
            seq.install.reason = Some(SkipReason::KernelRejected);
        } else {
            seq.install.state = SequenceState::Installed;
            seq.install.reason = None;
        }
        Ok(())
    }

    /// Take an ineligible sequence out of the kernel and record why it
    /// is not installed.
    fn retire_sequence(&mut self, map: &str, seqno: u32, reason: SkipReason) -> Result<()> {
        self.uninstall_rules(map, seqno)?;
        let seq = self.sequence_mut(map, seqno)?;
        if seq.is_blank() {
            seq.install.state = SequenceState::Unconfigured;
            seq.install.reason = None;
        } else {
            seq.install.state = SequenceState::Ineligible;
            seq.install.reason = Some(reason);
        }
        seq.install.nhs_installed = 0;
        Ok(())
    }

    /// Send delete transactions for every recorded rule tuple.
    fn uninstall_rules(&mut self, map: &str, seqno: u32) -> Result<()> {
        let rules = {
            let seq = self.sequence_ref(map, seqno)?;
            if seq.install.state == SequenceState::InstallPending {
                return Err(PbrError::TransactionPending {
                    map: map.to_string(),
                    seqno,
                });
            }
            seq.install.rules.clone()
        };
        if rules.is_empty() {
            return Ok(());
        }
        self.sequence_mut(map, seqno)?.install.state = SequenceState::InstallPending;
        for rule in &rules {
            self.transact(rule, RuleOp::Delete);
        }
        let seq = self.sequence_mut(map, seqno)?;
        seq.install.rules.clear();
        seq.install.state = SequenceState::Eligible;
        Ok(())
    }

    /// Uninstall the rules a sequence holds for one interface.
    fn uninstall_interface_rules(&mut self, map: &str, seqno: u32, ifname: &str) -> Result<()> {
        let targets: Vec<KernelRule> = {
            let seq = self.sequence_ref(map, seqno)?;
            seq.install
                .rules
                .iter()
                .filter(|r| r.ifname.as_deref() == Some(ifname))
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            return Ok(());
        }
        for rule in &targets {
            self.transact(rule, RuleOp::Delete);
        }
        let seq = self.sequence_mut(map, seqno)?;
        seq.install
            .rules
            .retain(|r| r.ifname.as_deref() != Some(ifname));
        if seq.install.rules.is_empty() && seq.install.state == SequenceState::Installed {
            seq.install.state = SequenceState::Eligible;
        }
        Ok(())
    }

    /// One blocking kernel transaction. Returns whether the kernel
    /// acknowledged it.
    fn transact(&mut self, rule: &KernelRule, op: RuleOp) -> bool {
        let request = match codec::encode_request(rule, op) {
            Ok(request) => request,
            Err(e) => {
                warn!(rule = %rule, error = %e, "failed to encode rule request");
                return false;
            }
        };
        match self.channel.send_and_await_ack(&request) {
            Ok(()) => {
                debug!(op = ?op, rule = %rule, "kernel acknowledged rule transaction");
                true
            }
            Err(e) => {
                warn!(op = ?op, rule = %rule, error = %e, "rule transaction failed");
                false
            }
        }
    }

    // --- reconciliation ---

    /// Feed a decoded kernel notification into the model. Adds are of
    /// no interest; deletes of our own rules are reasserted.
    pub fn handle_notification(&mut self, op: RuleOp, rule: KernelRule) -> Result<()> {
        match op {
            RuleOp::Add => {
                trace!(rule = %rule, "rule add notification ignored");
                Ok(())
            }
            RuleOp::Delete => self.handle_rule_delete(rule),
        }
    }

    /// A rule disappeared from the kernel out-of-band. If it matches a
    /// tuple this daemon installed, clear it and reassert the declared
    /// state; otherwise drop the event.
    #[instrument(skip(self, rule))]
    pub fn handle_rule_delete(&mut self, rule: KernelRule) -> Result<()> {
        let owner = self.maps.values().find_map(|m| {
            m.sequences
                .values()
                .find(|s| s.install().rules.contains(&rule))
                .map(|s| (m.name().to_string(), s.seqno()))
        });
        let Some((map, seqno)) = owner else {
            trace!(rule = %rule, "kernel rule delete matches no installed sequence, ignoring");
            return Ok(());
        };

        info!(map = %map, seqno, rule = %rule, "kernel removed an installed rule, reasserting");
        {
            let seq = self.sequence_mut(&map, seqno)?;
            seq.install.rules.retain(|r| r != &rule);
            if seq.install.state == SequenceState::Installed {
                seq.install.state = SequenceState::Eligible;
            }
        }
        self.check_sequence(&map, seqno)
    }

    /// Read back pre-existing kernel rules.
    ///
    /// Startup reconciliation is not implemented: the daemon only
    /// reasserts rules it installed itself, driven by notifications.
    pub fn read_kernel_rules(&mut self) -> Result<Vec<KernelRule>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::RecordingChannel;
    use crate::types::{RULE_PRIORITY_BASE, INTERNAL_TABLE_BASE, VrfId};
    use pbr_types::Family;
    use pretty_assertions::assert_eq;

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// A sync instance with a couple of interfaces and groups known.
    fn test_sync() -> PbrSync<RecordingChannel> {
        let mut ctx = PbrContext::default();
        ctx.interfaces.register(VrfId::DEFAULT, "swp1", 3);
        ctx.interfaces.register(VrfId::DEFAULT, "swp2", 4);
        ctx.interfaces.register(VrfId::DEFAULT, "eth0", 10);
        ctx.nexthop_groups.register(
            "A",
            GroupInfo {
                table_id: 50,
                installed: 2,
            },
        );
        ctx.nexthop_groups.register(
            "B",
            GroupInfo {
                table_id: 300,
                installed: 1,
            },
        );
        PbrSync::new(ctx, RecordingChannel::new())
    }

    fn seq_status<'a>(
        sync: &'a PbrSync<RecordingChannel>,
        map: &str,
        seqno: u32,
    ) -> &'a crate::types::InstallStatus {
        sync.map(map).unwrap().sequence(seqno).unwrap().install()
    }

    #[test]
    fn test_install_on_becoming_eligible() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        assert!(sync.channel().is_empty());

        sync.set_nexthop_group("M", 10, "A").unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        let (op, rule) = &txns[0];
        assert_eq!(*op, RuleOp::Add);
        assert_eq!(rule.priority, RULE_PRIORITY_BASE + 10);
        assert_eq!(rule.src, Some(prefix("10.0.0.0/24")));
        assert_eq!(rule.table, 50);
        assert_eq!(rule.ifname, None);

        let status = seq_status(&sync, "M", 10);
        assert!(status.installed());
        assert_eq!(status.unique, 1);
        assert_eq!(status.nhs_installed, 2);
        assert_eq!(status.reason, None);
        assert!(sync.map_valid("M"));
    }

    #[test]
    fn test_same_prefix_twice_is_noop() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        let sent = sync.channel().len();

        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        assert_eq!(sync.channel().len(), sent);
    }

    #[test]
    fn test_changed_prefix_reinstalls() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.channel_mut().clear();

        sync.set_match_src("M", 10, Some(prefix("10.1.0.0/24"))).unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].0, RuleOp::Delete);
        assert_eq!(txns[0].1.src, Some(prefix("10.0.0.0/24")));
        assert_eq!(txns[1].0, RuleOp::Add);
        assert_eq!(txns[1].1.src, Some(prefix("10.1.0.0/24")));
    }

    #[test]
    fn test_unique_survives_reinstall() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        let unique = seq_status(&sync, "M", 10).unique;

        sync.set_match_src("M", 10, Some(prefix("10.1.0.0/24"))).unwrap();
        assert_eq!(seq_status(&sync, "M", 10).unique, unique);
    }

    #[test]
    fn test_family_follows_newest_clause() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        assert!(seq_status(&sync, "M", 10).installed());
        sync.channel_mut().clear();

        // A v6 dst flips the family and conflicts with the v4 src.
        sync.set_match_dst("M", 10, Some(prefix("2001:db8::/64"))).unwrap();
        let seq = sync.map("M").unwrap().sequence(10).unwrap();
        assert_eq!(seq.family(), Some(Family::Ipv6));
        let status = seq.install();
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::FamilyConflict));

        // The installed v4 rule was withdrawn.
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].0, RuleOp::Delete);
        assert_eq!(txns[0].1.family, Family::Ipv4);
    }

    #[test]
    fn test_group_rejected_while_nexthop_present() {
        let mut sync = test_sync();
        sync.set_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None).unwrap();

        let err = sync.set_nexthop_group("M", 10, "A").unwrap_err();
        assert!(matches!(err, PbrError::NexthopConfigured));
        // State untouched.
        let seq = sync.map("M").unwrap().sequence(10).unwrap();
        assert!(matches!(seq.action(), Some(SequenceAction::Nexthop(_))));
    }

    #[test]
    fn test_nexthop_rejected_while_group_present() {
        let mut sync = test_sync();
        sync.set_nexthop_group("M", 10, "A").unwrap();

        let err = sync
            .set_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None)
            .unwrap_err();
        assert!(matches!(err, PbrError::GroupConfigured(g) if g == "A"));
        let seq = sync.map("M").unwrap().sequence(10).unwrap();
        assert!(matches!(seq.action(), Some(SequenceAction::Group(g)) if g == "A"));
    }

    #[test]
    fn test_rebinding_group_requires_removal() {
        let mut sync = test_sync();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        // Same name again is a no-op success.
        sync.set_nexthop_group("M", 10, "A").unwrap();
        // A different name is rejected.
        let err = sync.set_nexthop_group("M", 10, "B").unwrap_err();
        assert!(matches!(err, PbrError::GroupConfigured(g) if g == "A"));
    }

    #[test]
    fn test_clear_group_requires_matching_name() {
        let mut sync = test_sync();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        let err = sync.clear_nexthop_group("M", 10, "B").unwrap_err();
        assert!(matches!(err, PbrError::GroupMismatch(g) if g == "B"));
        sync.clear_nexthop_group("M", 10, "A").unwrap();
        assert_eq!(sync.map("M").unwrap().sequence(10).unwrap().action(), None);
    }

    #[test]
    fn test_inline_nexthop_install_and_dedup() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None).unwrap();

        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].0, RuleOp::Add);
        assert_eq!(txns[0].1.table, INTERNAL_TABLE_BASE);
        assert!(seq_status(&sync, "M", 10).installed());

        // Exact duplicate is a no-op.
        let sent = sync.channel().len();
        sync.set_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None).unwrap();
        assert_eq!(sync.channel().len(), sent);

        // A second distinct nexthop is rejected.
        let err = sync
            .set_nexthop("M", 10, addr("192.0.2.2"), Some("eth0"), None)
            .unwrap_err();
        assert!(matches!(err, PbrError::UseNexthopGroup));
    }

    #[test]
    fn test_remove_nexthop_must_match() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None).unwrap();

        let err = sync
            .remove_nexthop("M", 10, addr("192.0.2.9"), Some("eth0"), None)
            .unwrap_err();
        assert!(matches!(err, PbrError::NexthopMismatch));

        sync.channel_mut().clear();
        sync.remove_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None).unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].0, RuleOp::Delete);
        let status = seq_status(&sync, "M", 10);
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::NoAction));

        // Removing again: nothing left to delete.
        let err = sync
            .remove_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), None)
            .unwrap_err();
        assert!(matches!(err, PbrError::NoNexthops));
    }

    #[test]
    fn test_nexthop_resolution_failures() {
        let mut sync = test_sync();
        let err = sync
            .set_nexthop("M", 10, addr("192.0.2.1"), Some("eth0"), Some("blue"))
            .unwrap_err();
        assert!(matches!(err, PbrError::VrfNotFound(v) if v == "blue"));

        let err = sync
            .set_nexthop("M", 10, addr("192.0.2.1"), Some("eth9"), None)
            .unwrap_err();
        assert!(matches!(err, PbrError::InterfaceNotFound { ifname, .. } if ifname == "eth9"));

        // Neither attempt configured an action or shipped a rule.
        assert_eq!(sync.map("M").unwrap().sequence(10).unwrap().action(), None);
        assert!(sync.channel().is_empty());
    }

    #[test]
    fn test_unresolved_group_deferred_until_registered() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "later").unwrap();

        let status = seq_status(&sync, "M", 10);
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::UnresolvedGroup));
        assert!(sync.channel().is_empty());

        sync.register_group(
            "later",
            GroupInfo {
                table_id: 77,
                installed: 1,
            },
        )
        .unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].1.table, 77);
        assert!(seq_status(&sync, "M", 10).installed());

        // Losing the group uninstalls again.
        sync.unregister_group("later").unwrap();
        let status = seq_status(&sync, "M", 10);
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::UnresolvedGroup));
    }

    #[test]
    fn test_bind_moves_rule_onto_interface() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.channel_mut().clear();

        sync.bind_policy("swp1", "M").unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].0, RuleOp::Delete);
        assert_eq!(txns[0].1.ifname, None);
        assert_eq!(txns[1].0, RuleOp::Add);
        assert_eq!(txns[1].1.ifname.as_deref(), Some("swp1"));

        let binding = sync.bindings().next().unwrap();
        assert_eq!(binding.ifname(), "swp1");
        assert_eq!(binding.policy(), Some("M"));
    }

    #[test]
    fn test_rebind_uninstalls_old_map_first() {
        let mut sync = test_sync();
        sync.set_match_src("MA", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("MA", 10, "A").unwrap();
        sync.set_match_src("MB", 10, Some(prefix("10.9.0.0/24"))).unwrap();
        sync.set_nexthop_group("MB", 10, "B").unwrap();
        sync.bind_policy("swp1", "MA").unwrap();
        sync.channel_mut().clear();

        sync.bind_policy("swp1", "MB").unwrap();
        let txns = sync.channel().transactions();

        // Every uninstall of MA's swp1 rule happens before any
        // install under MB.
        let last_del_a = txns
            .iter()
            .rposition(|(op, r)| {
                *op == RuleOp::Delete && r.table == 50 && r.ifname.as_deref() == Some("swp1")
            })
            .expect("old rule removed");
        let first_add_b = txns
            .iter()
            .position(|(op, r)| *op == RuleOp::Add && r.table == 300)
            .expect("new rule installed");
        assert!(last_del_a < first_add_b);

        // MB's rule rides on swp1 now.
        assert_eq!(txns[first_add_b].1.ifname.as_deref(), Some("swp1"));

        let binding = sync.bindings().next().unwrap();
        assert_eq!(binding.policy(), Some("MB"));
    }

    #[test]
    fn test_unbind_unknown_map_is_noop() {
        let mut sync = test_sync();
        sync.bind_policy("swp1", "M").unwrap();
        sync.unbind_policy("swp1", "other").unwrap();
        assert_eq!(sync.bindings().next().unwrap().policy(), Some("M"));
    }

    #[test]
    fn test_kernel_delete_notification_reinstalls_once() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.bind_policy("swp1", "M").unwrap();
        sync.channel_mut().clear();

        let installed = seq_status(&sync, "M", 10).rules[0].clone();
        sync.handle_notification(RuleOp::Delete, installed.clone()).unwrap();

        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].0, RuleOp::Add);
        assert_eq!(txns[0].1, installed);
        assert!(seq_status(&sync, "M", 10).installed());
    }

    #[test]
    fn test_unmatched_notification_is_dropped() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.channel_mut().clear();

        let foreign = KernelRule {
            family: Family::Ipv4,
            priority: 9999,
            ifname: Some("swp1".to_string()),
            src: None,
            dst: None,
            filter: crate::types::RuleFilter::default(),
            table: 11,
        };
        sync.handle_notification(RuleOp::Delete, foreign).unwrap();
        assert!(sync.channel().is_empty());
    }

    #[test]
    fn test_add_notification_ignored() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.channel_mut().clear();

        let installed = seq_status(&sync, "M", 10).rules[0].clone();
        sync.handle_notification(RuleOp::Add, installed).unwrap();
        assert!(sync.channel().is_empty());
    }

    #[test]
    fn test_kernel_rejection_recorded_not_retried() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.channel_mut().fail_next();
        sync.set_nexthop_group("M", 10, "A").unwrap();

        let status = seq_status(&sync, "M", 10);
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::KernelRejected));
        assert!(status.rules.is_empty());
        // Exactly the one failed attempt, no automatic retry.
        assert_eq!(sync.channel().len(), 1);

        // A later explicit re-check re-attempts and succeeds.
        sync.check_sequence("M", 10).unwrap();
        assert!(seq_status(&sync, "M", 10).installed());
        assert_eq!(sync.channel().len(), 2);
    }

    #[test]
    fn test_clearing_match_uninstalls_with_reason() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.channel_mut().clear();

        sync.set_match_src("M", 10, None).unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].0, RuleOp::Delete);
        let status = seq_status(&sync, "M", 10);
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::NoMatch));
        assert!(!sync.map_valid("M"));
    }

    #[test]
    fn test_delete_map_uninstalls_and_destroys() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.set_match_src("M", 20, Some(prefix("10.2.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 20, "B").unwrap();
        sync.channel_mut().clear();

        sync.delete_map("M", None).unwrap();
        let txns = sync.channel().transactions();
        assert_eq!(txns.len(), 2);
        assert!(txns.iter().all(|(op, _)| *op == RuleOp::Delete));
        assert!(sync.map("M").is_none());
    }

    #[test]
    fn test_delete_single_sequence_keeps_map() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_match_src("M", 20, Some(prefix("10.2.0.0/24"))).unwrap();

        sync.delete_map("M", Some(10)).unwrap();
        let map = sync.map("M").unwrap();
        assert!(map.sequence(10).is_none());
        assert!(map.sequence(20).is_some());
    }

    #[test]
    fn test_bound_map_survives_sequence_deletion() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.bind_policy("swp1", "M").unwrap();

        sync.delete_map("M", None).unwrap();
        // Still referenced by the binding; the empty map remains.
        assert!(sync.map("M").is_some());

        sync.unbind_policy("swp1", "M").unwrap();
        assert!(sync.map("M").is_none());
    }

    #[test]
    fn test_interface_loss_uninstalls_bound_map() {
        let mut sync = test_sync();
        sync.set_match_src("M", 10, Some(prefix("10.0.0.0/24"))).unwrap();
        sync.set_nexthop_group("M", 10, "A").unwrap();
        sync.bind_policy("swp1", "M").unwrap();
        sync.channel_mut().clear();

        sync.unregister_interface(VrfId::DEFAULT, "swp1").unwrap();
        let status = seq_status(&sync, "M", 10);
        assert!(!status.installed());
        assert_eq!(status.reason, Some(SkipReason::InterfaceMissing));

        sync.register_interface(VrfId::DEFAULT, "swp1", 3).unwrap();
        assert!(seq_status(&sync, "M", 10).installed());
    }

    #[test]
    fn test_invalid_seqno_rejected() {
        let mut sync = test_sync();
        let err = sync.set_match_src("M", 0, Some(prefix("10.0.0.0/24"))).unwrap_err();
        assert!(matches!(err, PbrError::InvalidSeqno(0)));
        let err = sync.ensure_sequence("M", 70000).unwrap_err();
        assert!(matches!(err, PbrError::InvalidSeqno(70000)));
        assert!(sync.map("M").is_none());
    }

    #[test]
    fn test_read_kernel_rules_stub() {
        let mut sync = test_sync();
        assert!(sync.read_kernel_rules().unwrap().is_empty());
    }
}
