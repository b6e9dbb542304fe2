//! Resolver registries consumed by the policy model.
//!
//! Nexthop-group lifecycle, interface and VRF inventories are owned by
//! other subsystems; the policy model only needs name lookups. The
//! registries are explicit owned containers bundled in a [`PbrContext`]
//! that is passed through the model, so tests can run parallel
//! deterministic instances without ambient global state.

use crate::types::{VrfId, INTERNAL_TABLE_BASE};
use std::collections::HashMap;

/// Resolved state of a nexthop-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Routing table the group's nexthops are installed into.
    pub table_id: u32,
    /// How many of the group's nexthops are installed.
    pub installed: u32,
}

/// Name -> table/installed-count lookup for nexthop-groups.
///
/// Externally managed groups are registered by the surrounding
/// daemon; internal single-nexthop groups are synthesized here for
/// inline `set nexthop` entries, with table ids allocated from
/// [`INTERNAL_TABLE_BASE`].
#[derive(Debug)]
pub struct NexthopGroupRegistry {
    groups: HashMap<String, GroupInfo>,
    next_internal_table: u32,
}

impl NexthopGroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            next_internal_table: INTERNAL_TABLE_BASE,
        }
    }

    /// Register (or update) an externally managed group.
    pub fn register(&mut self, name: &str, info: GroupInfo) {
        self.groups.insert(name.to_string(), info);
    }

    /// Remove a group; returns its last known state.
    pub fn unregister(&mut self, name: &str) -> Option<GroupInfo> {
        self.groups.remove(name)
    }

    /// Resolve a group name.
    pub fn resolve(&self, name: &str) -> Option<GroupInfo> {
        self.groups.get(name).copied()
    }

    /// Register an internal group for an inline nexthop, allocating a
    /// table id for it. Re-registering an existing name keeps its
    /// table.
    pub fn register_internal(&mut self, name: &str) -> GroupInfo {
        if let Some(info) = self.groups.get(name) {
            return *info;
        }
        let info = GroupInfo {
            table_id: self.next_internal_table,
            installed: 1,
        };
        self.next_internal_table += 1;
        self.groups.insert(name.to_string(), info);
        info
    }

    /// Drop an internal group when its inline nexthop is removed.
    pub fn release_internal(&mut self, name: &str) {
        self.groups.remove(name);
    }

    /// Update the installed-nexthop count of a known group.
    pub fn set_installed(&mut self, name: &str, installed: u32) {
        if let Some(info) = self.groups.get_mut(name) {
            info.installed = installed;
        }
    }
}

impl Default for NexthopGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-VRF interface name -> ifindex lookup.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    interfaces: HashMap<(VrfId, String), u32>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, vrf: VrfId, name: &str, ifindex: u32) {
        self.interfaces.insert((vrf, name.to_string()), ifindex);
    }

    pub fn unregister(&mut self, vrf: VrfId, name: &str) {
        self.interfaces.remove(&(vrf, name.to_string()));
    }

    /// Resolve an interface name within a VRF.
    pub fn resolve(&self, vrf: VrfId, name: &str) -> Option<u32> {
        self.interfaces.get(&(vrf, name.to_string())).copied()
    }

    /// Whether the name is a known local interface in any VRF. Used by
    /// the notification interest filter.
    pub fn is_known(&self, name: &str) -> bool {
        self.interfaces.keys().any(|(_, n)| n == name)
    }

    /// Load the system's interface inventory into the default VRF.
    #[cfg(target_os = "linux")]
    pub fn populate_from_system(&mut self) -> crate::error::Result<usize> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| crate::error::PbrError::Netlink(format!("getifaddrs: {}", e)))?;
        let mut count = 0;
        for ifaddr in addrs {
            if self.is_known(&ifaddr.interface_name) {
                continue;
            }
            if let Ok(ifindex) = nix::net::if_::if_nametoindex(ifaddr.interface_name.as_str()) {
                self.register(VrfId::DEFAULT, &ifaddr.interface_name, ifindex);
                count += 1;
            }
        }
        Ok(count)
    }
}

/// VRF name -> id lookup. The default VRF is always present.
#[derive(Debug)]
pub struct VrfRegistry {
    vrfs: HashMap<String, VrfId>,
}

/// Name of the always-present default VRF.
pub const DEFAULT_VRF_NAME: &str = "default";

impl VrfRegistry {
    pub fn new() -> Self {
        let mut vrfs = HashMap::new();
        vrfs.insert(DEFAULT_VRF_NAME.to_string(), VrfId::DEFAULT);
        Self { vrfs }
    }

    pub fn register(&mut self, name: &str, id: VrfId) {
        self.vrfs.insert(name.to_string(), id);
    }

    pub fn unregister(&mut self, name: &str) {
        if name != DEFAULT_VRF_NAME {
            self.vrfs.remove(name);
        }
    }

    pub fn resolve(&self, name: &str) -> Option<VrfId> {
        self.vrfs.get(name).copied()
    }

    /// Reverse lookup, for rendering captured configuration.
    pub fn name_of(&self, id: VrfId) -> Option<&str> {
        self.vrfs
            .iter()
            .find(|(_, vrf_id)| **vrf_id == id)
            .map(|(name, _)| name.as_str())
    }
}

impl Default for VrfRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The resolver context handed through the policy model.
#[derive(Debug, Default)]
pub struct PbrContext {
    pub nexthop_groups: NexthopGroupRegistry,
    pub interfaces: InterfaceRegistry,
    pub vrfs: VrfRegistry,
}
