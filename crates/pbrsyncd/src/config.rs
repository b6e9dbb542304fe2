//! Declarative startup configuration.
//!
//! The daemon loads a JSON file at startup describing registry
//! fixtures (VRFs, interfaces, nexthop-groups) and the declared policy
//! (maps, sequences, interface bindings), and replays it through the
//! normal mutation path. `capture` renders the running policy back
//! into the same shape, in ascending (map, seqno) order.
//!
//! File format:
//! ```json
//! {
//!   "nexthop_groups": [
//!     { "name": "spine", "table_id": 50, "installed": 2 }
//!   ],
//!   "maps": [
//!     {
//!       "name": "EAST",
//!       "sequences": [
//!         { "seqno": 10, "src": "10.0.0.0/24", "nexthop_group": "spine" }
//!       ]
//!     }
//!   ],
//!   "policies": [
//!     { "interface": "swp1", "map": "EAST" }
//!   ]
//! }
//! ```

use crate::error::{PbrError, Result};
use crate::kernel::RuleChannel;
use crate::pbr_sync::PbrSync;
use crate::registry::{GroupInfo, DEFAULT_VRF_NAME};
use crate::types::{SequenceAction, VrfId};
use pbr_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PbrConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vrfs: Vec<VrfConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nexthop_groups: Vec<GroupConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maps: Vec<MapConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VrfConfig {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub ifindex: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub table_id: u32,
    #[serde(default)]
    pub installed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    pub name: String,
    #[serde(default)]
    pub sequences: Vec<SequenceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub seqno: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<IpPrefix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<IpPrefix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexthop_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexthop: Option<NexthopConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NexthopConfig {
    pub gateway: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub interface: String,
    pub map: String,
}

impl PbrConfig {
    /// Parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| PbrError::Config(format!("failed to open {}: {}", path.display(), e)))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PbrError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Replay the configuration through the normal mutation path:
    /// registries first, then maps in file order, then bindings.
    pub fn apply<C: RuleChannel>(&self, sync: &mut PbrSync<C>) -> Result<()> {
        for vrf in &self.vrfs {
            sync.register_vrf(&vrf.name, VrfId(vrf.id));
        }
        for intf in &self.interfaces {
            let vrf_id = match &intf.vrf {
                Some(name) => sync
                    .context()
                    .vrfs
                    .resolve(name)
                    .ok_or_else(|| PbrError::VrfNotFound(name.clone()))?,
                None => VrfId::DEFAULT,
            };
            sync.register_interface(vrf_id, &intf.name, intf.ifindex)?;
        }
        for group in &self.nexthop_groups {
            sync.register_group(
                &group.name,
                GroupInfo {
                    table_id: group.table_id,
                    installed: group.installed,
                },
            )?;
        }
        for map in &self.maps {
            for seq in &map.sequences {
                sync.ensure_sequence(&map.name, seq.seqno)?;
                if let Some(src) = seq.src {
                    sync.set_match_src(&map.name, seq.seqno, Some(src))?;
                }
                if let Some(dst) = seq.dst {
                    sync.set_match_dst(&map.name, seq.seqno, Some(dst))?;
                }
                if let Some(group) = &seq.nexthop_group {
                    sync.set_nexthop_group(&map.name, seq.seqno, group)?;
                }
                if let Some(nh) = &seq.nexthop {
                    sync.set_nexthop(
                        &map.name,
                        seq.seqno,
                        nh.gateway,
                        nh.interface.as_deref(),
                        nh.vrf.as_deref(),
                    )?;
                }
            }
        }
        for policy in &self.policies {
            sync.bind_policy(&policy.interface, &policy.map)?;
        }
        info!(
            maps = self.maps.len(),
            policies = self.policies.len(),
            "applied startup configuration"
        );
        Ok(())
    }

    /// Snapshot the running policy as replayable configuration.
    /// Registry fixtures are external inventory and are not captured.
    pub fn capture<C: RuleChannel>(sync: &PbrSync<C>) -> Self {
        let maps = sync
            .maps()
            .map(|m| MapConfig {
                name: m.name().to_string(),
                sequences: m
                    .sequences()
                    .map(|s| SequenceConfig {
                        seqno: s.seqno(),
                        src: s.src().copied(),
                        dst: s.dst().copied(),
                        nexthop_group: match s.action() {
                            Some(SequenceAction::Group(g)) => Some(g.clone()),
                            _ => None,
                        },
                        nexthop: match s.action() {
                            Some(SequenceAction::Nexthop(nh)) => Some(NexthopConfig {
                                gateway: nh.gateway,
                                interface: nh.ifname.clone(),
                                vrf: sync
                                    .context()
                                    .vrfs
                                    .name_of(nh.vrf)
                                    .filter(|name| *name != DEFAULT_VRF_NAME)
                                    .map(str::to_string),
                            }),
                            _ => None,
                        },
                    })
                    .collect(),
            })
            .collect();

        let policies = sync
            .bindings()
            .filter_map(|binding| {
                binding.policy().map(|map| PolicyConfig {
                    interface: binding.ifname().to_string(),
                    map: map.to_string(),
                })
            })
            .collect();

        PbrConfig {
            vrfs: Vec::new(),
            interfaces: Vec::new(),
            nexthop_groups: Vec::new(),
            maps,
            policies,
        }
    }
}
