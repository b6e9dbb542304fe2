//! Netlink wire codec for kernel FIB rules.
//!
//! Stateless translation between [`KernelRule`] descriptors and
//! route-netlink messages. Field layout follows the kernel's
//! `fib_rule_hdr` contract: the priority attribute is always present,
//! the interface-name attribute only when the rule is bound to an
//! interface, source/destination attributes only for active filter
//! fields (4-byte IPv4 / 16-byte IPv6 addresses, never mixed), and
//! table ids below 256 ride in the one-byte header field while larger
//! ids move to the extended table attribute.

use crate::error::{PbrError, Result};
use crate::registry::InterfaceRegistry;
use crate::types::{KernelRule, RuleFilter, RuleOp, RULE_TABLE_THRESHOLD};
use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use pbr_types::{Family, IpPrefix};
use tracing::{trace, warn};

fn address_family(family: Family) -> AddressFamily {
    match family {
        Family::Ipv4 => AddressFamily::Inet,
        Family::Ipv6 => AddressFamily::Inet6,
    }
}

/// Encode a rule install or removal request, ready to ship over the
/// kernel channel.
pub fn encode_request(rule: &KernelRule, op: RuleOp) -> Result<Vec<u8>> {
    let mut header = NetlinkHeader::default();
    header.flags = NLM_F_REQUEST | NLM_F_ACK;

    let mut msg = RuleMessage::default();
    msg.header.family = address_family(rule.family);
    msg.header.action = RuleAction::ToTable;

    msg.attributes.push(RuleAttribute::Priority(rule.priority));

    if let Some(ifname) = &rule.ifname {
        msg.attributes.push(RuleAttribute::Iifname(ifname.clone()));
    }

    if rule.filter.src {
        if let Some(src) = &rule.src {
            msg.header.src_len = src.prefix_len();
            msg.attributes.push(RuleAttribute::Source(src.address()));
        }
    }
    if rule.filter.dst {
        if let Some(dst) = &rule.dst {
            msg.header.dst_len = dst.prefix_len();
            msg.attributes
                .push(RuleAttribute::Destination(dst.address()));
        }
    }

    // The header reserves a single byte for the common table ids; the
    // extended attribute carries anything larger.
    if rule.table < RULE_TABLE_THRESHOLD {
        msg.header.table = rule.table as u8;
    } else {
        msg.header.table = 0;
        msg.attributes.push(RuleAttribute::Table(rule.table));
    }

    let payload = match op {
        RuleOp::Add => RouteNetlinkMessage::NewRule(msg),
        RuleOp::Delete => RouteNetlinkMessage::DelRule(msg),
    };

    let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
    packet.finalize();
    let mut buf = vec![0u8; packet.buffer_len()];
    packet.serialize(&mut buf);
    Ok(buf)
}

/// Rebuild a [`KernelRule`] from a parsed rule message. `None` when
/// the message is not a to-table IPv4/IPv6 rule or carries fields
/// inconsistent with its family.
fn rule_from_message(msg: &RuleMessage) -> Option<KernelRule> {
    let family = match msg.header.family {
        AddressFamily::Inet => Family::Ipv4,
        AddressFamily::Inet6 => Family::Ipv6,
        _ => return None,
    };
    if msg.header.action != RuleAction::ToTable {
        return None;
    }

    let mut priority = 0;
    let mut ifname = None;
    let mut src_addr = None;
    let mut dst_addr = None;
    let mut table_attr = None;

    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Priority(p) => priority = *p,
            RuleAttribute::Iifname(name) => ifname = Some(name.clone()),
            RuleAttribute::Source(addr) => src_addr = Some(*addr),
            RuleAttribute::Destination(addr) => dst_addr = Some(*addr),
            RuleAttribute::Table(t) => table_attr = Some(*t),
            _ => {}
        }
    }

    let src = match src_addr {
        Some(addr) => {
            let prefix = IpPrefix::new(addr, msg.header.src_len).ok()?;
            if prefix.family() != family {
                return None;
            }
            Some(prefix)
        }
        None => None,
    };
    let dst = match dst_addr {
        Some(addr) => {
            let prefix = IpPrefix::new(addr, msg.header.dst_len).ok()?;
            if prefix.family() != family {
                return None;
            }
            Some(prefix)
        }
        None => None,
    };

    Some(KernelRule {
        family,
        priority,
        ifname,
        src,
        dst,
        filter: RuleFilter {
            src: src.is_some(),
            dst: dst.is_some(),
        },
        table: table_attr.unwrap_or(msg.header.table as u32),
    })
}

/// Decode a single encoded request back into its operation and rule.
/// The exact inverse of [`encode_request`].
pub fn decode_request(buf: &[u8]) -> Result<(RuleOp, KernelRule)> {
    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(buf)
        .map_err(|e| PbrError::Netlink(format!("failed to parse rule request: {}", e)))?;
    let (op, rule_msg) = match &msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRule(r)) => (RuleOp::Add, r),
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRule(r)) => (RuleOp::Delete, r),
        _ => return Err(PbrError::Netlink("not a rule request".to_string())),
    };
    rule_from_message(rule_msg)
        .map(|rule| (op, rule))
        .ok_or_else(|| PbrError::Netlink("unrecognized rule message".to_string()))
}

/// Decode a notification buffer into the rule events this daemon
/// cares about.
///
/// A message survives the filter only when it is a rule add/delete for
/// IPv4 or IPv6 with a to-table action and names an interface known to
/// the registry; everything else is silently skipped. Rules without an
/// interface binding are of no interest here.
pub fn decode_notifications(
    buf: &[u8],
    len: usize,
    interfaces: &InterfaceRegistry,
) -> Vec<(RuleOp, KernelRule)> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < len {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to parse rule notification, dropping buffer");
                break;
            }
        };
        if msg.header.length == 0 {
            break;
        }

        offset += msg.header.length as usize;
        // Netlink messages are 4-byte aligned.
        offset = (offset + 3) & !3;

        let (op, rule_msg) = match &msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRule(r)) => (RuleOp::Add, r),
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRule(r)) => (RuleOp::Delete, r),
            _ => continue,
        };

        let Some(rule) = rule_from_message(rule_msg) else {
            continue;
        };

        // Rules not tied to a known local interface are ignored.
        let Some(ifname) = &rule.ifname else {
            trace!(priority = rule.priority, "rule notification without interface, ignoring");
            continue;
        };
        if !interfaces.is_known(ifname) {
            trace!(ifname = %ifname, "rule notification for unknown interface, ignoring");
            continue;
        }

        events.push((op, rule));
    }

    events
}

/// Interpret the kernel's response to a request sent with the ACK
/// flag: an error message with a zero code is the acknowledgement.
pub fn decode_ack(buf: &[u8]) -> Result<()> {
    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(buf)
        .map_err(|e| PbrError::Netlink(format!("failed to parse rule response: {}", e)))?;
    match msg.payload {
        NetlinkPayload::Error(err) => match err.code {
            None => Ok(()),
            Some(code) => Err(PbrError::Netlink(format!(
                "kernel rejected rule (errno {})",
                code
            ))),
        },
        _ => Err(PbrError::Netlink(
            "unexpected response to rule request".to_string(),
        )),
    }
}
