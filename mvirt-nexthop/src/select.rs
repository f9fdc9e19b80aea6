//! Multipath member selection.
//!
//! Selection is `members[hash % n]`. The same flow hash against the same
//! group always picks the same member; nothing here is stateful.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;

use crate::group::NextHopGroup;
use crate::nexthop::NextHop;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_MPLS: u16 = 0x8847;

/// Packet fields that feed the flow hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowFields {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    /// Top label of an MPLS packet.
    pub mpls_label: Option<u32>,
}

impl FlowFields {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        FlowFields {
            src,
            dst,
            protocol: 0,
            src_port: 0,
            dst_port: 0,
            mpls_label: None,
        }
    }

    pub fn with_ports(mut self, protocol: u8, src_port: u16, dst_port: u16) -> Self {
        self.protocol = protocol;
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn with_label(mut self, label: u32) -> Self {
        self.mpls_label = Some(label);
        self
    }
}

/// Flow hash for a packet of `ether_type`.
///
/// IP packets hash their 5-tuple, MPLS packets the top label plus the inner
/// addresses. Anything else hashes to 0 and always takes the same member.
pub fn flow_hash(flow: &FlowFields, ether_type: u16) -> u32 {
    // Fixed keys, so the hash is stable for the life of the process.
    let mut hasher = DefaultHasher::new();
    match ether_type {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
            (flow.src, flow.dst, flow.protocol, flow.src_port, flow.dst_port).hash(&mut hasher);
        }
        ETHERTYPE_MPLS => {
            (flow.mpls_label, flow.src, flow.dst).hash(&mut hasher);
        }
        _ => return 0,
    }
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Member of `group` for `flow_hash`.
pub fn select(group: &NextHopGroup, flow_hash: u32) -> &NextHop {
    select_from(group.members(), flow_hash, 0)
}

/// Member of `members` for `flow_hash`, considering at most `max_paths`
/// members (0 means all).
///
/// A `DEAD` pick falls back to the first live member; when every candidate
/// is dead the hashed member is returned anyway.
///
/// # Panics
/// Panics on an empty slice. Published groups are never empty.
pub fn select_from(members: &[NextHop], flow_hash: u32, max_paths: usize) -> &NextHop {
    if let [only] = members {
        return only;
    }

    let candidates = match max_paths {
        0 => members,
        n => &members[..n.min(members.len())],
    };
    let chosen = &candidates[flow_hash as usize % candidates.len()];
    if !chosen.is_dead() {
        return chosen;
    }
    candidates
        .iter()
        .find(|nh| !nh.is_dead())
        .unwrap_or(chosen)
}
