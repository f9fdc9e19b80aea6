//! Address-family dispatch.
//!
//! Each supported family registers one `FamilyOps` implementation and one
//! table at startup. Table operations hash and compare candidate groups
//! through the family's ops instead of hardcoding IPv4/IPv6 logic.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{NextHopError, Result};
use crate::group::{NextHopGroup, RouteProtocol};
use crate::nexthop::NextHop;
use crate::table::NextHopTable;

/// Supported address families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Family of an address.
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// Lookup key for a candidate group: members, length and protocol.
#[derive(Debug, Clone, Copy)]
pub struct GroupKey<'a> {
    pub members: &'a [NextHop],
    pub protocol: RouteProtocol,
}

/// Per-family hash and compare operations.
///
/// Equality is structural and order-sensitive over the full member sequence,
/// including route flags and labels. Neighbor resolution state is not part
/// of a group's identity: a resolved copy of a group still matches the
/// unresolved candidate a new route builds.
pub trait FamilyOps: Send + Sync + fmt::Debug {
    fn family(&self) -> AddressFamily;

    /// Whether `gateway` can appear in this family's table.
    fn owns_gateway(&self, gateway: IpAddr) -> bool;

    /// Feed `key` into `state`.
    fn hash(&self, key: &GroupKey<'_>, state: &mut dyn Hasher);

    /// Whether `group` holds exactly the members and protocol of `key`.
    fn equal(&self, group: &NextHopGroup, key: &GroupKey<'_>) -> bool {
        group.protocol() == key.protocol
            && group.sibling_count() == key.members.len()
            && group
                .members()
                .iter()
                .zip(key.members)
                .all(|(a, b)| same_action(a, b))
    }
}

/// Hop equality without neighbor state: same egress, route flags, labels and
/// gateway.
fn same_action(a: &NextHop, b: &NextHop) -> bool {
    a.interface() == b.interface()
        && a.flags().route_flags() == b.flags().route_flags()
        && a.labels() == b.labels()
        && a.gateway() == b.gateway()
}

fn hash_common(
    key: &GroupKey<'_>,
    mut state: &mut dyn Hasher,
    gateway: impl Fn(&NextHop, &mut dyn Hasher),
) {
    state.write_u8(key.protocol.0);
    state.write_usize(key.members.len());
    for nh in key.members {
        nh.interface().map(|i| i.if_index()).hash(&mut state);
        state.write_u32(nh.flags().route_flags().bits());
        match nh.labels() {
            Some(labels) => labels.as_slice().hash(&mut state),
            None => state.write_u8(0),
        }
        gateway(nh, &mut *state);
    }
}

/// IPv4 operations.
#[derive(Debug, Default)]
pub struct Inet;

impl FamilyOps for Inet {
    fn family(&self) -> AddressFamily {
        AddressFamily::Inet
    }

    fn owns_gateway(&self, gateway: IpAddr) -> bool {
        gateway.is_ipv4()
    }

    fn hash(&self, key: &GroupKey<'_>, state: &mut dyn Hasher) {
        hash_common(key, state, |nh, state| match nh.gateway() {
            Some(IpAddr::V4(gw)) => state.write_u32(u32::from(gw)),
            _ => state.write_u32(0),
        });
    }
}

/// IPv6 operations.
#[derive(Debug, Default)]
pub struct Inet6;

impl FamilyOps for Inet6 {
    fn family(&self) -> AddressFamily {
        AddressFamily::Inet6
    }

    fn owns_gateway(&self, gateway: IpAddr) -> bool {
        gateway.is_ipv6()
    }

    fn hash(&self, key: &GroupKey<'_>, state: &mut dyn Hasher) {
        hash_common(key, state, |nh, state| match nh.gateway() {
            Some(IpAddr::V6(gw)) => state.write_u128(u128::from(gw)),
            _ => state.write_u128(0),
        });
    }
}

/// One table per registered family.
///
/// Registration happens once at startup, before any table operation for
/// the family.
#[derive(Debug, Default)]
pub struct FamilyRegistry {
    inet: OnceLock<Arc<NextHopTable>>,
    inet6: OnceLock<Arc<NextHopTable>>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, family: AddressFamily) -> &OnceLock<Arc<NextHopTable>> {
        match family {
            AddressFamily::Inet => &self.inet,
            AddressFamily::Inet6 => &self.inet6,
        }
    }

    /// Install `table` for its family.
    pub fn register(&self, table: NextHopTable) -> Result<Arc<NextHopTable>> {
        let family = table.family();
        let capacity = table.capacity();
        let table = Arc::new(table);
        self.cell(family)
            .set(Arc::clone(&table))
            .map_err(|_| NextHopError::FamilyAlreadyRegistered(family))?;
        info!(%family, capacity, "Registered next-hop table");
        Ok(table)
    }

    /// Table for `family`.
    pub fn table(&self, family: AddressFamily) -> Result<&Arc<NextHopTable>> {
        self.cell(family)
            .get()
            .ok_or(NextHopError::FamilyNotRegistered(family))
    }

    pub fn is_registered(&self, family: AddressFamily) -> bool {
        self.cell(family).get().is_some()
    }
}
