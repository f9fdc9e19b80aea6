//! Next-hop groups: the shared, deduplicated unit routes point at.
//!
//! A group is immutable once published in a table slot, apart from its
//! reference count and hardware state. Changing members means building a
//! new group and swapping it in.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::OffloadError;
use crate::nexthop::{InterfaceRef, NeighState, NextHop};

/// Routing protocol that installed the routes sharing a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RouteProtocol(pub u8);

impl RouteProtocol {
    pub const KERNEL: Self = RouteProtocol(2);
    pub const STATIC: Self = RouteProtocol(4);
    pub const BGP: Self = RouteProtocol(186);
    pub const OSPF: Self = RouteProtocol(188);
}

/// Hardware programming state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgrammedState {
    #[default]
    Pending,
    Programmed,
    Error,
}

/// Opaque object handle handed out by the offload collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HwHandle(pub u64);

/// Handles for a programmed group and each of its members, in member order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareHandles {
    pub group: HwHandle,
    pub members: Vec<HwHandle>,
}

/// Programming state plus handles.
///
/// `Programmed` always carries one member handle per sibling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareState {
    state: ProgrammedState,
    handles: Option<HardwareHandles>,
}

impl HardwareState {
    pub fn pending() -> Self {
        HardwareState::default()
    }

    /// Programmed state for a group with `siblings` members.
    pub fn programmed(
        handles: HardwareHandles,
        siblings: usize,
    ) -> Result<Self, OffloadError> {
        if handles.members.len() != siblings {
            return Err(OffloadError::MemberCountMismatch {
                expected: siblings,
                actual: handles.members.len(),
            });
        }
        Ok(HardwareState {
            state: ProgrammedState::Programmed,
            handles: Some(handles),
        })
    }

    pub fn error() -> Self {
        HardwareState {
            state: ProgrammedState::Error,
            handles: None,
        }
    }

    pub fn state(&self) -> ProgrammedState {
        self.state
    }

    pub fn handles(&self) -> Option<&HardwareHandles> {
        self.handles.as_ref()
    }
}

/// Member storage. A singleton keeps its hop inline.
#[derive(Debug)]
enum Members {
    Single(NextHop),
    Multi(Box<[NextHop]>),
}

impl Members {
    fn from_vec(mut hops: Vec<NextHop>) -> Self {
        if hops.len() == 1
            && let Some(hop) = hops.pop()
        {
            return Members::Single(hop);
        }
        Members::Multi(hops.into_boxed_slice())
    }

    fn as_slice(&self) -> &[NextHop] {
        match self {
            Members::Single(hop) => std::slice::from_ref(hop),
            Members::Multi(hops) => hops,
        }
    }
}

/// An ordered set of next hops (one path or an ECMP set) shared by routes.
#[derive(Debug)]
pub struct NextHopGroup {
    members: Members,
    protocol: RouteProtocol,
    index: u32,
    /// Bumped each time a slot is handed to a new logical group.
    generation: u64,
    /// Number of routes referencing this group.
    refcount: AtomicU32,
    /// Shared by every copy-on-write version of the same logical group.
    hardware: Arc<ArcSwap<HardwareState>>,
}

impl NextHopGroup {
    /// New group owning `members`, referenced once.
    pub(crate) fn new(members: Vec<NextHop>, protocol: RouteProtocol, index: u32) -> Self {
        NextHopGroup {
            members: Members::from_vec(members),
            protocol,
            index,
            generation: 0,
            refcount: AtomicU32::new(1),
            hardware: Arc::new(ArcSwap::from_pointee(HardwareState::pending())),
        }
    }

    /// Copy of this group with `members` swapped in, for republishing in the
    /// same slot. Reference count and hardware state carry over.
    pub(crate) fn republish(&self, members: Vec<NextHop>) -> Self {
        NextHopGroup {
            members: Members::from_vec(members),
            protocol: self.protocol,
            index: self.index,
            generation: self.generation,
            refcount: AtomicU32::new(self.ref_count()),
            hardware: Arc::clone(&self.hardware),
        }
    }

    /// Replacement group in another slot, taking over `refcount` references.
    pub(crate) fn successor(
        members: Vec<NextHop>,
        protocol: RouteProtocol,
        index: u32,
        refcount: u32,
    ) -> Self {
        let group = NextHopGroup::new(members, protocol, index);
        group.refcount.store(refcount, Ordering::Relaxed);
        group
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn members(&self) -> &[NextHop] {
        self.members.as_slice()
    }

    pub fn sibling_count(&self) -> usize {
        self.members().len()
    }

    pub fn protocol(&self) -> RouteProtocol {
        self.protocol
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take another reference, returning the new count.
    pub(crate) fn acquire(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take `count` references at once, returning the new count.
    pub(crate) fn add_refs(&self, count: u32) -> u32 {
        self.refcount.fetch_add(count, Ordering::AcqRel) + count
    }

    /// Drop a reference, returning the new count.
    ///
    /// # Panics
    /// Panics when the count is already zero: more releases than acquires
    /// means the caller's bookkeeping is corrupt.
    pub(crate) fn release(&self) -> u32 {
        match self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => panic!(
                "next-hop group {} released more times than acquired",
                self.index
            ),
        }
    }

    /// Current hardware state snapshot.
    pub fn hardware(&self) -> Arc<HardwareState> {
        self.hardware.load_full()
    }

    pub fn programmed_state(&self) -> ProgrammedState {
        self.hardware.load().state()
    }

    pub(crate) fn set_hardware(&self, state: HardwareState) {
        self.hardware.store(Arc::new(state));
    }

    /// Whether `other` is a republished version of this group.
    pub fn shares_hardware(&self, other: &NextHopGroup) -> bool {
        Arc::ptr_eq(&self.hardware, &other.hardware)
    }

    /// Independent copy of the member sequence, for building a modified
    /// candidate. Never mutates this group.
    pub fn to_members(&self) -> Vec<NextHop> {
        self.members().to_vec()
    }

    /// Number of members waiting on an unconfirmed link-layer binding.
    pub fn neigh_created_count(&self) -> usize {
        self.members()
            .iter()
            .filter(|nh| nh.is_neigh_created())
            .count()
    }

    pub fn neigh_present_count(&self) -> usize {
        self.members()
            .iter()
            .filter(|nh| nh.is_neigh_present())
            .count()
    }

    /// First member egressing through `ifp`, with its sibling position.
    pub fn find_path_using_interface(&self, ifp: InterfaceRef) -> Option<(usize, &NextHop)> {
        self.members()
            .iter()
            .enumerate()
            .find(|(_, nh)| nh.interface() == Some(ifp))
    }

    pub fn is_any_connected(&self) -> bool {
        self.members().iter().any(NextHop::is_connected)
    }

    /// Serializable view for diagnostics.
    pub fn snapshot(&self) -> GroupSnapshot {
        let hardware = self.hardware();
        GroupSnapshot {
            index: self.index,
            protocol: self.protocol.0,
            ref_count: self.ref_count(),
            state: hardware.state(),
            hardware: hardware.handles().cloned(),
            members: self
                .members()
                .iter()
                .map(|nh| MemberSnapshot {
                    interface: nh.interface().map(|i| i.if_index()),
                    gateway: nh.gateway(),
                    labels: nh.labels().map(|l| l.as_slice().to_vec()).unwrap_or_default(),
                    flags: nh.flags().bits(),
                    neigh: nh.neigh_state(),
                })
                .collect(),
        }
    }
}

/// Diagnostic view of a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub index: u32,
    pub protocol: u8,
    pub ref_count: u32,
    pub state: ProgrammedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareHandles>,
    pub members: Vec<MemberSnapshot>,
}

/// Diagnostic view of one member.
#[derive(Debug, Clone, Serialize)]
pub struct MemberSnapshot {
    pub interface: Option<u32>,
    pub gateway: Option<IpAddr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<u32>,
    pub flags: u32,
    pub neigh: NeighState,
}
