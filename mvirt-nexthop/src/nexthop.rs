//! Single forwarding actions.
//!
//! A `NextHop` is a value object: egress target, route flags, optional MPLS
//! label stack and gateway. It never touches a table. Neighbor resolution
//! state lives in the flags and selects which target variant is active:
//! with `NEIGH_CREATED` or `NEIGH_PRESENT` set the hop points at a
//! link-layer binding, otherwise at a plain interface.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::{NextHopError, Result};

/// Maximum number of MPLS labels a next hop can push.
pub const MAX_LABELS: usize = 16;

/// Largest valid 20-bit MPLS label value.
pub const MPLS_LABEL_MAX: u32 = 0x000F_FFFF;

bitflags::bitflags! {
    /// Route flags carried by a next hop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NextHopFlags: u32 {
        /// Destination is reached through a gateway.
        const GATEWAY = 1 << 0;
        /// Send an ICMP unreachable.
        const REJECT = 1 << 1;
        /// Silently discard.
        const BLACKHOLE = 1 << 2;
        /// Destination is a local address.
        const LOCAL = 1 << 3;
        /// Destination is a broadcast address.
        const BROADCAST = 1 << 4;
        /// Punt to the slow path.
        const SLOWPATH = 1 << 5;
        /// No route, used as a placeholder.
        const NOROUTE = 1 << 6;
        /// Path is down and must not be selected.
        const DEAD = 1 << 7;
        /// Backup path.
        const BACKUP = 1 << 8;
        /// Path exists but cannot forward.
        const UNUSABLE = 1 << 9;
        /// Link-layer binding allocated but not yet confirmed.
        const NEIGH_CREATED = 1 << 10;
        /// Link-layer binding confirmed and usable for framing.
        const NEIGH_PRESENT = 1 << 11;
    }
}

impl NextHopFlags {
    /// Both neighbor state bits.
    pub const NEIGH: Self = Self::NEIGH_CREATED.union(Self::NEIGH_PRESENT);

    /// Flags that make a hop anything other than directly connected.
    const NOT_CONNECTED: Self = Self::GATEWAY
        .union(Self::LOCAL)
        .union(Self::BLACKHOLE)
        .union(Self::REJECT)
        .union(Self::NOROUTE)
        .union(Self::SLOWPATH);

    /// Route flags with the neighbor resolution state masked out.
    pub fn route_flags(self) -> Self {
        self.difference(Self::NEIGH)
    }
}

/// Identity handle for a network interface owned by the interface subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceRef(u32);

impl InterfaceRef {
    pub fn new(if_index: u32) -> Self {
        InterfaceRef(if_index)
    }

    pub fn if_index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// Link-layer binding (ARP / ND entry) owned by the neighbor subsystem.
#[derive(Debug)]
pub struct LinkBinding {
    interface: InterfaceRef,
    address: IpAddr,
    mac: Option<[u8; 6]>,
}

/// Shared handle to a link-layer binding.
///
/// Two handles are equal only when they refer to the same binding object.
#[derive(Debug, Clone)]
pub struct LinkBindingRef(Arc<LinkBinding>);

impl LinkBindingRef {
    /// Create a binding for `address` on `interface`.
    ///
    /// `mac` is `None` while address resolution is still in progress.
    pub fn new(interface: InterfaceRef, address: IpAddr, mac: Option<[u8; 6]>) -> Self {
        LinkBindingRef(Arc::new(LinkBinding {
            interface,
            address,
            mac,
        }))
    }

    pub fn interface(&self) -> InterfaceRef {
        self.0.interface
    }

    pub fn address(&self) -> IpAddr {
        self.0.address
    }

    pub fn mac(&self) -> Option<[u8; 6]> {
        self.0.mac
    }
}

impl PartialEq for LinkBindingRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LinkBindingRef {}

impl Hash for LinkBindingRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// What a next hop transmits through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// No egress (blackhole, reject, local).
    Unattached,
    /// Plain interface, no link-layer binding.
    Interface(InterfaceRef),
    /// Link-layer binding; only active while a neighbor flag is set.
    Neighbor(LinkBindingRef),
}

/// Bounded MPLS label stack, outermost label first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LabelStack {
    len: u8,
    labels: [u32; MAX_LABELS],
}

impl LabelStack {
    /// Build a stack from `labels`, rejecting oversize stacks and
    /// out-of-range label values.
    pub fn new(labels: &[u32]) -> Result<Self> {
        if labels.len() > MAX_LABELS {
            return Err(NextHopError::InvalidLabelStack {
                len: labels.len(),
                max: MAX_LABELS,
            });
        }
        if let Some(bad) = labels.iter().find(|l| **l > MPLS_LABEL_MAX) {
            return Err(NextHopError::InvalidLabel(*bad));
        }

        let mut stack = LabelStack {
            len: labels.len() as u8,
            labels: [0; MAX_LABELS],
        };
        stack.labels[..labels.len()].copy_from_slice(labels);
        Ok(stack)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.labels[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Outermost label, if any.
    pub fn top(&self) -> Option<u32> {
        self.as_slice().first().copied()
    }
}

/// Neighbor resolution state of a next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighState {
    Unresolved,
    Created,
    Present,
}

/// One resolved forwarding action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NextHop {
    target: Target,
    flags: NextHopFlags,
    labels: Option<LabelStack>,
    gateway: Option<IpAddr>,
}

impl NextHop {
    /// Build a next hop. Does not resolve the link-layer binding.
    ///
    /// Neighbor flags in `flags` are dropped: resolution state is only
    /// entered through the neighbor lifecycle.
    pub fn create(
        interface: Option<InterfaceRef>,
        gateway: Option<IpAddr>,
        flags: NextHopFlags,
        labels: &[u32],
    ) -> Result<Self> {
        let labels = if labels.is_empty() {
            None
        } else {
            Some(LabelStack::new(labels)?)
        };

        Ok(NextHop {
            target: interface.map_or(Target::Unattached, Target::Interface),
            flags: flags.route_flags(),
            labels,
            gateway,
        })
    }

    /// Gateway hop through `interface`.
    pub fn via(interface: InterfaceRef, gateway: IpAddr) -> Self {
        NextHop {
            target: Target::Interface(interface),
            flags: NextHopFlags::GATEWAY,
            labels: None,
            gateway: Some(gateway),
        }
    }

    /// Directly connected hop on `interface`.
    pub fn connected(interface: InterfaceRef) -> Self {
        NextHop {
            target: Target::Interface(interface),
            flags: NextHopFlags::empty(),
            labels: None,
            gateway: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn flags(&self) -> NextHopFlags {
        self.flags
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.gateway
    }

    pub fn labels(&self) -> Option<&LabelStack> {
        self.labels.as_ref()
    }

    /// Egress interface, read through the binding when one is active.
    pub fn interface(&self) -> Option<InterfaceRef> {
        match &self.target {
            Target::Unattached => None,
            Target::Interface(ifp) => Some(*ifp),
            Target::Neighbor(binding) => Some(binding.interface()),
        }
    }

    /// Link-layer binding, only when a neighbor flag is set.
    pub fn link_binding(&self) -> Option<&LinkBindingRef> {
        if !self.flags.intersects(NextHopFlags::NEIGH) {
            return None;
        }
        match &self.target {
            Target::Neighbor(binding) => Some(binding),
            _ => None,
        }
    }

    /// Rebind to another interface. Only valid before the hop is published;
    /// any link-layer binding is dropped along with its neighbor state.
    pub fn set_interface(&mut self, interface: Option<InterfaceRef>) {
        self.target = interface.map_or(Target::Unattached, Target::Interface);
        self.flags.remove(NextHopFlags::NEIGH);
    }

    pub fn is_connected(&self) -> bool {
        !self.flags.intersects(NextHopFlags::NOT_CONNECTED)
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(NextHopFlags::LOCAL)
    }

    pub fn is_gateway(&self) -> bool {
        self.flags.contains(NextHopFlags::GATEWAY)
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(NextHopFlags::DEAD)
    }

    pub fn is_neigh_present(&self) -> bool {
        self.flags.contains(NextHopFlags::NEIGH_PRESENT)
    }

    pub fn is_neigh_created(&self) -> bool {
        self.flags.contains(NextHopFlags::NEIGH_CREATED)
    }

    pub fn neigh_state(&self) -> NeighState {
        if self.is_neigh_present() {
            NeighState::Present
        } else if self.is_neigh_created() {
            NeighState::Created
        } else {
            NeighState::Unresolved
        }
    }

    /// Whether `binding` resolves this hop's gateway on its interface.
    pub fn uses_neighbor(&self, binding: &LinkBindingRef) -> bool {
        self.gateway == Some(binding.address()) && self.interface() == Some(binding.interface())
    }

    /// Copy of this hop moved to `state`.
    ///
    /// Entering `Created` or `Present` requires the binding; leaving to
    /// `Unresolved` falls back to the binding's interface.
    pub(crate) fn with_neigh_state(&self, state: NeighState, binding: &LinkBindingRef) -> NextHop {
        let mut next = self.clone();
        next.flags.remove(NextHopFlags::NEIGH);
        match state {
            NeighState::Unresolved => {
                next.target = Target::Interface(binding.interface());
            }
            NeighState::Created => {
                next.target = Target::Neighbor(binding.clone());
                next.flags.insert(NextHopFlags::NEIGH_CREATED);
            }
            NeighState::Present => {
                next.target = Target::Neighbor(binding.clone());
                next.flags.insert(NextHopFlags::NEIGH_PRESENT);
            }
        }
        next
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(f, "via {gw}")?,
            None => write!(f, "connected")?,
        }
        if let Some(ifp) = self.interface() {
            write!(f, " dev {ifp}")?;
        }
        if let Some(labels) = &self.labels {
            write!(f, " labels {:?}", labels.as_slice())?;
        }
        Ok(())
    }
}
