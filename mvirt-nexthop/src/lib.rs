//! mvirt-nexthop - shared next-hop resolution for the forwarding plane.
//!
//! Routes reference deduplicated, reference-counted next-hop groups by
//! table index. Forwarding threads select a member per packet without
//! locks; the control plane creates, shares, replaces and retires groups
//! and drives neighbor resolution with copy-on-write republishing.
//!
//! ## Layout
//!
//! - **nexthop**: single forwarding actions and their neighbor state
//! - **group**: shared groups, reference counts, hardware state
//! - **family**: per-family hash/compare and the table registry
//! - **table**: slot storage, dedup index, allocation, neighbor updates
//! - **reclaim**: grace-period reclamation of retired groups
//! - **select**: flow hashing and multipath selection
//! - **offload**: hardware programming collaborator
//! - **resolver**: entry points for the route and neighbor subsystems

pub mod config;
pub mod error;
pub mod family;
pub mod group;
pub mod nexthop;
pub mod offload;
mod reclaim;
pub mod resolver;
pub mod select;
pub mod table;

pub use error::{NextHopError, OffloadError, Result};
pub use family::{AddressFamily, FamilyOps, FamilyRegistry, Inet, Inet6};
pub use group::{NextHopGroup, ProgrammedState, RouteProtocol};
pub use nexthop::{InterfaceRef, LinkBindingRef, NeighState, NextHop, NextHopFlags};
pub use resolver::NextHopResolver;
pub use select::FlowFields;
pub use table::{NextHopTable, TableStats};
