//! Entry points for the route and neighbor subsystems.
//!
//! Routes hold a `(family, index)` pair. The resolver picks the family's
//! table from the registry and forwards to it.

use std::sync::Arc;

use tracing::info;

use crate::config::NexthopConfig;
use crate::error::Result;
use crate::family::{AddressFamily, FamilyRegistry};
use crate::group::RouteProtocol;
use crate::nexthop::{LinkBindingRef, NextHop};
use crate::offload::Offload;
use crate::select::FlowFields;
use crate::table::{NextHopTable, TableStats};

/// Per-family dispatch over the registered next-hop tables.
#[derive(Debug, Default)]
pub struct NextHopResolver {
    registry: FamilyRegistry,
}

impl NextHopResolver {
    pub fn new(registry: FamilyRegistry) -> Self {
        NextHopResolver { registry }
    }

    /// Register both families sized by `config`, sharing one offload
    /// collaborator.
    pub fn from_config(config: &NexthopConfig, offload: Arc<dyn Offload>) -> Result<Self> {
        let registry = FamilyRegistry::new();
        for family in [AddressFamily::Inet, AddressFamily::Inet6] {
            registry.register(config.build_table(family, Arc::clone(&offload)))?;
        }
        info!(
            inet_capacity = config.inet_capacity,
            inet6_capacity = config.inet6_capacity,
            ecmp_max_paths = config.ecmp_max_paths,
            "Next-hop resolver ready"
        );
        Ok(Self::new(registry))
    }

    pub fn registry(&self) -> &FamilyRegistry {
        &self.registry
    }

    pub fn table(&self, family: AddressFamily) -> Result<&Arc<NextHopTable>> {
        self.registry.table(family)
    }

    /// Reference a group for a newly installed route.
    pub fn resolve_route(
        &self,
        family: AddressFamily,
        members: Vec<NextHop>,
        protocol: RouteProtocol,
    ) -> Result<u32> {
        let (index, _) = self.table(family)?.insert_or_share(members, protocol)?;
        Ok(index)
    }

    /// Drop a removed route's reference.
    pub fn withdraw_route(&self, family: AddressFamily, index: u32) -> Result<()> {
        self.table(family)?.release(index)
    }

    /// Change the paths of every route using the group at `index`.
    pub fn replace_route(&self, family: AddressFamily, index: u32, members: Vec<NextHop>) -> Result<u32> {
        self.table(family)?.replace(index, members)
    }

    /// Forwarding lookup.
    pub fn select_for_packet(
        &self,
        family: AddressFamily,
        index: u32,
        flow: &FlowFields,
        ether_type: u16,
    ) -> Result<NextHop> {
        self.table(family)?.select_for_packet(index, flow, ether_type)
    }

    /// The neighbor subsystem allocated `binding`. Returns the number of
    /// groups republished.
    pub fn neigh_created(&self, binding: &LinkBindingRef) -> Result<usize> {
        Ok(self.neighbor_table(binding)?.neigh_created(binding))
    }

    pub fn neigh_resolved(&self, binding: &LinkBindingRef) -> Result<usize> {
        Ok(self.neighbor_table(binding)?.neigh_resolved(binding))
    }

    pub fn neigh_expired(&self, binding: &LinkBindingRef) -> Result<usize> {
        Ok(self.neighbor_table(binding)?.neigh_expired(binding))
    }

    pub fn neigh_removed(&self, binding: &LinkBindingRef) -> Result<usize> {
        Ok(self.neighbor_table(binding)?.neigh_removed(binding))
    }

    fn neighbor_table(&self, binding: &LinkBindingRef) -> Result<&Arc<NextHopTable>> {
        self.table(AddressFamily::of(binding.address()))
    }

    /// Run a reclamation pass on every registered table.
    pub fn reclaim(&self) -> usize {
        self.tables().map(|table| table.reclaim()).sum()
    }

    pub fn stats(&self) -> Vec<TableStats> {
        self.tables().map(|table| table.stats()).collect()
    }

    fn tables(&self) -> impl Iterator<Item = &Arc<NextHopTable>> {
        [AddressFamily::Inet, AddressFamily::Inet6]
            .into_iter()
            .filter_map(|family| self.registry.table(family).ok())
    }
}
