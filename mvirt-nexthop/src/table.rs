//! Per-family next-hop group table.
//!
//! Slots are `ArcSwapOption`s: forwarding threads load them without locks,
//! writers publish with a single atomic store. All writers of one table are
//! serialized by `writer`, which also owns the dedup index, the neighbor
//! reverse index, the allocation cursor and the reclaimer.
//!
//! A slot emptied by `release` or `replace` stays unavailable to the
//! allocator until the reclaimer has seen the last reader drop the old
//! group, so an index a reader is still using is never handed out again.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeSet, HashMap};
use std::hash::{BuildHasher, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{NextHopError, OffloadError, Result};
use crate::family::{AddressFamily, FamilyOps, GroupKey};
use crate::group::{GroupSnapshot, HardwareHandles, HardwareState, NextHopGroup, ProgrammedState, RouteProtocol};
use crate::nexthop::{InterfaceRef, LinkBindingRef, NeighState, NextHop};
use crate::offload::{GroupDescriptor, NoOffload, Offload};
use crate::reclaim::{Reclaimer, Retired, Retirement};
use crate::select::{flow_hash, select_from, FlowFields};

/// Upper bound on slots per table.
pub const MAX_CAPACITY: u32 = 1 << 20;

/// Default per-group sibling bound.
pub const DEFAULT_MAX_PATHS: usize = 255;

/// Counters for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub family: AddressFamily,
    pub capacity: u32,
    /// Occupied slots, including those still inside their grace period.
    pub in_use: u32,
    pub pending_reclaim: usize,
    pub neigh_present: u32,
    pub neigh_created: u32,
}

type NeighborKey = (IpAddr, InterfaceRef);

/// State only writers touch.
#[derive(Debug)]
struct WriterState {
    rover: u32,
    /// Slots unlinked but not yet reclaimed.
    draining: Vec<bool>,
    /// Content hash to slots holding a group with that hash.
    index: HashMap<u64, Vec<u32>>,
    /// Gateway and interface to slots with a member using them.
    neighbors: HashMap<NeighborKey, BTreeSet<u32>>,
    reclaimer: Reclaimer,
    generation: u64,
    /// Pending slots republished after their program request went out.
    outdated: BTreeSet<u32>,
}

impl WriterState {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Fixed-capacity storage for one family's groups.
#[derive(Debug)]
pub struct NextHopTable {
    ops: Arc<dyn FamilyOps>,
    slots: Box<[ArcSwapOption<NextHopGroup>]>,
    hasher: RandomState,
    offload: Arc<dyn Offload>,
    max_paths: usize,
    ecmp_max_paths: usize,
    writer: Mutex<WriterState>,
    in_use: AtomicU32,
    neigh_present: AtomicU32,
    neigh_created: AtomicU32,
}

impl NextHopTable {
    /// Empty table with `capacity` slots (clamped to `1..=MAX_CAPACITY`),
    /// no hardware offload and the default sibling bound.
    pub fn new(ops: Arc<dyn FamilyOps>, capacity: u32) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        NextHopTable {
            ops,
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            hasher: RandomState::new(),
            offload: Arc::new(NoOffload),
            max_paths: DEFAULT_MAX_PATHS,
            ecmp_max_paths: 0,
            writer: Mutex::new(WriterState {
                rover: 0,
                draining: vec![false; capacity as usize],
                index: HashMap::new(),
                neighbors: HashMap::new(),
                reclaimer: Reclaimer::default(),
                generation: 0,
                outdated: BTreeSet::new(),
            }),
            in_use: AtomicU32::new(0),
            neigh_present: AtomicU32::new(0),
            neigh_created: AtomicU32::new(0),
        }
    }

    pub fn with_offload(mut self, offload: Arc<dyn Offload>) -> Self {
        self.offload = offload;
        self
    }

    /// Maximum members per group.
    pub fn with_max_paths(mut self, max_paths: usize) -> Self {
        self.max_paths = max_paths.max(1);
        self
    }

    /// Members multipath selection considers; 0 means all.
    pub fn with_ecmp_max_paths(mut self, ecmp_max_paths: usize) -> Self {
        self.ecmp_max_paths = ecmp_max_paths;
        self
    }

    pub fn family(&self) -> AddressFamily {
        self.ops.family()
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_hash(&self, key: &GroupKey<'_>) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        self.ops.hash(key, &mut hasher);
        hasher.finish()
    }

    fn group_hash(&self, group: &NextHopGroup) -> u64 {
        self.key_hash(&GroupKey {
            members: group.members(),
            protocol: group.protocol(),
        })
    }

    fn validate(&self, members: &[NextHop]) -> Result<()> {
        if members.is_empty() {
            return Err(NextHopError::EmptyGroup);
        }
        if members.len() > self.max_paths {
            return Err(NextHopError::TooManyPaths {
                count: members.len(),
                max: self.max_paths,
            });
        }
        if let Some(gateway) = members
            .iter()
            .filter_map(NextHop::gateway)
            .find(|gw| !self.ops.owns_gateway(*gw))
        {
            return Err(NextHopError::FamilyMismatch {
                family: self.family(),
                gateway,
            });
        }
        Ok(())
    }

    fn live(&self, index: u32) -> Result<Arc<NextHopGroup>> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.load_full())
            .ok_or(NextHopError::UnresolvedIndex(index))
    }

    fn find_locked(&self, st: &WriterState, hash: u64, key: &GroupKey<'_>) -> Option<Arc<NextHopGroup>> {
        st.index
            .get(&hash)?
            .iter()
            .filter_map(|&i| self.slots[i as usize].load_full())
            .find(|group| self.ops.equal(group, key))
    }

    /// Find a group equal to `members`/`protocol`, or insert one.
    ///
    /// Returns the slot index and whether a new group was created. A shared
    /// group gains one reference; a new one starts with one.
    pub fn insert_or_share(&self, members: Vec<NextHop>, protocol: RouteProtocol) -> Result<(u32, bool)> {
        self.validate(&members)?;
        let key = GroupKey {
            members: &members,
            protocol,
        };
        let hash = self.key_hash(&key);

        let mut st = self.lock();
        if let Some(existing) = self.find_locked(&st, hash, &key) {
            let refs = existing.acquire();
            debug!(family = %self.family(), index = existing.index(), refs, "Sharing next-hop group");
            return Ok((existing.index(), false));
        }

        let index = self.alloc_slot(&mut st)?;
        let generation = st.next_generation();
        let siblings = members.len();
        let group = Arc::new(NextHopGroup::new(members, protocol, index).with_generation(generation));
        self.publish_new(&mut st, hash, &group);
        debug!(family = %self.family(), index, siblings, "Created next-hop group");
        Ok((index, true))
    }

    /// Index of the group equal to `members`/`protocol`, without taking a
    /// reference.
    pub fn find(&self, members: &[NextHop], protocol: RouteProtocol) -> Option<u32> {
        let key = GroupKey { members, protocol };
        let hash = self.key_hash(&key);
        let st = self.lock();
        self.find_locked(&st, hash, &key).map(|g| g.index())
    }

    /// Drop one reference to the group at `index`. The last release unlinks
    /// the group; its slot is freed once readers are done with it.
    ///
    /// # Panics
    /// Panics if the group's reference count is already zero.
    pub fn release(&self, index: u32) -> Result<()> {
        let mut st = self.lock();
        let group = self.live(index)?;
        let refs = group.release();
        if refs > 0 {
            debug!(family = %self.family(), index, refs, "Released next-hop group reference");
            return Ok(());
        }

        self.unlink(&mut st, &group);
        self.retire_slot(&mut st, group);
        debug!(family = %self.family(), index, "Retired next-hop group");
        Ok(())
    }

    /// Move every reference of the group at `old_index` to a group with
    /// `members`. Returns the new index.
    ///
    /// The old group leaves the dedup index before its successor enters it.
    /// If an equal group already exists the references merge into it.
    pub fn replace(&self, old_index: u32, members: Vec<NextHop>) -> Result<u32> {
        self.validate(&members)?;
        let mut st = self.lock();
        let old = self.live(old_index)?;
        let protocol = old.protocol();
        let key = GroupKey {
            members: &members,
            protocol,
        };
        if self.ops.equal(&old, &key) {
            return Ok(old_index);
        }
        let hash = self.key_hash(&key);

        self.unlink(&mut st, &old);

        if let Some(existing) = self.find_locked(&st, hash, &key) {
            let refs = existing.add_refs(old.ref_count());
            let new_index = existing.index();
            self.retire_slot(&mut st, old);
            info!(family = %self.family(), old_index, new_index, refs, "Merged next-hop group into existing");
            return Ok(new_index);
        }

        let new_index = match self.alloc_slot(&mut st) {
            Ok(index) => index,
            Err(e) => {
                let old_hash = self.group_hash(&old);
                self.link(&mut st, old_hash, &old);
                return Err(e);
            }
        };
        let generation = st.next_generation();
        let group = Arc::new(
            NextHopGroup::successor(members, protocol, new_index, old.ref_count()).with_generation(generation),
        );
        self.publish_new(&mut st, hash, &group);
        self.retire_slot(&mut st, old);
        info!(
            family = %self.family(),
            old_index,
            new_index,
            siblings = group.sibling_count(),
            "Replaced next-hop group"
        );
        Ok(new_index)
    }

    /// Independent copy of the members of the group at `index`, as a base
    /// for a modified candidate.
    pub fn copy_group(&self, index: u32) -> Result<Vec<NextHop>> {
        self.with_group(index, NextHopGroup::to_members)
    }

    /// Current group at `index`. Holding the returned `Arc` delays
    /// reclamation of that version.
    pub fn get(&self, index: u32) -> Option<Arc<NextHopGroup>> {
        self.slots.get(index as usize).and_then(|slot| slot.load_full())
    }

    /// Run `f` against the live group at `index`.
    pub fn with_group<R>(&self, index: u32, f: impl FnOnce(&NextHopGroup) -> R) -> Result<R> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(NextHopError::UnresolvedIndex(index))?;
        let guard = slot.load();
        match guard.as_deref() {
            Some(group) => Ok(f(group)),
            None => Err(NextHopError::UnresolvedIndex(index)),
        }
    }

    /// Run `f` against the member selected for `hash` in the group at `index`.
    pub fn with_selected<R>(&self, index: u32, hash: u32, f: impl FnOnce(&NextHop) -> R) -> Result<R> {
        self.with_group(index, |group| {
            f(select_from(group.members(), hash, self.ecmp_max_paths))
        })
    }

    /// Forwarding lookup: pick the member of the group at `index` for a
    /// packet. Never takes the writer lock.
    pub fn select_for_packet(&self, index: u32, flow: &FlowFields, ether_type: u16) -> Result<NextHop> {
        self.with_group(index, |group| {
            let hash = if group.sibling_count() > 1 {
                flow_hash(flow, ether_type)
            } else {
                0
            };
            select_from(group.members(), hash, self.ecmp_max_paths).clone()
        })
    }

    /// Move member `sibling` of the group at `index` to `state` through
    /// `binding`.
    pub fn set_member_neigh_state(
        &self,
        index: u32,
        sibling: usize,
        state: NeighState,
        binding: &LinkBindingRef,
    ) -> Result<()> {
        let mut st = self.lock();
        let old = self.live(index)?;
        let Some(member) = old.members().get(sibling).filter(|nh| nh.uses_neighbor(binding)) else {
            return Err(NextHopError::NeighborMismatch { index, sibling });
        };
        let updated = member.with_neigh_state(state, binding);
        let mut members = old.to_members();
        members[sibling] = updated;
        self.republish(&mut st, old, members);
        self.collect(&mut st);
        debug!(family = %self.family(), index, sibling, ?state, "Published neighbor transition");
        Ok(())
    }

    /// A binding was allocated for an unresolved gateway.
    pub fn neigh_created(&self, binding: &LinkBindingRef) -> usize {
        self.transition(binding, NeighState::Created, |nh| {
            nh.neigh_state() == NeighState::Unresolved
        })
    }

    /// A binding was confirmed. Members still on another binding for the
    /// same neighbor move to this one.
    pub fn neigh_resolved(&self, binding: &LinkBindingRef) -> usize {
        self.transition(binding, NeighState::Present, |nh| {
            !(nh.is_neigh_present() && nh.link_binding() == Some(binding))
        })
    }

    /// A confirmed binding expired but is kept provisionally.
    pub fn neigh_expired(&self, binding: &LinkBindingRef) -> usize {
        self.transition(binding, NeighState::Created, |nh| {
            nh.is_neigh_present() && nh.link_binding() == Some(binding)
        })
    }

    /// A binding was deleted.
    pub fn neigh_removed(&self, binding: &LinkBindingRef) -> usize {
        self.transition(binding, NeighState::Unresolved, |nh| {
            nh.link_binding() == Some(binding)
        })
    }

    /// Republish every group with a member that uses `binding` and passes
    /// `applies`. Returns the number of groups republished.
    fn transition(&self, binding: &LinkBindingRef, state: NeighState, applies: impl Fn(&NextHop) -> bool) -> usize {
        let mut st = self.lock();
        let indices: Vec<u32> = st
            .neighbors
            .get(&(binding.address(), binding.interface()))
            .map(|slots| slots.iter().copied().collect())
            .unwrap_or_default();

        let affected = |nh: &NextHop| nh.uses_neighbor(binding) && applies(nh);
        let mut published = 0;
        for index in indices {
            let Some(old) = self.slots[index as usize].load_full() else {
                continue;
            };
            if !old.members().iter().any(|nh| affected(nh)) {
                continue;
            }
            let members = old
                .members()
                .iter()
                .map(|nh| {
                    if affected(nh) {
                        nh.with_neigh_state(state, binding)
                    } else {
                        nh.clone()
                    }
                })
                .collect();
            self.republish(&mut st, old, members);
            published += 1;
        }
        self.collect(&mut st);

        if published > 0 {
            debug!(
                family = %self.family(),
                neighbor = %binding.address(),
                interface = %binding.interface(),
                ?state,
                groups = published,
                "Published neighbor transition"
            );
        }
        published
    }

    /// Record the offload outcome for the group at `index`.
    ///
    /// `generation` must match the group the request was issued for. A
    /// result for a released group or an older occupant of the slot is
    /// discarded and its handles passed back to `Offload::remove`. Member
    /// changes published while the request was pending go out as an update
    /// once the handles are known. A failure leaves the group forwarding in
    /// software.
    pub fn complete_programming(
        &self,
        index: u32,
        generation: u64,
        result: std::result::Result<HardwareHandles, OffloadError>,
    ) -> Result<()> {
        let mut st = self.lock();
        let current = self.slots.get(index as usize).and_then(|slot| slot.load_full());
        let Some(group) = current.filter(|group| group.generation() == generation) else {
            if let Ok(handles) = result {
                debug!(family = %self.family(), index, generation, "Discarding stale programming result");
                self.offload.remove(self.family(), index, handles);
            }
            return Err(NextHopError::UnresolvedIndex(index));
        };
        if group.programmed_state() != ProgrammedState::Pending {
            return Err(NextHopError::HardwareProgrammingError {
                index,
                source: OffloadError::NotPending,
            });
        }

        match result.and_then(|handles| HardwareState::programmed(handles, group.sibling_count())) {
            Ok(state) => {
                group.set_hardware(state);
                debug!(family = %self.family(), index, "Programmed next-hop group");
                // Members changed while the request was in flight.
                if st.outdated.remove(&index) {
                    self.request_update(&group);
                }
                Ok(())
            }
            Err(source) => {
                st.outdated.remove(&index);
                group.set_hardware(HardwareState::error());
                warn!(family = %self.family(), index, error = %source, "Hardware programming failed");
                Err(NextHopError::HardwareProgrammingError { index, source })
            }
        }
    }

    /// Re-send a group in `Error` state for programming. Returns whether a
    /// request went out.
    pub fn retry_programming(&self, index: u32) -> Result<bool> {
        let mut st = self.lock();
        let group = self.live(index)?;
        if group.programmed_state() != ProgrammedState::Error {
            return Ok(false);
        }
        st.outdated.remove(&index);
        group.set_hardware(HardwareState::pending());
        self.request_programming(&group);
        Ok(group.programmed_state() == ProgrammedState::Pending)
    }

    /// Free every retired group no reader still holds. Returns how many
    /// were freed.
    pub fn reclaim(&self) -> usize {
        let mut st = self.lock();
        self.collect(&mut st)
    }

    /// Retired groups still waiting for readers.
    pub fn pending_reclaim(&self) -> usize {
        self.lock().reclaimer.pending()
    }

    pub fn stats(&self) -> TableStats {
        let pending_reclaim = self.pending_reclaim();
        TableStats {
            family: self.family(),
            capacity: self.capacity(),
            in_use: self.in_use.load(Ordering::Relaxed),
            pending_reclaim,
            neigh_present: self.neigh_present.load(Ordering::Relaxed),
            neigh_created: self.neigh_created.load(Ordering::Relaxed),
        }
    }

    /// Diagnostic view of every live group, in slot order.
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.slots
            .iter()
            .filter_map(|slot| slot.load().as_deref().map(NextHopGroup::snapshot))
            .collect()
    }

    /// Scan from the cursor for a slot that is neither occupied nor draining.
    fn alloc_slot(&self, st: &mut WriterState) -> Result<u32> {
        self.collect(st);

        let capacity = self.capacity();
        if self.in_use.load(Ordering::Relaxed) < capacity {
            for _ in 0..capacity {
                let candidate = st.rover;
                st.rover = (st.rover + 1) % capacity;
                if !st.draining[candidate as usize] && self.slots[candidate as usize].load().is_none() {
                    self.in_use.fetch_add(1, Ordering::Relaxed);
                    return Ok(candidate);
                }
            }
        }

        warn!(
            family = %self.family(),
            capacity,
            pending_reclaim = st.reclaimer.pending(),
            "Next-hop table exhausted"
        );
        Err(NextHopError::AllocationExhausted {
            family: self.family(),
            capacity,
        })
    }

    /// Store a freshly built group in its (allocated) slot, index it and
    /// hand it to the offload side.
    fn publish_new(&self, st: &mut WriterState, hash: u64, group: &Arc<NextHopGroup>) {
        self.slots[group.index() as usize].store(Some(Arc::clone(group)));
        self.link(st, hash, group);
        self.request_programming(group);
    }

    fn link(&self, st: &mut WriterState, hash: u64, group: &NextHopGroup) {
        let index = group.index();
        st.index.entry(hash).or_default().push(index);
        for key in neighbor_keys(group) {
            st.neighbors.entry(key).or_default().insert(index);
        }
        adjust(&self.neigh_present, 0, group.neigh_present_count());
        adjust(&self.neigh_created, 0, group.neigh_created_count());
    }

    /// Remove `group` from the dedup and neighbor indexes. It stays in its
    /// slot until the caller retires it.
    fn unlink(&self, st: &mut WriterState, group: &NextHopGroup) {
        let index = group.index();
        let hash = self.group_hash(group);
        if let Some(bucket) = st.index.get_mut(&hash) {
            bucket.retain(|&i| i != index);
            if bucket.is_empty() {
                st.index.remove(&hash);
            }
        }
        for key in neighbor_keys(group) {
            if let Some(slots) = st.neighbors.get_mut(&key) {
                slots.remove(&index);
                if slots.is_empty() {
                    st.neighbors.remove(&key);
                }
            }
        }
        adjust(&self.neigh_present, group.neigh_present_count(), 0);
        adjust(&self.neigh_created, group.neigh_created_count(), 0);
    }

    /// Empty the slot of an unlinked group and queue it for reclamation.
    fn retire_slot(&self, st: &mut WriterState, group: Arc<NextHopGroup>) {
        let index = group.index();
        st.draining[index as usize] = true;
        st.outdated.remove(&index);
        self.slots[index as usize].store(None);
        st.reclaimer.retire(group, Retirement::Slot(index));
    }

    /// Swap in a copy-on-write version of `old` with `members`.
    fn republish(&self, st: &mut WriterState, old: Arc<NextHopGroup>, members: Vec<NextHop>) {
        let new = Arc::new(old.republish(members));
        adjust(&self.neigh_present, old.neigh_present_count(), new.neigh_present_count());
        adjust(&self.neigh_created, old.neigh_created_count(), new.neigh_created_count());
        self.slots[new.index() as usize].store(Some(Arc::clone(&new)));
        st.reclaimer.retire(old, Retirement::Superseded);
        if new.programmed_state() == ProgrammedState::Pending {
            st.outdated.insert(new.index());
        } else {
            self.request_update(&new);
        }
    }

    fn request_programming(&self, group: &NextHopGroup) {
        let desc = GroupDescriptor::of(self.family(), group);
        if let Err(e) = self.offload.program(desc) {
            warn!(family = %self.family(), index = group.index(), error = %e, "Hardware programming failed");
            group.set_hardware(HardwareState::error());
        }
    }

    fn request_update(&self, group: &NextHopGroup) {
        let hardware = group.hardware();
        let Some(handles) = hardware.handles() else {
            return;
        };
        let desc = GroupDescriptor::of(self.family(), group);
        if let Err(e) = self.offload.update(desc, handles) {
            warn!(family = %self.family(), index = group.index(), error = %e, "Hardware update failed");
        }
    }

    fn collect(&self, st: &mut WriterState) -> usize {
        let WriterState {
            reclaimer, draining, ..
        } = st;
        let family = self.family();
        reclaimer.collect(|Retired { group, kind }| {
            let Retirement::Slot(index) = kind else {
                return;
            };
            draining[index as usize] = false;
            self.in_use.fetch_sub(1, Ordering::Relaxed);
            if let Some(handles) = group.hardware().handles() {
                self.offload.remove(family, index, handles.clone());
            }
            debug!(%family, index, "Reclaimed next-hop slot");
        })
    }
}

fn neighbor_keys(group: &NextHopGroup) -> impl Iterator<Item = NeighborKey> + '_ {
    group
        .members()
        .iter()
        .filter_map(|nh| Some((nh.gateway()?, nh.interface()?)))
}

fn adjust(counter: &AtomicU32, from: usize, to: usize) {
    if to > from {
        counter.fetch_add((to - from) as u32, Ordering::Relaxed);
    } else if from > to {
        counter.fetch_sub((from - to) as u32, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{Inet, Inet6};
    use crate::group::HwHandle;
    use crate::nexthop::{LabelStack, NextHopFlags};
    use crate::offload::{ChannelOffload, OffloadRequest};
    use crate::select::ETHERTYPE_IPV4;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn gw(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn hop(if_index: u32, last: u8) -> NextHop {
        NextHop::via(InterfaceRef::new(if_index), gw(last))
    }

    fn table(capacity: u32) -> NextHopTable {
        NextHopTable::new(Arc::new(Inet), capacity)
    }

    #[test]
    fn test_insert_dedup() {
        let table = table(16);
        let members = vec![hop(1, 1), hop(2, 2)];

        let (a, new_a) = table.insert_or_share(members.clone(), RouteProtocol::BGP).unwrap();
        let (b, new_b) = table.insert_or_share(members.clone(), RouteProtocol::BGP).unwrap();
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(a, b);
        assert_eq!(table.get(a).unwrap().ref_count(), 2);

        table.release(a).unwrap();
        assert_eq!(table.get(a).unwrap().ref_count(), 1);
        assert_eq!(table.find(&members, RouteProtocol::BGP), Some(a));

        table.release(a).unwrap();
        assert_eq!(table.find(&members, RouteProtocol::BGP), None);
        assert!(matches!(table.release(a), Err(NextHopError::UnresolvedIndex(_))));

        let (_, fresh) = table.insert_or_share(members, RouteProtocol::BGP).unwrap();
        assert!(fresh);
    }

    #[test]
    fn test_distinct_keys_get_distinct_slots() {
        let table = table(16);
        let (a, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let (b, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::OSPF).unwrap();
        let (c, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP)
            .unwrap();
        let (d, _) = table
            .insert_or_share(vec![hop(2, 2), hop(1, 1)], RouteProtocol::BGP)
            .unwrap();
        let mut all = vec![a, b, c, d];
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4);
        assert_eq!(table.stats().in_use, 4);
    }

    #[test]
    fn test_allocator_wraparound() {
        let table = table(4);
        let indices: Vec<u32> = (0..4)
            .map(|i| table.insert_or_share(vec![hop(1, i)], RouteProtocol::STATIC).unwrap().0)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        table.release(2).unwrap();
        let (index, new) = table.insert_or_share(vec![hop(1, 9)], RouteProtocol::STATIC).unwrap();
        assert!(new);
        assert_eq!(index, 2);
    }

    #[test]
    fn test_allocation_exhausted() {
        let table = table(2);
        table.insert_or_share(vec![hop(1, 1)], RouteProtocol::STATIC).unwrap();
        table.insert_or_share(vec![hop(1, 2)], RouteProtocol::STATIC).unwrap();

        let err = table
            .insert_or_share(vec![hop(1, 3)], RouteProtocol::STATIC)
            .unwrap_err();
        assert!(matches!(
            err,
            NextHopError::AllocationExhausted {
                family: AddressFamily::Inet,
                capacity: 2
            }
        ));

        // Sharing never needs a slot.
        let (_, new) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::STATIC).unwrap();
        assert!(!new);
    }

    #[test]
    fn test_rejects_invalid_groups() {
        let table = table(8).with_max_paths(2);
        assert!(matches!(
            table.insert_or_share(Vec::new(), RouteProtocol::BGP),
            Err(NextHopError::EmptyGroup)
        ));
        assert!(matches!(
            table.insert_or_share(vec![hop(1, 1), hop(2, 2), hop(3, 3)], RouteProtocol::BGP),
            Err(NextHopError::TooManyPaths { count: 3, max: 2 })
        ));

        let v6 = NextHop::via(InterfaceRef::new(1), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(matches!(
            table.insert_or_share(vec![v6], RouteProtocol::BGP),
            Err(NextHopError::FamilyMismatch { .. })
        ));
        assert_eq!(table.stats().in_use, 0);
    }

    #[test]
    fn test_inet6_table() {
        let table = NextHopTable::new(Arc::new(Inet6), 8);
        let gw6 = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        let (index, _) = table
            .insert_or_share(vec![NextHop::via(InterfaceRef::new(3), gw6)], RouteProtocol::KERNEL)
            .unwrap();
        assert_eq!(table.family(), AddressFamily::Inet6);
        assert_eq!(table.get(index).unwrap().members()[0].gateway(), Some(gw6));
    }

    #[test]
    fn test_replace_moves_references() {
        let table = table(8);
        let (old, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();

        let mut members = table.copy_group(old).unwrap();
        members.push(hop(2, 2));
        let new = table.replace(old, members.clone()).unwrap();

        assert_ne!(new, old);
        assert!(table.get(old).is_none());
        let group = table.get(new).unwrap();
        assert_eq!(group.ref_count(), 2);
        assert_eq!(group.protocol(), RouteProtocol::BGP);
        assert_eq!(table.find(&[hop(1, 1)], RouteProtocol::BGP), None);
        assert_eq!(table.find(&members, RouteProtocol::BGP), Some(new));
    }

    #[test]
    fn test_replace_merges_into_existing() {
        let table = table(8);
        let (a, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let (b, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP)
            .unwrap();

        let merged = table.replace(a, vec![hop(1, 1), hop(2, 2)]).unwrap();
        assert_eq!(merged, b);
        assert_eq!(table.get(b).unwrap().ref_count(), 2);
        assert!(table.get(a).is_none());
    }

    #[test]
    fn test_replace_same_members_is_noop() {
        let table = table(8);
        let (a, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        assert_eq!(table.replace(a, vec![hop(1, 1)]).unwrap(), a);
        assert_eq!(table.pending_reclaim(), 0);
    }

    #[test]
    fn test_replace_full_table_keeps_old() {
        let table = table(1);
        let (a, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        assert!(matches!(
            table.replace(a, vec![hop(2, 2)]),
            Err(NextHopError::AllocationExhausted { .. })
        ));
        assert_eq!(table.find(&[hop(1, 1)], RouteProtocol::BGP), Some(a));
    }

    #[test]
    fn test_neighbor_lifecycle() {
        let table = table(8);
        let ifp = InterfaceRef::new(1);
        let (index, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP)
            .unwrap();
        table.insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP).unwrap();

        let pending = LinkBindingRef::new(ifp, gw(1), None);
        assert_eq!(table.neigh_created(&pending), 1);
        assert_eq!(table.stats().neigh_created, 1);

        let resolved = LinkBindingRef::new(ifp, gw(1), Some([2, 0, 0, 0, 0, 1]));
        assert_eq!(table.neigh_resolved(&resolved), 1);
        let stats = table.stats();
        assert_eq!((stats.neigh_present, stats.neigh_created), (1, 0));

        let group = table.get(index).unwrap();
        assert_eq!(group.index(), index);
        assert_eq!(group.ref_count(), 2);
        assert_eq!(group.members()[0].link_binding(), Some(&resolved));
        assert_eq!(group.members()[1].neigh_state(), NeighState::Unresolved);

        // Resolution does not change identity.
        assert_eq!(table.find(&[hop(1, 1), hop(2, 2)], RouteProtocol::BGP), Some(index));
        // Repeating the event publishes nothing.
        assert_eq!(table.neigh_resolved(&resolved), 0);

        // An expiry for a stale binding object does not apply.
        assert_eq!(table.neigh_expired(&pending), 0);
        assert_eq!(table.neigh_expired(&resolved), 1);
        assert_eq!(table.stats().neigh_created, 1);

        assert_eq!(table.neigh_removed(&resolved), 1);
        let group = table.get(index).unwrap();
        let member = &group.members()[0];
        assert_eq!(member.neigh_state(), NeighState::Unresolved);
        assert_eq!(member.interface(), Some(ifp));
        assert_eq!(table.stats().neigh_created, 0);
    }

    #[test]
    fn test_neighbor_transition_updates_every_group() {
        let table = table(8);
        let ifp = InterfaceRef::new(1);
        let (a, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let (b, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::OSPF)
            .unwrap();
        table.insert_or_share(vec![hop(3, 1)], RouteProtocol::BGP).unwrap();

        let binding = LinkBindingRef::new(ifp, gw(1), Some([2, 0, 0, 0, 0, 1]));
        assert_eq!(table.neigh_resolved(&binding), 2);
        assert!(table.get(a).unwrap().members()[0].is_neigh_present());
        assert!(table.get(b).unwrap().members()[0].is_neigh_present());
        assert_eq!(table.stats().neigh_present, 2);
    }

    #[test]
    fn test_released_group_drops_neighbor_counts() {
        let table = table(8);
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let binding = LinkBindingRef::new(InterfaceRef::new(1), gw(1), Some([2, 0, 0, 0, 0, 1]));
        table.neigh_resolved(&binding);
        assert_eq!(table.stats().neigh_present, 1);

        table.release(index).unwrap();
        assert_eq!(table.stats().neigh_present, 0);
        assert_eq!(table.neigh_removed(&binding), 0);
    }

    #[test]
    fn test_neighbor_flaps_reclaim_superseded_versions() {
        let table = table(4);
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let binding = LinkBindingRef::new(InterfaceRef::new(1), gw(1), Some([2, 0, 0, 0, 0, 1]));
        for _ in 0..16 {
            assert_eq!(table.neigh_resolved(&binding), 1);
            assert_eq!(table.neigh_removed(&binding), 1);
        }
        assert_eq!(table.pending_reclaim(), 0);

        let reader = table.get(index).unwrap();
        table.neigh_resolved(&binding);
        assert_eq!(table.pending_reclaim(), 1);
        drop(reader);
        table.neigh_removed(&binding);
        assert_eq!(table.pending_reclaim(), 0);
    }

    #[test]
    fn test_set_member_neigh_state() {
        let table = table(8);
        let (index, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP)
            .unwrap();
        let binding = LinkBindingRef::new(InterfaceRef::new(2), gw(2), None);

        assert!(matches!(
            table.set_member_neigh_state(index, 0, NeighState::Created, &binding),
            Err(NextHopError::NeighborMismatch { sibling: 0, .. })
        ));
        assert!(matches!(
            table.set_member_neigh_state(index, 5, NeighState::Created, &binding),
            Err(NextHopError::NeighborMismatch { sibling: 5, .. })
        ));

        table
            .set_member_neigh_state(index, 1, NeighState::Created, &binding)
            .unwrap();
        assert!(table.get(index).unwrap().members()[1].is_neigh_created());
        // No reader held the superseded version.
        assert_eq!(table.pending_reclaim(), 0);
    }

    #[test]
    fn test_reader_delays_slot_reuse() {
        let table = table(1);
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();

        let reader = table.get(index).unwrap();
        table.release(index).unwrap();
        assert!(table.get(index).is_none());

        assert_eq!(table.reclaim(), 0);
        assert!(matches!(
            table.insert_or_share(vec![hop(1, 2)], RouteProtocol::BGP),
            Err(NextHopError::AllocationExhausted { .. })
        ));
        assert_eq!(reader.members()[0], hop(1, 1));

        drop(reader);
        let (reused, _) = table.insert_or_share(vec![hop(1, 2)], RouteProtocol::BGP).unwrap();
        assert_eq!(reused, index);
        assert_eq!(table.pending_reclaim(), 0);
    }

    #[test]
    fn test_select_for_packet() {
        let table = table(8).with_ecmp_max_paths(2);
        let (index, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2), hop(3, 3)], RouteProtocol::BGP)
            .unwrap();
        let flow = FlowFields::new(gw(100), gw(200)).with_ports(17, 5000, 53);

        let first = table.select_for_packet(index, &flow, ETHERTYPE_IPV4).unwrap();
        for _ in 0..8 {
            assert_eq!(table.select_for_packet(index, &flow, ETHERTYPE_IPV4).unwrap(), first);
        }
        assert_ne!(first.interface(), Some(InterfaceRef::new(3)));

        let chosen = table.with_selected(index, 1, |nh| nh.interface()).unwrap();
        assert_eq!(chosen, Some(InterfaceRef::new(2)));

        assert!(matches!(
            table.select_for_packet(7, &flow, ETHERTYPE_IPV4),
            Err(NextHopError::UnresolvedIndex(7))
        ));
        assert!(matches!(
            table.select_for_packet(1000, &flow, ETHERTYPE_IPV4),
            Err(NextHopError::UnresolvedIndex(1000))
        ));
    }

    #[test]
    fn test_labels_survive_storage() {
        let table = table(8);
        let nh = NextHop::create(
            Some(InterfaceRef::new(1)),
            Some(gw(1)),
            NextHopFlags::GATEWAY,
            &[100, 200],
        )
        .unwrap();
        let (index, _) = table.insert_or_share(vec![nh], RouteProtocol::BGP).unwrap();
        let labels = table.with_group(index, |g| g.members()[0].labels().copied()).unwrap();
        assert_eq!(labels, Some(LabelStack::new(&[100, 200]).unwrap()));
    }

    fn programmed_table(capacity: u32) -> (NextHopTable, crossbeam_channel::Receiver<OffloadRequest>) {
        let (offload, rx) = ChannelOffload::new();
        (table(capacity).with_offload(Arc::new(offload)), rx)
    }

    fn expect_program(rx: &crossbeam_channel::Receiver<OffloadRequest>) -> GroupDescriptor {
        match rx.try_recv().unwrap() {
            OffloadRequest::Program(desc) => desc,
            other => panic!("expected program request, got {other:?}"),
        }
    }

    fn handles(members: u64) -> HardwareHandles {
        HardwareHandles {
            group: HwHandle(100),
            members: (0..members).map(HwHandle).collect(),
        }
    }

    #[test]
    fn test_programming_lifecycle() {
        let (table, rx) = programmed_table(8);
        let (index, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP)
            .unwrap();
        let desc = expect_program(&rx);
        assert_eq!(desc.index, index);
        assert_eq!(desc.members.len(), 2);
        assert_eq!(table.get(index).unwrap().programmed_state(), ProgrammedState::Pending);

        table
            .complete_programming(index, desc.generation, Ok(handles(2)))
            .unwrap();
        assert_eq!(table.get(index).unwrap().programmed_state(), ProgrammedState::Programmed);

        // A republished version keeps the handles and pushes an update.
        let binding = LinkBindingRef::new(InterfaceRef::new(1), gw(1), Some([2, 0, 0, 0, 0, 1]));
        table.neigh_resolved(&binding);
        match rx.try_recv().unwrap() {
            OffloadRequest::Update { group, handles: h } => {
                assert_eq!(h, handles(2));
                assert_eq!(group.members[0].mac, Some([2, 0, 0, 0, 0, 1]));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(table.pending_reclaim(), 0);
        assert!(rx.try_recv().is_err());

        table.release(index).unwrap();
        assert_eq!(table.reclaim(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            OffloadRequest::Remove {
                family: AddressFamily::Inet,
                index,
                handles: handles(2),
            }
        );
    }

    #[test]
    fn test_programming_failure_keeps_forwarding() {
        let (table, rx) = programmed_table(8);
        let (index, _) = table
            .insert_or_share(vec![hop(1, 1), hop(2, 2)], RouteProtocol::BGP)
            .unwrap();
        let desc = expect_program(&rx);

        let err = table
            .complete_programming(index, desc.generation, Ok(handles(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            NextHopError::HardwareProgrammingError {
                source: OffloadError::MemberCountMismatch { expected: 2, actual: 1 },
                ..
            }
        ));
        assert_eq!(table.get(index).unwrap().programmed_state(), ProgrammedState::Error);
        let flow = FlowFields::new(gw(1), gw(2));
        assert!(table.select_for_packet(index, &flow, ETHERTYPE_IPV4).is_ok());

        assert!(table.retry_programming(index).unwrap());
        let retry = expect_program(&rx);
        assert_eq!(retry.generation, desc.generation);
        table
            .complete_programming(index, retry.generation, Err(OffloadError::Rejected("full".into())))
            .unwrap_err();
        assert_eq!(table.get(index).unwrap().programmed_state(), ProgrammedState::Error);
    }

    #[test]
    fn test_stale_programming_result_discarded() {
        let (table, rx) = programmed_table(1);
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let stale = expect_program(&rx);
        table.release(index).unwrap();

        let (reused, _) = table.insert_or_share(vec![hop(1, 2)], RouteProtocol::BGP).unwrap();
        assert_eq!(reused, index);
        let current = expect_program(&rx);
        assert_ne!(current.generation, stale.generation);

        assert!(matches!(
            table.complete_programming(index, stale.generation, Ok(handles(1))),
            Err(NextHopError::UnresolvedIndex(_))
        ));
        assert!(matches!(rx.try_recv().unwrap(), OffloadRequest::Remove { .. }));
        assert_eq!(table.get(index).unwrap().programmed_state(), ProgrammedState::Pending);
    }

    #[test]
    fn test_late_programming_result_after_release() {
        let (table, rx) = programmed_table(4);
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let desc = expect_program(&rx);
        table.release(index).unwrap();
        assert_eq!(table.reclaim(), 1);
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            table.complete_programming(index, desc.generation, Ok(handles(1))),
            Err(NextHopError::UnresolvedIndex(_))
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            OffloadRequest::Remove {
                family: AddressFamily::Inet,
                index,
                handles: handles(1),
            }
        );

        // Same while the slot is still draining behind a reader.
        let (index, _) = table.insert_or_share(vec![hop(2, 2)], RouteProtocol::BGP).unwrap();
        let desc = expect_program(&rx);
        let reader = table.get(index).unwrap();
        table.release(index).unwrap();
        assert!(table
            .complete_programming(index, desc.generation, Ok(handles(1)))
            .is_err());
        assert!(matches!(rx.try_recv().unwrap(), OffloadRequest::Remove { .. }));
        drop(reader);
        assert_eq!(table.reclaim(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_neighbor_change_while_pending_pushed_after_programming() {
        let (table, rx) = programmed_table(4);
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        let desc = expect_program(&rx);
        assert_eq!(desc.members[0].mac, None);

        let mac = [2, 0, 0, 0, 0, 1];
        let binding = LinkBindingRef::new(InterfaceRef::new(1), gw(1), Some(mac));
        assert_eq!(table.neigh_resolved(&binding), 1);
        assert!(rx.try_recv().is_err());

        table
            .complete_programming(index, desc.generation, Ok(handles(1)))
            .unwrap();
        match rx.try_recv().unwrap() {
            OffloadRequest::Update { group, handles: h } => {
                assert_eq!(group.index, index);
                assert_eq!(group.members[0].mac, Some(mac));
                assert_eq!(h, handles(1));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_offload_marks_error() {
        let (offload, rx) = ChannelOffload::new();
        drop(rx);
        let table = table(4).with_offload(Arc::new(offload));
        let (index, _) = table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        assert_eq!(table.get(index).unwrap().programmed_state(), ProgrammedState::Error);
        assert!(!table.retry_programming(index).unwrap());
    }

    #[test]
    fn test_snapshot_and_stats() {
        let table = table(4);
        table.insert_or_share(vec![hop(1, 1)], RouteProtocol::BGP).unwrap();
        table.insert_or_share(vec![hop(2, 2)], RouteProtocol::BGP).unwrap();
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].index, 1);

        let json = serde_json::to_value(table.stats()).unwrap();
        assert_eq!(json["family"], "inet");
        assert_eq!(json["in_use"], 2);
        assert_eq!(json["capacity"], 4);
    }
}
