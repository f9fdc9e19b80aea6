//! Hardware offload collaborator.
//!
//! The table describes groups to the offload side and later receives opaque
//! handles (or a failure) back through `NextHopTable::complete_programming`.
//! Handle contents are never interpreted here.

use std::fmt;
use std::net::IpAddr;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use tracing::debug;

use crate::error::OffloadError;
use crate::family::AddressFamily;
use crate::group::{HardwareHandles, NextHopGroup};

/// One member as the offload side sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDescriptor {
    pub interface: Option<u32>,
    pub gateway: Option<IpAddr>,
    pub labels: Vec<u32>,
    /// Destination MAC once the neighbor is confirmed.
    pub mac: Option<[u8; 6]>,
}

/// A group as the offload side sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDescriptor {
    pub family: AddressFamily,
    pub index: u32,
    /// Distinguishes successive groups that reuse the same slot.
    pub generation: u64,
    pub members: Vec<MemberDescriptor>,
}

impl GroupDescriptor {
    pub fn of(family: AddressFamily, group: &NextHopGroup) -> Self {
        GroupDescriptor {
            family,
            index: group.index(),
            generation: group.generation(),
            members: group
                .members()
                .iter()
                .map(|nh| MemberDescriptor {
                    interface: nh.interface().map(|i| i.if_index()),
                    gateway: nh.gateway(),
                    labels: nh
                        .labels()
                        .map(|l| l.as_slice().to_vec())
                        .unwrap_or_default(),
                    mac: nh
                        .link_binding()
                        .filter(|_| nh.is_neigh_present())
                        .and_then(|b| b.mac()),
                })
                .collect(),
        }
    }
}

/// Hardware programming collaborator.
pub trait Offload: Send + Sync + fmt::Debug {
    /// Ask for a new group to be programmed. The outcome is delivered
    /// asynchronously through `complete_programming`.
    fn program(&self, group: GroupDescriptor) -> Result<(), OffloadError>;

    /// A programmed group was republished with changed member state.
    fn update(&self, group: GroupDescriptor, handles: &HardwareHandles) -> Result<(), OffloadError>;

    /// A group was freed; its hardware objects can go.
    fn remove(&self, family: AddressFamily, index: u32, handles: HardwareHandles);
}

/// Software-only forwarding. Groups stay `Pending`.
#[derive(Debug, Default)]
pub struct NoOffload;

impl Offload for NoOffload {
    fn program(&self, _group: GroupDescriptor) -> Result<(), OffloadError> {
        Ok(())
    }

    fn update(&self, _group: GroupDescriptor, _handles: &HardwareHandles) -> Result<(), OffloadError> {
        Ok(())
    }

    fn remove(&self, _family: AddressFamily, _index: u32, _handles: HardwareHandles) {}
}

/// Requests sent to an offload worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadRequest {
    Program(GroupDescriptor),
    Update {
        group: GroupDescriptor,
        handles: HardwareHandles,
    },
    Remove {
        family: AddressFamily,
        index: u32,
        handles: HardwareHandles,
    },
}

/// Forwards requests over a channel to a worker thread that talks to the
/// hardware and reports back through `complete_programming`.
#[derive(Debug, Clone)]
pub struct ChannelOffload {
    tx: Sender<OffloadRequest>,
}

impl ChannelOffload {
    /// Create the offload handle and the worker's receiving end.
    pub fn new() -> (Self, Receiver<OffloadRequest>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ChannelOffload { tx }, rx)
    }

    fn send(&self, request: OffloadRequest) -> Result<(), OffloadError> {
        self.tx
            .send(request)
            .map_err(|_| OffloadError::Disconnected)
    }
}

impl Offload for ChannelOffload {
    fn program(&self, group: GroupDescriptor) -> Result<(), OffloadError> {
        debug!(index = group.index, siblings = group.members.len(), "Requesting group programming");
        self.send(OffloadRequest::Program(group))
    }

    fn update(&self, group: GroupDescriptor, handles: &HardwareHandles) -> Result<(), OffloadError> {
        self.send(OffloadRequest::Update {
            group,
            handles: handles.clone(),
        })
    }

    fn remove(&self, family: AddressFamily, index: u32, handles: HardwareHandles) {
        // Worker gone means the hardware state went with it.
        let _ = self.send(OffloadRequest::Remove {
            family,
            index,
            handles,
        });
    }
}
