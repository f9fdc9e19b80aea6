//! Error types for next-hop resolution.

use thiserror::Error;

use crate::family::AddressFamily;

/// Errors returned by table and resolver operations.
///
/// None of these are fatal to the process. Reference-count underflow is not
/// represented here: it is a contract violation and panics.
#[derive(Debug, Error)]
pub enum NextHopError {
    #[error("{family} next-hop table exhausted ({capacity} slots in use)")]
    AllocationExhausted { family: AddressFamily, capacity: u32 },

    #[error("label stack of {len} labels exceeds maximum of {max}")]
    InvalidLabelStack { len: usize, max: usize },

    #[error("invalid MPLS label value: {0:#x}")]
    InvalidLabel(u32),

    #[error("next-hop index {0} does not reference a live group")]
    UnresolvedIndex(u32),

    #[error("hardware programming failed for group {index}: {source}")]
    HardwareProgrammingError {
        index: u32,
        #[source]
        source: OffloadError,
    },

    #[error("address family {0} is not registered")]
    FamilyNotRegistered(AddressFamily),

    #[error("address family {0} is already registered")]
    FamilyAlreadyRegistered(AddressFamily),

    #[error("next-hop group has no members")]
    EmptyGroup,

    #[error("next-hop group has {count} members, maximum is {max}")]
    TooManyPaths { count: usize, max: usize },

    #[error("gateway {gateway} does not belong to the {family} table")]
    FamilyMismatch {
        family: AddressFamily,
        gateway: std::net::IpAddr,
    },

    #[error("member {sibling} of group {index} does not use the given neighbor")]
    NeighborMismatch { index: u32, sibling: usize },
}

/// Failure reported by a hardware offload collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OffloadError {
    #[error("offload rejected group: {0}")]
    Rejected(String),

    #[error("expected {expected} member handles, got {actual}")]
    MemberCountMismatch { expected: usize, actual: usize },

    #[error("group is not awaiting programming")]
    NotPending,

    #[error("offload worker unavailable")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, NextHopError>;
