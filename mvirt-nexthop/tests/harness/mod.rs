//! Shared helpers for next-hop integration tests.

#![allow(dead_code)]

pub mod offload;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use mvirt_nexthop::{Inet, InterfaceRef, NextHop, NextHopTable};

pub use offload::{Recorded, RecordingOffload};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

pub fn v4(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 20, 0, last))
}

/// Gateway hop `10.20.0.<last>` through interface `if_index`.
pub fn hop(if_index: u32, last: u8) -> NextHop {
    NextHop::via(InterfaceRef::new(if_index), v4(last))
}

pub fn inet_table(capacity: u32) -> NextHopTable {
    NextHopTable::new(Arc::new(Inet), capacity)
}
