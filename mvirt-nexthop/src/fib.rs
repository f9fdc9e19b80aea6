//! Longest-prefix-match route table mapping prefixes to next-hop indices.
//!
//! Forwarding threads read a published snapshot; the control thread builds
//! a modified copy and swaps it in.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use mvirt_nexthop::AddressFamily;
use prefix_trie::PrefixMap;

/// A route's resolved group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibEntry {
    pub family: AddressFamily,
    pub index: u32,
}

#[derive(Clone)]
pub struct Fib {
    ipv4: PrefixMap<Ipv4Net, FibEntry>,
    ipv6: PrefixMap<Ipv6Net, FibEntry>,
}

impl Default for Fib {
    fn default() -> Self {
        Fib {
            ipv4: PrefixMap::new(),
            ipv6: PrefixMap::new(),
        }
    }
}

impl Fib {
    pub fn insert(&mut self, prefix: IpNet, entry: FibEntry) -> Option<FibEntry> {
        match prefix {
            IpNet::V4(p) => self.ipv4.insert(p, entry),
            IpNet::V6(p) => self.ipv6.insert(p, entry),
        }
    }

    pub fn remove(&mut self, prefix: &IpNet) -> Option<FibEntry> {
        match prefix {
            IpNet::V4(p) => self.ipv4.remove(p),
            IpNet::V6(p) => self.ipv6.remove(p),
        }
    }

    /// Longest matching route for `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<FibEntry> {
        match addr {
            IpAddr::V4(a) => {
                let host = Ipv4Net::new(a, 32).ok()?;
                self.ipv4.get_lpm(&host).map(|(_, e)| *e)
            }
            IpAddr::V6(a) => {
                let host = Ipv6Net::new(a, 128).ok()?;
                self.ipv6.get_lpm(&host).map(|(_, e)| *e)
            }
        }
    }
}

/// Fib shared between the control thread and forwarding threads.
pub type SharedFib = Arc<ArcSwap<Fib>>;

/// Publish a copy of the current FIB with `f` applied.
pub fn update(fib: &SharedFib, f: impl FnOnce(&mut Fib)) {
    let mut next = Fib::clone(&fib.load());
    f(&mut next);
    fib.store(Arc::new(next));
}
