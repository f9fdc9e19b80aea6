//! Table sizing and route files.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::family::{AddressFamily, Inet, Inet6};
use crate::group::RouteProtocol;
use crate::nexthop::{InterfaceRef, NextHop, NextHopFlags};
use crate::offload::Offload;
use crate::table::{DEFAULT_MAX_PATHS, MAX_CAPACITY, NextHopTable};

/// Smallest table a config may ask for.
pub const MIN_CAPACITY: u32 = 256;

const DEFAULT_CAPACITY: u32 = 65536;

/// Next-hop subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NexthopConfig {
    /// Slots in the IPv4 table.
    pub inet_capacity: u32,
    /// Slots in the IPv6 table.
    pub inet6_capacity: u32,
    /// Members multipath selection considers (0 = all).
    pub ecmp_max_paths: usize,
    /// Members a single group may hold.
    pub max_paths: usize,
}

impl Default for NexthopConfig {
    fn default() -> Self {
        Self {
            inet_capacity: DEFAULT_CAPACITY,
            inet6_capacity: DEFAULT_CAPACITY,
            ecmp_max_paths: 0,
            max_paths: DEFAULT_MAX_PATHS,
        }
    }
}

impl NexthopConfig {
    /// Load and validate a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, capacity) in [
            ("inet_capacity", self.inet_capacity),
            ("inet6_capacity", self.inet6_capacity),
        ] {
            if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
                bail!("{name} must be between {MIN_CAPACITY} and {MAX_CAPACITY}, got {capacity}");
            }
        }
        if self.max_paths == 0 || self.max_paths > DEFAULT_MAX_PATHS {
            bail!(
                "max_paths must be between 1 and {DEFAULT_MAX_PATHS}, got {}",
                self.max_paths
            );
        }
        Ok(())
    }

    pub fn capacity(&self, family: AddressFamily) -> u32 {
        match family {
            AddressFamily::Inet => self.inet_capacity,
            AddressFamily::Inet6 => self.inet6_capacity,
        }
    }

    /// Empty table for `family` sized and bounded by this config.
    pub fn build_table(&self, family: AddressFamily, offload: Arc<dyn Offload>) -> NextHopTable {
        let table = match family {
            AddressFamily::Inet => NextHopTable::new(Arc::new(Inet), self.inet_capacity),
            AddressFamily::Inet6 => NextHopTable::new(Arc::new(Inet6), self.inet6_capacity),
        };
        table
            .with_offload(offload)
            .with_max_paths(self.max_paths)
            .with_ecmp_max_paths(self.ecmp_max_paths)
    }
}

/// A set of routes to resolve, as read from a route file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFile {
    pub routes: Vec<RouteEntry>,
}

impl RouteFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read route file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse route file {}", path.display()))
    }
}

/// One route: a prefix and the paths it forwards over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: IpNet,
    #[serde(default = "default_protocol")]
    pub protocol: u8,
    pub paths: Vec<PathEntry>,
}

fn default_protocol() -> u8 {
    RouteProtocol::STATIC.0
}

impl RouteEntry {
    pub fn family(&self) -> AddressFamily {
        match self.prefix {
            IpNet::V4(_) => AddressFamily::Inet,
            IpNet::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn protocol(&self) -> RouteProtocol {
        RouteProtocol(self.protocol)
    }

    /// Group members for this route, in path order.
    pub fn members(&self) -> Result<Vec<NextHop>> {
        self.paths
            .iter()
            .map(PathEntry::to_nexthop)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid path for route {}", self.prefix))
    }
}

/// One path of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub interface: Option<u32>,
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub labels: Vec<u32>,
    /// Flag names, e.g. `"dead"` or `"blackhole"`. `gateway` is implied by
    /// a gateway address.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl PathEntry {
    pub fn to_nexthop(&self) -> Result<NextHop> {
        let mut flags = NextHopFlags::empty();
        for name in &self.flags {
            let Some(flag) = NextHopFlags::from_name(&name.to_ascii_uppercase()) else {
                bail!("unknown next-hop flag '{name}'");
            };
            flags |= flag;
        }
        if self.gateway.is_some() {
            flags |= NextHopFlags::GATEWAY;
        }

        Ok(NextHop::create(
            self.interface.map(InterfaceRef::new),
            self.gateway,
            flags,
            &self.labels,
        )?)
    }
}
