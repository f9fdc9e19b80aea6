use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, ensure};
use arc_swap::ArcSwap;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ipnet::IpNet;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mvirt_nexthop::config::{NexthopConfig, RouteEntry, RouteFile};
use mvirt_nexthop::group::{GroupSnapshot, HardwareHandles, HwHandle};
use mvirt_nexthop::offload::{ChannelOffload, NoOffload, OffloadRequest};
use mvirt_nexthop::select::{ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use mvirt_nexthop::{
    AddressFamily, FlowFields, InterfaceRef, LinkBindingRef, NextHopError, NextHopResolver, TableStats,
};

mod fib;

use fib::{Fib, FibEntry, SharedFib};

#[derive(Parser)]
#[command(name = "mvirt-nexthop")]
#[command(about = "mvirt next-hop resolution tool")]
struct Cli {
    /// Config file (JSON); defaults apply when it does not exist
    #[arg(short, long, default_value = "/etc/mvirt/nexthop.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a route file and print the resulting tables
    Show {
        /// Route file (JSON)
        #[arg(short, long)]
        routes: PathBuf,
    },
    /// Forward synthetic traffic while neighbors and routes flap
    Forward(ForwardArgs),
}

#[derive(Args)]
struct ForwardArgs {
    /// Route file (JSON)
    #[arg(short, long)]
    routes: PathBuf,

    /// Forwarding threads
    #[arg(long, default_value_t = 4)]
    readers: usize,

    /// Run time in milliseconds
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_nexthop=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = NexthopConfig::load(&cli.config)?;

    match cli.command {
        Command::Show { routes } => show(&config, &routes),
        Command::Forward(args) => forward(&config, &args),
    }
}

#[derive(Serialize)]
struct ResolvedRoute {
    prefix: IpNet,
    family: AddressFamily,
    index: u32,
}

#[derive(Serialize)]
struct TableReport {
    stats: TableStats,
    groups: Vec<GroupSnapshot>,
}

#[derive(Serialize)]
struct ShowReport {
    routes: Vec<ResolvedRoute>,
    tables: Vec<TableReport>,
}

fn resolve(resolver: &NextHopResolver, route: &RouteEntry) -> Result<u32> {
    resolver
        .resolve_route(route.family(), route.members()?, route.protocol())
        .with_context(|| format!("Failed to resolve route {}", route.prefix))
}

fn show(config: &NexthopConfig, path: &Path) -> Result<()> {
    let routes = RouteFile::load(path)?.routes;
    let resolver = NextHopResolver::from_config(config, Arc::new(NoOffload))?;

    let mut resolved = Vec::with_capacity(routes.len());
    for route in &routes {
        let index = resolve(&resolver, route)?;
        resolved.push(ResolvedRoute {
            prefix: route.prefix,
            family: route.family(),
            index,
        });
    }

    let mut tables = Vec::new();
    for family in [AddressFamily::Inet, AddressFamily::Inet6] {
        let table = resolver.table(family)?;
        tables.push(TableReport {
            stats: table.stats(),
            groups: table.snapshot(),
        });
    }

    let report = ShowReport {
        routes: resolved,
        tables,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    rerouted: AtomicU64,
    no_route: AtomicU64,
}

#[derive(Debug, Default, Serialize)]
struct ControlStats {
    neighbor_updates: u64,
    route_flaps: u64,
    reclaimed: u64,
}

#[derive(Debug, Default, Serialize)]
struct OffloadStats {
    programmed: u64,
    updated: u64,
    removed: u64,
}

#[derive(Serialize)]
struct ForwardReport {
    forwarded: u64,
    rerouted: u64,
    no_route: u64,
    control: ControlStats,
    offload: OffloadStats,
    tables: Vec<TableStats>,
}

fn forward(config: &NexthopConfig, args: &ForwardArgs) -> Result<()> {
    let routes = RouteFile::load(&args.routes)?.routes;
    ensure!(!routes.is_empty(), "Route file {} has no routes", args.routes.display());

    let (offload, requests) = ChannelOffload::new();
    let resolver = NextHopResolver::from_config(config, Arc::new(offload))?;

    let fib: SharedFib = Arc::new(ArcSwap::from_pointee(Fib::default()));
    let mut installed = Vec::with_capacity(routes.len());
    for route in &routes {
        let index = resolve(&resolver, route)?;
        fib::update(&fib, |f| {
            f.insert(
                route.prefix,
                FibEntry {
                    family: route.family(),
                    index,
                },
            );
        });
        installed.push(index);
    }

    let destinations: Vec<IpAddr> = routes
        .iter()
        .map(|r| r.prefix.hosts().next().unwrap_or_else(|| r.prefix.addr()))
        .collect();
    let counters = Counters::default();
    let stop = AtomicBool::new(false);
    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);

    info!(readers = args.readers, routes = routes.len(), "Starting forwarding run");

    let (control, offload) = thread::scope(|s| -> Result<_> {
        let (resolver, fib, counters, stop) = (&resolver, &fib, &counters, &stop);
        let (destinations, requests) = (&destinations, &requests);

        let worker = s.spawn(move || offload_worker(resolver, requests, stop));
        for id in 0..args.readers {
            s.spawn(move || forward_loop(id, fib, resolver, destinations, counters, stop));
        }

        let control = control_loop(resolver, fib, &routes, &mut installed, deadline);
        stop.store(true, Ordering::Relaxed);

        let offload = worker
            .join()
            .map_err(|_| anyhow!("offload worker panicked"))?;
        Ok((control?, offload))
    })?;

    let report = ForwardReport {
        forwarded: counters.forwarded.load(Ordering::Relaxed),
        rerouted: counters.rerouted.load(Ordering::Relaxed),
        no_route: counters.no_route.load(Ordering::Relaxed),
        control,
        offload,
        tables: resolver.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

enum Outcome {
    Forwarded,
    Rerouted,
    NoRoute,
}

fn ether_type(family: AddressFamily) -> u16 {
    match family {
        AddressFamily::Inet => ETHERTYPE_IPV4,
        AddressFamily::Inet6 => ETHERTYPE_IPV6,
    }
}

fn source_for(dst: IpAddr) -> IpAddr {
    match dst {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0xffff, 0, 0, 0, 0, 1)),
    }
}

fn forward_one(fib: &SharedFib, resolver: &NextHopResolver, flow: &FlowFields) -> Outcome {
    // A group can be retired between the FIB read and the selection; the
    // route is looked up again once.
    for attempt in 0..2 {
        let Some(entry) = fib.load().lookup(flow.dst) else {
            return Outcome::NoRoute;
        };
        match resolver.select_for_packet(entry.family, entry.index, flow, ether_type(entry.family)) {
            Ok(_) if attempt == 0 => return Outcome::Forwarded,
            Ok(_) => return Outcome::Rerouted,
            Err(NextHopError::UnresolvedIndex(_)) => continue,
            Err(_) => return Outcome::NoRoute,
        }
    }
    Outcome::NoRoute
}

fn forward_loop(
    id: usize,
    fib: &SharedFib,
    resolver: &NextHopResolver,
    destinations: &[IpAddr],
    counters: &Counters,
    stop: &AtomicBool,
) {
    let (mut forwarded, mut rerouted, mut no_route) = (0u64, 0u64, 0u64);
    let mut port = (id as u16).wrapping_mul(7919);

    while !stop.load(Ordering::Relaxed) {
        for &dst in destinations {
            port = port.wrapping_add(1);
            let flow = FlowFields::new(source_for(dst), dst).with_ports(17, port, 4789);
            match forward_one(fib, resolver, &flow) {
                Outcome::Forwarded => forwarded += 1,
                Outcome::Rerouted => rerouted += 1,
                Outcome::NoRoute => no_route += 1,
            }
        }
    }

    counters.forwarded.fetch_add(forwarded, Ordering::Relaxed);
    counters.rerouted.fetch_add(rerouted, Ordering::Relaxed);
    counters.no_route.fetch_add(no_route, Ordering::Relaxed);
    debug!(id, forwarded, rerouted, no_route, "Forwarding thread done");
}

/// Gateways in the route file, each once.
fn neighbors(routes: &[RouteEntry]) -> Vec<(InterfaceRef, IpAddr)> {
    let mut seen = Vec::new();
    for path in routes.iter().flat_map(|r| &r.paths) {
        if let (Some(if_index), Some(gateway)) = (path.interface, path.gateway) {
            let key = (InterfaceRef::new(if_index), gateway);
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
    }
    seen
}

/// Flap one neighbor and one route per round until `deadline`.
fn control_loop(
    resolver: &NextHopResolver,
    fib: &SharedFib,
    routes: &[RouteEntry],
    installed: &mut [u32],
    deadline: Instant,
) -> Result<ControlStats> {
    let neighbors = neighbors(routes);
    let mut stats = ControlStats::default();
    let mut round = 0usize;

    while Instant::now() < deadline {
        if !neighbors.is_empty() {
            let (ifp, gateway) = neighbors[round % neighbors.len()];
            let mac = [0x02, 0, 0, 0, (round >> 8) as u8, round as u8];
            let binding = LinkBindingRef::new(ifp, gateway, Some(mac));
            let mut updates = resolver.neigh_created(&binding)? + resolver.neigh_resolved(&binding)?;
            if round % 2 == 1 {
                updates += resolver.neigh_expired(&binding)? + resolver.neigh_removed(&binding)?;
            }
            stats.neighbor_updates += updates as u64;
        }

        let slot = round % routes.len();
        let route = &routes[slot];
        fib::update(fib, |f| {
            f.remove(&route.prefix);
        });
        resolver.withdraw_route(route.family(), installed[slot])?;
        let index = resolve(resolver, route)?;
        fib::update(fib, |f| {
            f.insert(
                route.prefix,
                FibEntry {
                    family: route.family(),
                    index,
                },
            );
        });
        installed[slot] = index;
        stats.route_flaps += 1;

        stats.reclaimed += resolver.reclaim() as u64;
        round += 1;
        thread::yield_now();
    }

    info!(rounds = round, "Control loop finished");
    Ok(stats)
}

/// Stand-in for a hardware driver: hands out sequential handles.
fn offload_worker(resolver: &NextHopResolver, requests: &Receiver<OffloadRequest>, stop: &AtomicBool) -> OffloadStats {
    let mut stats = OffloadStats::default();
    let mut next_handle = 1u64;

    loop {
        let request = match requests.recv_timeout(Duration::from_millis(10)) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) if stop.load(Ordering::Relaxed) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match request {
            OffloadRequest::Program(group) => {
                let siblings = group.members.len() as u64;
                let handles = HardwareHandles {
                    group: HwHandle(next_handle),
                    members: (1..=siblings).map(|i| HwHandle(next_handle + i)).collect(),
                };
                next_handle += siblings + 1;

                let result = resolver
                    .table(group.family)
                    .and_then(|table| table.complete_programming(group.index, group.generation, Ok(handles)));
                match result {
                    Ok(()) => stats.programmed += 1,
                    Err(e) => debug!(index = group.index, error = %e, "Dropped programming result"),
                }
            }
            OffloadRequest::Update { .. } => stats.updated += 1,
            OffloadRequest::Remove { .. } => stats.removed += 1,
        }
    }

    stats
}
