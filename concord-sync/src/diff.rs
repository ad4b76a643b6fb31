//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use concord_store::db::Database;
use concord_utils::ip::{AddressFamilies, AddressFamily};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::Nexthop;
use ipnetwork::IpNetwork;
use tracing::debug;

use crate::Interface;
use crate::debug::Debug;
use crate::rib::{Rib, RouteFlags};

// Identity of one (route, nexthop) pair, comparable across the RIB and
// the store.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RouteDiffKey {
    pub prefix: IpNetwork,
    pub nexthop: NexthopDiffKey,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum NexthopDiffKey {
    Address(IpAddr),
    Interface(String),
}

// RIB nexthop scheduled for deletion.
#[derive(Clone, Debug)]
pub struct PendingDeletion {
    pub prefix: IpNetwork,
    pub protocol: Protocol,
    pub distance: u32,
    pub nexthop: Nexthop,
}

// ===== global functions =====

// Deletes RIB routes that no longer have a persisted counterpart.
//
// Connected routes are exempt: their lifecycle is tied to port addresses,
// not to what protocol engines keep persisted.
pub(crate) fn run(
    rib: &mut Rib,
    db: &Database,
    interfaces: &BTreeMap<String, Interface>,
) {
    let keys = build_store_keys(db);
    let deletions = find_orphans(rib, interfaces, &keys);
    if deletions.is_empty() {
        return;
    }
    debug!(count = deletions.len(), "deleting stale routes");
    apply_deletions(rib, deletions);
}

// Collects the identity keys of every persisted (route, nexthop) pair,
// separated by address family.
pub(crate) fn build_store_keys(
    db: &Database,
) -> AddressFamilies<HashSet<RouteDiffKey>> {
    let mut keys = AddressFamilies::<HashSet<RouteDiffKey>>::default();
    for row in db.routes.values() {
        let family = match row.prefix {
            IpNetwork::V4(_) => AddressFamily::Ipv4,
            IpNetwork::V6(_) => AddressFamily::Ipv6,
        };
        for nexthop_uuid in &row.nexthops {
            let Some(nh_row) = db.nexthops.get(nexthop_uuid) else {
                continue;
            };
            let nexthop = if let Some(addr) = nh_row.addr {
                NexthopDiffKey::Address(addr)
            } else if let Some(ifname) = &nh_row.ifname {
                NexthopDiffKey::Interface(ifname.clone())
            } else {
                continue;
            };
            keys.get_mut(family)
                .insert(RouteDiffKey { prefix: row.prefix, nexthop });
        }
    }
    keys
}

// Walks the RIB and returns the nexthops with no matching store key.
pub(crate) fn find_orphans(
    rib: &Rib,
    interfaces: &BTreeMap<String, Interface>,
    keys: &AddressFamilies<HashSet<RouteDiffKey>>,
) -> Vec<PendingDeletion> {
    // Interface nexthops are persisted by name.
    let ifnames: HashMap<u32, &str> = interfaces
        .values()
        .map(|iface| (iface.ifindex, iface.ifname.as_str()))
        .collect();

    let mut deletions = Vec::new();
    let ipv4 = rib.ipv4.iter().map(|(prefix, routes)| {
        (IpNetwork::V4(*prefix), AddressFamily::Ipv4, routes)
    });
    let ipv6 = rib.ipv6.iter().map(|(prefix, routes)| {
        (IpNetwork::V6(*prefix), AddressFamily::Ipv6, routes)
    });
    for (prefix, family, routes) in ipv4.chain(ipv6) {
        let keys = keys.get(family);
        for (&distance, route) in routes {
            if route.protocol == Protocol::DIRECT
                || route.flags.contains(RouteFlags::REMOVED)
            {
                continue;
            }
            for nexthop in &route.nexthops {
                let diff_nexthop = match nexthop {
                    Nexthop::Address { addr, .. } => {
                        NexthopDiffKey::Address(*addr)
                    }
                    Nexthop::Interface { ifindex } => {
                        // Unresolvable nexthops can't be compared.
                        let Some(ifname) = ifnames.get(ifindex) else {
                            continue;
                        };
                        NexthopDiffKey::Interface((*ifname).to_owned())
                    }
                };
                let key = RouteDiffKey { prefix, nexthop: diff_nexthop };
                if !keys.contains(&key) {
                    deletions.push(PendingDeletion {
                        prefix,
                        protocol: route.protocol,
                        distance,
                        nexthop: nexthop.clone(),
                    });
                }
            }
        }
    }
    deletions
}

// Removes the orphaned nexthops from the RIB. Routes left without any
// nexthop are marked for removal; the update queue takes care of the
// kernel state either way.
pub(crate) fn apply_deletions(
    rib: &mut Rib,
    deletions: Vec<PendingDeletion>,
) {
    for deletion in deletions {
        let routes = match deletion.prefix {
            IpNetwork::V4(prefix) => rib.ipv4.get_mut(&prefix),
            IpNetwork::V6(prefix) => rib.ipv6.get_mut(&prefix),
        };
        let Some(routes) = routes else {
            continue;
        };
        let Some(route) = routes.get_mut(&deletion.distance) else {
            continue;
        };
        if route.protocol != deletion.protocol
            || !route.nexthops.remove(&deletion.nexthop)
        {
            continue;
        }
        if route.nexthops.is_empty() {
            route.flags.insert(RouteFlags::REMOVED);
        }
        Debug::StaleRouteDelete(&deletion.prefix, deletion.protocol).log();
        rib.update_queue_add(deletion.prefix);
    }
}
