//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use concord_store::client::Store;
use concord_utils::ibus::IbusSender;
use concord_utils::protocol::Protocol;
use concord_utils::southbound::{Nexthop, RouteKeyMsg, RouteMsg};
use concord_utils::{UnboundedReceiver, UnboundedSender};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use prefix_trie::PrefixMap;
use tokio::sync::mpsc;

use crate::batch::TxnBatch;
use crate::error::Error;
use crate::ibus;
use crate::netlink::NetlinkHandle;
use crate::selected;
use crate::Interface;

#[derive(Debug)]
pub struct Rib {
    pub ipv4: PrefixMap<Ipv4Network, BTreeMap<u32, Route>>,
    pub ipv6: PrefixMap<Ipv6Network, BTreeMap<u32, Route>>,
    // Prefixes whose entries changed and await reprocessing.
    update_queue: BTreeSet<IpNetwork>,
    update_queue_tx: UnboundedSender<()>,
    pub(crate) update_queue_rx: UnboundedReceiver<()>,
    // Prefixes whose selected flags could not be persisted yet.
    selected_retry: BTreeSet<IpNetwork>,
}

#[derive(Debug)]
pub struct Route {
    pub protocol: Protocol,
    pub distance: u32,
    pub metric: u32,
    pub nexthops: BTreeSet<Nexthop>,
    pub last_updated: DateTime<Utc>,
    pub flags: RouteFlags,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RouteFlags: u8 {
        const ACTIVE = 0x01;
        const REMOVED = 0x02;
    }
}

// ===== impl Rib =====

impl Rib {
    fn prefix_entry(&mut self, prefix: IpNetwork) -> &mut BTreeMap<u32, Route> {
        match prefix {
            IpNetwork::V4(prefix) => self.ipv4.entry(prefix).or_default(),
            IpNetwork::V6(prefix) => self.ipv6.entry(prefix).or_default(),
        }
    }

    // Adds or updates a route, keyed by prefix and administrative
    // distance. No-op updates are filtered out to keep reprocessing from
    // cascading.
    pub(crate) fn ip_route_add(&mut self, msg: RouteMsg) {
        match self.prefix_entry(msg.prefix).entry(msg.distance) {
            Entry::Occupied(mut o) => {
                let route = o.get_mut();
                if route.protocol == msg.protocol
                    && route.metric == msg.metric
                    && route.nexthops == msg.nexthops
                    && !route.flags.contains(RouteFlags::REMOVED)
                {
                    return;
                }
                route.protocol = msg.protocol;
                route.metric = msg.metric;
                route.nexthops = msg.nexthops;
                route.last_updated = Utc::now();
                route.flags.remove(RouteFlags::REMOVED);
            }
            Entry::Vacant(v) => {
                v.insert(Route {
                    protocol: msg.protocol,
                    distance: msg.distance,
                    metric: msg.metric,
                    nexthops: msg.nexthops,
                    last_updated: Utc::now(),
                    flags: RouteFlags::empty(),
                });
            }
        }
        self.update_queue_add(msg.prefix);
    }

    // Applies a persisted route row to the RIB. Entries of the same
    // protocol at another distance are leftovers of a row update and are
    // marked for removal before the new entry is added.
    pub(crate) fn ip_route_replace(&mut self, msg: RouteMsg) {
        let mut stale = false;
        for route in self
            .prefix_entry(msg.prefix)
            .iter_mut()
            .filter(|(distance, route)| {
                **distance != msg.distance && route.protocol == msg.protocol
            })
            .map(|(_, route)| route)
        {
            route.flags.insert(RouteFlags::REMOVED);
            stale = true;
        }
        if stale {
            self.update_queue_add(msg.prefix);
        }
        self.ip_route_add(msg);
    }

    // Marks matching routes for removal. The actual uninstall happens when
    // the update queue is processed.
    pub(crate) fn ip_route_del(&mut self, msg: RouteKeyMsg) {
        let mut changed = false;
        for route in self
            .prefix_entry(msg.prefix)
            .values_mut()
            .filter(|route| route.protocol == msg.protocol)
        {
            route.flags.insert(RouteFlags::REMOVED);
            changed = true;
        }
        if changed {
            self.update_queue_add(msg.prefix);
        }
    }

    pub(crate) fn update_queue_add(&mut self, prefix: IpNetwork) {
        self.update_queue.insert(prefix);
        let _ = self.update_queue_tx.send(());
    }

    // Requeues prefixes whose selected flags are still unpersisted. Called
    // once the blocking commit completes.
    pub(crate) fn flush_selected_retry(&mut self) {
        for prefix in std::mem::take(&mut self.selected_retry) {
            self.update_queue_add(prefix);
        }
    }

    // Processes the update queue: uninstalls removed routes, programs the
    // best remaining route of each prefix and synchronizes the persisted
    // selected flags.
    pub(crate) async fn process_update_queue(
        &mut self,
        netlink: &NetlinkHandle,
        interfaces: &BTreeMap<String, Interface>,
        store: &mut Store,
        batch: &mut TxnBatch,
        ibus_tx: &IbusSender,
    ) {
        for prefix in std::mem::take(&mut self.update_queue) {
            let routes = match prefix {
                IpNetwork::V4(prefix) => self.ipv4.entry(prefix).or_default(),
                IpNetwork::V6(prefix) => self.ipv6.entry(prefix).or_default(),
            };

            // Uninstall and drop routes marked for removal.
            let mut removed = Vec::new();
            routes.retain(|_, route| {
                if route.flags.contains(RouteFlags::REMOVED) {
                    removed.push((route.protocol, route.flags));
                    false
                } else {
                    true
                }
            });
            for (protocol, flags) in removed {
                if flags.contains(RouteFlags::ACTIVE) {
                    if protocol != Protocol::DIRECT {
                        netlink.route_uninstall(&prefix).await;
                    }
                    ibus::notify_redistribute_del(ibus_tx, protocol, prefix);
                }
            }

            // The entry with the lowest administrative distance wins.
            let mut iter = routes.values_mut();
            if let Some(route) = iter.next() {
                route.flags.insert(RouteFlags::ACTIVE);
                if route.protocol != Protocol::DIRECT
                    && netlink.route_install(&prefix, route).await
                    && let Err(error) = selected::route_installed(
                        store, batch, interfaces, &prefix, route,
                    )
                {
                    if matches!(error, Error::TxnPending) {
                        self.selected_retry.insert(prefix);
                    }
                    error.log();
                }
                ibus::notify_redistribute_add(ibus_tx, prefix, route);
            }
            for route in iter {
                route.flags.remove(RouteFlags::ACTIVE);
            }
        }
    }

    // Renders all routes for state dumps, best entries first.
    pub(crate) fn iter_all(&self) -> impl Iterator<Item = (IpNetwork, &Route)> {
        let ipv4 = self
            .ipv4
            .iter()
            .flat_map(|(prefix, routes)| {
                routes.values().map(|route| (IpNetwork::V4(*prefix), route))
            });
        let ipv6 = self
            .ipv6
            .iter()
            .flat_map(|(prefix, routes)| {
                routes.values().map(|route| (IpNetwork::V6(*prefix), route))
            });
        ipv4.chain(ipv6)
    }
}

impl Default for Rib {
    fn default() -> Rib {
        let (update_queue_tx, update_queue_rx) = mpsc::unbounded_channel();
        Rib {
            ipv4: Default::default(),
            ipv6: Default::default(),
            update_queue: Default::default(),
            update_queue_tx,
            update_queue_rx,
            selected_retry: Default::default(),
        }
    }
}
