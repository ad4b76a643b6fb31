//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use concord_store::client::Store;
use concord_store::db::Database;
use concord_store::schema::{NexthopRow, RouteRow, RowData, Table};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::{Nexthop, RouteKeyMsg, RouteMsg};
use ipnetwork::IpNetwork;
use tracing::debug;

use crate::batch::TxnBatch;
use crate::debug::Debug;
use crate::error::Error;
use crate::port::{self, L3Port};
use crate::rib::Rib;
use crate::selected;

// Converges the persisted connected routes of one port with its
// configured addresses: stale prefixes are deleted, missing ones inserted
// and the selected flags brought in line with the port's active state.
//
// Fails with `Error::TxnPending` when the batcher has a commit in flight;
// the port keeps its pending action and is retried on a later pass.
pub(crate) fn reconcile_port(
    port: &mut L3Port,
    store: &mut Store,
    batch: &mut TxnBatch,
    rib: &mut Rib,
) -> Result<(), Error> {
    let desired_v4 = port.desired_v4();
    let desired_v6 = port.desired_v6();

    // Delete connected routes whose address is gone.
    for prefix in port
        .connected_v4
        .keys()
        .filter(|prefix| !desired_v4.contains(prefix))
        .copied()
        .collect::<Vec<_>>()
    {
        delete_route(port, IpNetwork::V4(prefix), store, batch, rib)?;
        batch.finish(store, false);
    }
    for prefix in port
        .connected_v6
        .keys()
        .filter(|prefix| !desired_v6.contains(prefix))
        .copied()
        .collect::<Vec<_>>()
    {
        delete_route(port, IpNetwork::V6(prefix), store, batch, rib)?;
        batch.finish(store, false);
    }

    // Insert the missing ones.
    for prefix in desired_v4 {
        if port.connected_v4.contains_key(&prefix) {
            continue;
        }
        insert_route(port, IpNetwork::V4(prefix), store, batch, rib)?;
        batch.finish(store, false);
    }
    for prefix in desired_v6 {
        if port.connected_v6.contains_key(&prefix) {
            continue;
        }
        insert_route(port, IpNetwork::V6(prefix), store, batch, rib)?;
        batch.finish(store, false);
    }

    // Routes that survived unchanged still track the active state.
    selected::connected_flags_update(port, store, batch)
}

// Deletes all connected routes of a port that left the L3 domain.
pub(crate) fn cleanup_port(
    port: &mut L3Port,
    store: &mut Store,
    batch: &mut TxnBatch,
    rib: &mut Rib,
) -> Result<(), Error> {
    for prefix in port.connected_v4.keys().copied().collect::<Vec<_>>() {
        delete_route(port, IpNetwork::V4(prefix), store, batch, rib)?;
        batch.finish(store, false);
    }
    for prefix in port.connected_v6.keys().copied().collect::<Vec<_>>() {
        delete_route(port, IpNetwork::V6(prefix), store, batch, rib)?;
        batch.finish(store, false);
    }
    Ok(())
}

// Reinstates the RIB entries for a port's connected routes, used when the
// backing interface (and with it the ifindex) shows up late.
pub(crate) fn refresh_rib(port: &L3Port, db: &Database, rib: &mut Rib) {
    let ifindex = port::port_ifindex(db, port);
    if ifindex == 0 {
        return;
    }
    for prefix in port.connected_v4.keys() {
        rib.ip_route_add(connected_route_msg(IpNetwork::V4(*prefix), ifindex));
    }
    for prefix in port.connected_v6.keys() {
        rib.ip_route_add(connected_route_msg(IpNetwork::V6(*prefix), ifindex));
    }
}

// ===== helper functions =====

fn insert_route(
    port: &mut L3Port,
    prefix: IpNetwork,
    store: &mut Store,
    batch: &mut TxnBatch,
    rib: &mut Rib,
) -> Result<(), Error> {
    let ifindex = port::port_ifindex(&store.db, port);

    let txn = batch.ensure_open(store)?;
    let nexthop = txn.insert(RowData::Nexthop(NexthopRow {
        addr: None,
        ifname: Some(port.name.clone()),
        selected: port.active,
    }));
    batch.note_mutation();

    let txn = batch.ensure_open(store)?;
    let route = txn.insert(RowData::Route(RouteRow {
        prefix,
        protocol: Protocol::DIRECT,
        distance: 0,
        metric: 0,
        selected: port.active,
        nexthops: BTreeSet::from([nexthop]),
    }));
    batch.note_mutation();

    match prefix {
        IpNetwork::V4(prefix) => {
            port.connected_v4.insert(prefix, route);
        }
        IpNetwork::V6(prefix) => {
            port.connected_v6.insert(prefix, route);
        }
    }

    // Mirror the route into the RIB so it takes part in redistribution.
    if ifindex != 0 {
        rib.ip_route_add(connected_route_msg(prefix, ifindex));
    }

    Debug::ConnectedRouteInsert(&port.name, &prefix).log();
    Ok(())
}

fn delete_route(
    port: &mut L3Port,
    prefix: IpNetwork,
    store: &mut Store,
    batch: &mut TxnBatch,
    rib: &mut Rib,
) -> Result<(), Error> {
    let uuid = match prefix {
        IpNetwork::V4(prefix) => port.connected_v4.get(&prefix).copied(),
        IpNetwork::V6(prefix) => port.connected_v6.get(&prefix).copied(),
    };
    let Some(uuid) = uuid else {
        return Ok(());
    };

    if let Some(row) = store.db.routes.get(&uuid).cloned() {
        for nexthop in &row.nexthops {
            let txn = batch.ensure_open(store)?;
            txn.delete(Table::Nexthop, *nexthop);
            batch.note_mutation();
        }
        let txn = batch.ensure_open(store)?;
        txn.delete(Table::Route, uuid);
        batch.note_mutation();
    } else {
        // The row never materialized; unlink the reference only.
        debug!(name = %port.name, %prefix, %uuid,
            "connected route row not found");
    }

    match prefix {
        IpNetwork::V4(prefix) => {
            port.connected_v4.remove(&prefix);
        }
        IpNetwork::V6(prefix) => {
            port.connected_v6.remove(&prefix);
        }
    }
    rib.ip_route_del(RouteKeyMsg { protocol: Protocol::DIRECT, prefix });

    Debug::ConnectedRouteDelete(&port.name, &prefix).log();
    Ok(())
}

fn connected_route_msg(prefix: IpNetwork, ifindex: u32) -> RouteMsg {
    RouteMsg {
        protocol: Protocol::DIRECT,
        prefix,
        distance: 0,
        metric: 0,
        nexthops: BTreeSet::from([Nexthop::Interface { ifindex }]),
    }
}
