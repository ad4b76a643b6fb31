//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use concord_store::client::Store;
use concord_store::schema::{NexthopRow, RouteRow, RowData, RowUuid, Table};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::{Nexthop, RouteKeyMsg, RouteMsg};
use tracing::{debug, warn};

use crate::batch::TxnBatch;
use crate::error::Error;
use crate::{Interface, Master};

// Queued redistribution request from a protocol engine.
#[derive(Debug)]
pub enum RedistRequest {
    Announce(RouteMsg),
    Withdraw(RouteKeyMsg),
}

// ===== global functions =====

// Works through the queued redistribution requests. A request interrupted
// by an in-flight commit stays at the front of the queue and resumes,
// re-derived from the replica, once the commit completes.
pub(crate) fn drain(master: &mut Master) {
    while let Some(request) = master.redist_queue.pop_front() {
        let result = match &request {
            RedistRequest::Announce(msg) => process_announce(
                &mut master.store,
                &mut master.batch,
                &master.interfaces,
                &mut master.announced,
                msg,
            ),
            RedistRequest::Withdraw(msg) => process_withdraw(
                &mut master.store,
                &mut master.batch,
                &mut master.announced,
                msg,
            ),
        };
        match result {
            Ok(()) => (),
            Err(error @ Error::TxnPending) => {
                error.log();
                master.redist_queue.push_front(request);
                break;
            }
            Err(error) => error.log(),
        }
    }
}

// Persists a route announced by a protocol engine. The row is created
// first and its nexthop set grown and pruned one commit group at a time,
// so an announcement carrying more nexthops than the batch limit resumes
// from the replica after the intervening commits. Every group leaves the
// store referentially consistent on its own.
pub(crate) fn process_announce(
    store: &mut Store,
    batch: &mut TxnBatch,
    interfaces: &BTreeMap<String, Interface>,
    announced: &mut BTreeMap<Protocol, u32>,
    msg: &RouteMsg,
) -> Result<(), Error> {
    // Connected routes are derived from port addresses, never announced.
    if msg.protocol == Protocol::DIRECT {
        debug!(prefix = %msg.prefix, "ignoring connected route announcement");
        return Ok(());
    }

    // Resolve the announced nexthops to their persisted form.
    let mut desired = BTreeSet::new();
    for nexthop in &msg.nexthops {
        match nexthop {
            Nexthop::Address { addr, ifindex } => {
                desired
                    .insert((Some(*addr), ifname_for(interfaces, *ifindex)));
            }
            Nexthop::Interface { ifindex } => {
                let Some(ifname) = ifname_for(interfaces, *ifindex) else {
                    debug!(%ifindex, "cannot resolve nexthop interface");
                    continue;
                };
                desired.insert((None, Some(ifname)));
            }
        }
    }

    let existing = store
        .db
        .route_by_prefix(msg.protocol, &msg.prefix)
        .map(|(uuid, row)| (uuid, row.clone()));
    let (uuid, mut row) = match existing {
        Some((uuid, row)) => (uuid, row),
        None => {
            let row = RouteRow {
                prefix: msg.prefix,
                protocol: msg.protocol,
                distance: msg.distance,
                metric: msg.metric,
                selected: false,
                nexthops: BTreeSet::new(),
            };
            let txn = batch.ensure_open(store)?;
            let uuid = txn.insert(RowData::Route(row.clone()));
            batch.note_mutation();
            *announced.entry(msg.protocol).or_default() += 1;
            batch.finish(store, false);
            (uuid, row)
        }
    };

    // Resolved view of the nexthops the row holds right now.
    let mut current: Vec<(RowUuid, Option<IpAddr>, Option<String>)> = row
        .nexthops
        .iter()
        .filter_map(|nexthop| {
            store
                .db
                .nexthops
                .get(nexthop)
                .map(|nh_row| (*nexthop, nh_row.addr, nh_row.ifname.clone()))
        })
        .collect();

    // Add the missing nexthops.
    for (addr, ifname) in &desired {
        if current.iter().any(|(_, a, i)| a == addr && i == ifname) {
            continue;
        }
        let txn = batch.ensure_open(store)?;
        let nexthop = txn.insert(RowData::Nexthop(NexthopRow {
            addr: *addr,
            ifname: ifname.clone(),
            selected: false,
        }));
        batch.note_mutation();
        row.nexthops.insert(nexthop);
        let txn = batch.ensure_open(store)?;
        txn.update(uuid, RowData::Route(row.clone()));
        batch.note_mutation();
        current.push((nexthop, *addr, ifname.clone()));
        batch.finish(store, false);
    }

    // Prune the nexthops the announcement no longer carries. The row is
    // updated in the same group, so the deleted row is never left
    // referenced.
    for (nexthop, addr, ifname) in current {
        if desired.contains(&(addr, ifname)) {
            continue;
        }
        let txn = batch.ensure_open(store)?;
        row.nexthops.remove(&nexthop);
        txn.update(uuid, RowData::Route(row.clone()));
        batch.note_mutation();
        let txn = batch.ensure_open(store)?;
        txn.delete(Table::Nexthop, nexthop);
        batch.note_mutation();
        batch.finish(store, false);
    }

    // Route metadata last.
    if row.distance != msg.distance || row.metric != msg.metric {
        let txn = batch.ensure_open(store)?;
        row.distance = msg.distance;
        row.metric = msg.metric;
        txn.update(uuid, RowData::Route(row));
        batch.note_mutation();
        batch.finish(store, false);
    }
    Ok(())
}

// Deletes the persisted route a protocol engine withdrew, shrinking the
// nexthop set one commit group at a time before dropping the row itself.
pub(crate) fn process_withdraw(
    store: &mut Store,
    batch: &mut TxnBatch,
    announced: &mut BTreeMap<Protocol, u32>,
    msg: &RouteKeyMsg,
) -> Result<(), Error> {
    if msg.protocol == Protocol::DIRECT {
        debug!(prefix = %msg.prefix, "ignoring connected route withdrawal");
        return Ok(());
    }

    let existing = store
        .db
        .route_by_prefix(msg.protocol, &msg.prefix)
        .map(|(uuid, row)| (uuid, row.clone()));
    // A withdrawal for a route that was never announced must not touch
    // the route count.
    let Some((uuid, mut row)) = existing else {
        return Err(Error::RouteRowNotFound(msg.protocol, msg.prefix));
    };

    for nexthop in row.nexthops.clone() {
        let txn = batch.ensure_open(store)?;
        row.nexthops.remove(&nexthop);
        txn.update(uuid, RowData::Route(row.clone()));
        batch.note_mutation();
        let txn = batch.ensure_open(store)?;
        txn.delete(Table::Nexthop, nexthop);
        batch.note_mutation();
        batch.finish(store, false);
    }
    let txn = batch.ensure_open(store)?;
    txn.delete(Table::Route, uuid);
    batch.note_mutation();
    batch.finish(store, false);

    let count = announced.entry(msg.protocol).or_default();
    if *count == 0 {
        // The bookkeeping can lag behind after a failed commit.
        warn!(protocol = %msg.protocol, "announced route count underflow");
    } else {
        *count -= 1;
    }
    Ok(())
}

// ===== helper functions =====

fn ifname_for(
    interfaces: &BTreeMap<String, Interface>,
    ifindex: u32,
) -> Option<String> {
    interfaces
        .values()
        .find(|iface| iface.ifindex == ifindex)
        .map(|iface| iface.ifname.clone())
}
