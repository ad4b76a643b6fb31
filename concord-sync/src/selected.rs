//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use concord_store::client::Store;
use concord_store::schema::{NexthopRow, RowData, RowUuid};
use concord_utils::southbound::{Nexthop, RouteSelectedMsg};
use ipnetwork::IpNetwork;

use crate::Interface;
use crate::batch::TxnBatch;
use crate::error::Error;
use crate::port::L3Port;
use crate::rib::Route;

// Persists the selected flags of a route that was just programmed into
// the kernel: each nexthop row is flagged according to whether the RIB
// still uses it, and the route row carries the disjunction of its
// nexthop flags. Rows already in the right state are left untouched.
pub(crate) fn route_installed(
    store: &mut Store,
    batch: &mut TxnBatch,
    interfaces: &BTreeMap<String, Interface>,
    prefix: &IpNetwork,
    route: &Route,
) -> Result<(), Error> {
    let Some((uuid, row)) = store.db.route_by_prefix(route.protocol, prefix)
    else {
        return Err(Error::RouteRowNotFound(route.protocol, *prefix));
    };
    let row = row.clone();

    let mut any_selected = false;
    for nexthop_uuid in &row.nexthops {
        let Some(nh_row) = store.db.nexthops.get(nexthop_uuid).cloned()
        else {
            Error::NexthopRowNotFound(*nexthop_uuid).log();
            continue;
        };
        let selected = route
            .nexthops
            .iter()
            .any(|nexthop| nexthop_matches(&nh_row, nexthop, interfaces));
        any_selected |= selected;
        if nh_row.selected != selected {
            let mut new = nh_row;
            new.selected = selected;
            let txn = batch.ensure_open(store)?;
            txn.update(*nexthop_uuid, RowData::Nexthop(new));
            batch.note_mutation();
        }
    }

    if row.selected != any_selected {
        let mut new = row;
        new.selected = any_selected;
        let txn = batch.ensure_open(store)?;
        txn.update(uuid, RowData::Route(new));
        batch.note_mutation();
    }
    Ok(())
}

// Aligns the selected flags of a port's connected routes with its active
// state.
pub(crate) fn connected_flags_update(
    port: &L3Port,
    store: &mut Store,
    batch: &mut TxnBatch,
) -> Result<(), Error> {
    for uuid in port.connected_v4.values().chain(port.connected_v6.values())
    {
        route_flags_update(*uuid, &port.name, port.active, store, batch)?;
    }
    Ok(())
}

// Aligns a single connected route row and its nexthops with the owning
// port's name and active state.
pub(crate) fn route_flags_update(
    uuid: RowUuid,
    owner: &str,
    selected: bool,
    store: &mut Store,
    batch: &mut TxnBatch,
) -> Result<(), Error> {
    // Rows of uncommitted insertions already carry the right flags.
    let Some(row) = store.db.routes.get(&uuid).cloned() else {
        return Ok(());
    };
    for nexthop_uuid in &row.nexthops {
        let Some(nh_row) = store.db.nexthops.get(nexthop_uuid).cloned()
        else {
            Error::NexthopRowNotFound(*nexthop_uuid).log();
            continue;
        };
        if nh_row.selected != selected
            || nh_row.ifname.as_deref() != Some(owner)
        {
            let mut new = nh_row;
            new.selected = selected;
            new.ifname = Some(owner.to_owned());
            let txn = batch.ensure_open(store)?;
            txn.update(*nexthop_uuid, RowData::Nexthop(new));
            batch.note_mutation();
        }
    }
    if row.selected != selected {
        let mut new = row;
        new.selected = selected;
        let txn = batch.ensure_open(store)?;
        txn.update(uuid, RowData::Route(new));
        batch.note_mutation();
    }
    Ok(())
}

// Applies a forwarding-plane acknowledgment to the persisted flags. With
// no nexthop qualifier the update covers every nexthop of the route.
pub(crate) fn process_selected_upd(
    store: &mut Store,
    batch: &mut TxnBatch,
    msg: RouteSelectedMsg,
) -> Result<(), Error> {
    let Some((uuid, row)) = store.db.route_by_prefix(msg.protocol, &msg.prefix)
    else {
        return Err(Error::RouteRowNotFound(msg.protocol, msg.prefix));
    };
    let row = row.clone();

    let target_all = msg.nexthop_addr.is_none() && msg.nexthop_ifname.is_none();
    let mut any_selected = false;
    for nexthop_uuid in &row.nexthops {
        let Some(nh_row) = store.db.nexthops.get(nexthop_uuid).cloned()
        else {
            Error::NexthopRowNotFound(*nexthop_uuid).log();
            continue;
        };
        let matched = target_all
            || msg.nexthop_addr.is_some_and(|addr| nh_row.addr == Some(addr))
            || (msg.nexthop_ifname.is_some()
                && nh_row.ifname == msg.nexthop_ifname);
        let selected = if matched { msg.selected } else { nh_row.selected };
        any_selected |= selected;
        if nh_row.selected != selected {
            let mut new = nh_row;
            new.selected = selected;
            let txn = batch.ensure_open(store)?;
            txn.update(*nexthop_uuid, RowData::Nexthop(new));
            batch.note_mutation();
        }
    }

    if row.selected != any_selected {
        let mut new = row;
        new.selected = any_selected;
        let txn = batch.ensure_open(store)?;
        txn.update(uuid, RowData::Route(new));
        batch.note_mutation();
    }
    Ok(())
}

// ===== helper functions =====

fn nexthop_matches(
    row: &NexthopRow,
    nexthop: &Nexthop,
    interfaces: &BTreeMap<String, Interface>,
) -> bool {
    match nexthop {
        Nexthop::Address { addr, .. } => row.addr == Some(*addr),
        Nexthop::Interface { ifindex } => row
            .ifname
            .as_ref()
            .and_then(|ifname| interfaces.get(ifname))
            .is_some_and(|iface| iface.ifindex == *ifindex),
    }
}
