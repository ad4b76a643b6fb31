//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use concord_store::client::StoreMsg;
use concord_store::db::Database;
use concord_store::notify::ChangeOp;
use concord_store::schema::{RouteRow, RowData};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::{InterfaceFlags, Nexthop, RouteMsg};

use crate::debug::Debug;
use crate::port::PendingAction;
use crate::{
    Interface, Master, connected, diff, ibus, redistribute, restart, selected,
};

// ===== global functions =====

pub async fn process_store_msg(master: &mut Master, msg: StoreMsg) {
    match msg {
        StoreMsg::Update(batch) => {
            if !master.store.apply(&batch) {
                return;
            }
            Debug::PassBegin(batch.seqno).log();

            // Classify the row changes before running the pass.
            let mut iface_changed = false;
            let mut route_rows_deleted = false;
            for change in &batch.changes {
                match (&change.data, change.op) {
                    (
                        RowData::Interface(row),
                        ChangeOp::Insert | ChangeOp::Modify,
                    ) => {
                        iface_changed = true;
                        match row.ifindex {
                            Some(ifindex) => {
                                let mut flags = InterfaceFlags::default();
                                if row.admin_up && row.link_up {
                                    flags.insert(InterfaceFlags::OPERATIVE);
                                }
                                let iface = Interface::new(
                                    row.name.clone(),
                                    ifindex,
                                    flags,
                                );
                                ibus::notify_iface_upd(&master.ibus_tx, &iface);
                                master
                                    .interfaces
                                    .insert(row.name.clone(), iface);
                            }
                            // An interface without an ifindex can't be
                            // used as a nexthop resolution target.
                            None => {
                                master.interfaces.remove(&row.name);
                            }
                        }
                    }
                    (RowData::Interface(row), ChangeOp::Delete) => {
                        iface_changed = true;
                        master.interfaces.remove(&row.name);
                        ibus::notify_iface_del(&master.ibus_tx, &row.name);
                    }
                    (
                        RowData::Port(row),
                        ChangeOp::Insert | ChangeOp::Modify,
                    ) => {
                        master.ports.observe_update(
                            change.uuid,
                            row,
                            &master.store.db,
                            &master.ibus_tx,
                        );
                    }
                    (RowData::Port(_), ChangeOp::Delete) => {
                        master
                            .ports
                            .observe_delete(change.uuid, &master.ibus_tx);
                    }
                    (
                        RowData::Route(row),
                        ChangeOp::Insert | ChangeOp::Modify,
                    ) if row.protocol != Protocol::DIRECT => {
                        // Persisted static and protocol routes follow the
                        // same ingestion path into the RIB.
                        if let Some(msg) = route_msg_from_row(
                            &master.store.db,
                            &master.interfaces,
                            row,
                        ) {
                            master.rib.ip_route_replace(msg);
                        }
                    }
                    (RowData::Route(row), ChangeOp::Delete)
                        if row.protocol != Protocol::DIRECT =>
                    {
                        route_rows_deleted = true;
                    }
                    _ => (),
                }
            }

            if iface_changed {
                master.ports.refresh_active(&master.store.db);
                // A late interface can unblock the RIB entries of already
                // reconciled connected routes.
                for port in master.ports.ports.values() {
                    connected::refresh_rib(
                        port,
                        &master.store.db,
                        &mut master.rib,
                    );
                }
                // Same for persisted routes whose nexthops could not be
                // resolved when their rows were first seen.
                for row in master.store.db.routes.values() {
                    if row.protocol == Protocol::DIRECT {
                        continue;
                    }
                    if let Some(msg) = route_msg_from_row(
                        &master.store.db,
                        &master.interfaces,
                        row,
                    ) {
                        master.rib.ip_route_replace(msg);
                    }
                }
            }

            run_pass(master, route_rows_deleted).await;
        }
        StoreMsg::TxnReply { id, status } => {
            master.batch.complete(id, status);
            if master.batch.take_replay() {
                // The commit was lost; drop the row references that never
                // materialized and re-derive everything on a full pass.
                master.ports.revalidate(&master.store.db);
                master.restart.reset();
                run_pass(master, true).await;
                redistribute::drain(master);
                master.batch.finish(&mut master.store, true);
            } else {
                master.rib.flush_selected_retry();
                redistribute::drain(master);
                // Work deferred while the commit was in flight resumes
                // right away instead of waiting for the next notification.
                let deferred = !master.restart.steady()
                    || master
                        .ports
                        .ports
                        .values()
                        .any(|port| port.pending != PendingAction::NoChange);
                if deferred {
                    run_pass(master, false).await;
                } else {
                    master.process_update_queue().await;
                }
            }
        }
    }
}

// Runs one reconciliation pass: restart coordination until steady state,
// then port reconciliation, the stale-route differ when deletions were
// observed, the RIB update queue and finally the batch commit.
pub(crate) async fn run_pass(master: &mut Master, run_differ: bool) {
    master.ports.sweep();

    if !master.restart.steady()
        && let Err(error) = restart::run(
            &mut master.restart,
            &mut master.ports,
            &mut master.store,
            &mut master.batch,
        )
    {
        error.log();
    }

    for port in master
        .ports
        .ports
        .values_mut()
        .filter(|port| port.pending != PendingAction::NoChange)
    {
        let result = match port.pending {
            PendingAction::Added | PendingAction::AddressUpdated => {
                connected::reconcile_port(
                    port,
                    &mut master.store,
                    &mut master.batch,
                    &mut master.rib,
                )
            }
            PendingAction::ActiveStateChanged => {
                selected::connected_flags_update(
                    port,
                    &mut master.store,
                    &mut master.batch,
                )
            }
            PendingAction::ChangedToL2 | PendingAction::Deleted => {
                // The pending action survives the cleanup; the sweep at
                // the top of the next pass evicts the entry.
                let result = connected::cleanup_port(
                    port,
                    &mut master.store,
                    &mut master.batch,
                    &mut master.rib,
                );
                if let Err(error) = result {
                    error.log();
                }
                continue;
            }
            PendingAction::NoChange => unreachable!(),
        };
        match result {
            Ok(()) => port.pending = PendingAction::NoChange,
            // Deferred; the pending action is retried on a later pass.
            Err(error) => error.log(),
        }
    }

    if run_differ && master.restart.steady() {
        diff::run(&mut master.rib, &master.store.db, &master.interfaces);
    }

    master
        .rib
        .process_update_queue(
            &master.netlink,
            &master.interfaces,
            &mut master.store,
            &mut master.batch,
            &master.ibus_tx,
        )
        .await;

    master.batch.finish(&mut master.store, true);
    if master.batch.take_replay() {
        master.ports.revalidate(&master.store.db);
        master.restart.reset();
    }
}

// ===== helper functions =====

// Renders a persisted route row as a RIB route message, resolving its
// nexthop rows. Rows whose nexthops can't be resolved yet are skipped and
// picked up again once the missing interface shows up.
fn route_msg_from_row(
    db: &Database,
    interfaces: &std::collections::BTreeMap<String, Interface>,
    row: &RouteRow,
) -> Option<RouteMsg> {
    let mut nexthops = BTreeSet::new();
    for uuid in &row.nexthops {
        let nh_row = db.nexthops.get(uuid)?;
        let ifindex = nh_row
            .ifname
            .as_ref()
            .and_then(|ifname| interfaces.get(ifname))
            .map(|iface| iface.ifindex);
        match (nh_row.addr, ifindex) {
            (Some(addr), ifindex) => {
                nexthops.insert(Nexthop::Address {
                    addr,
                    ifindex: ifindex.unwrap_or(0),
                });
            }
            (None, Some(ifindex)) => {
                nexthops.insert(Nexthop::Interface { ifindex });
            }
            (None, None) => continue,
        }
    }
    if nexthops.is_empty() {
        return None;
    }
    Some(RouteMsg {
        protocol: row.protocol,
        prefix: row.prefix,
        distance: row.distance,
        metric: row.metric,
        nexthops,
    })
}
