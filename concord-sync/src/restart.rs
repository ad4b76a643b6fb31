//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use concord_store::client::Store;
use concord_store::db::Database;
use concord_store::schema::{RowUuid, Table};
use concord_utils::protocol::Protocol;
use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::batch::TxnBatch;
use crate::debug::Debug;
use crate::error::Error;
use crate::port::PortCache;
use crate::selected;

// Restart reconciliation states.
//
// On startup the store may still hold connected routes persisted by a
// previous incarnation of the daemon. Those are first collected
// (`PreRestart`), then matched against the ports' current addresses and
// adopted where they still apply (`Walking`), and the remainder is
// deleted (`Purging`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartState {
    PreRestart,
    Walking,
    Purging,
    SteadyState,
}

#[derive(Debug)]
pub struct RestartCoordinator {
    pub state: RestartState,
    // Persisted connected routes awaiting adoption, keyed by owner port
    // and prefix.
    pub leftover: BTreeMap<(String, IpNetwork), RowUuid>,
}

// ===== impl RestartCoordinator =====

impl RestartCoordinator {
    pub fn steady(&self) -> bool {
        self.state == RestartState::SteadyState
    }

    // Forces a new reconciliation round, re-deriving the leftover set from
    // the replica. Used when a commit failure may have lost purges.
    pub(crate) fn reset(&mut self) {
        self.leftover.clear();
        self.transition(RestartState::PreRestart);
    }

    fn transition(&mut self, state: RestartState) {
        Debug::RestartTransition(state).log();
        self.state = state;
    }
}

impl Default for RestartCoordinator {
    fn default() -> RestartCoordinator {
        RestartCoordinator {
            state: RestartState::PreRestart,
            leftover: Default::default(),
        }
    }
}

// ===== global functions =====

// Advances the restart state machine as far as the transaction batcher
// allows. Runs at the start of every pass until the steady state is
// reached; interrupted stages resume on the next pass.
pub(crate) fn run(
    restart: &mut RestartCoordinator,
    ports: &mut PortCache,
    store: &mut Store,
    batch: &mut TxnBatch,
) -> Result<(), Error> {
    if restart.state == RestartState::PreRestart {
        restart.leftover = collect_leftover(&store.db);
        if !restart.leftover.is_empty() {
            info!(
                count = restart.leftover.len(),
                "found persisted connected routes"
            );
        }
        restart.transition(RestartState::Walking);
    }
    if restart.state == RestartState::Walking {
        walk(restart, ports, store, batch)?;
        restart.transition(RestartState::Purging);
    }
    if restart.state == RestartState::Purging {
        purge(restart, store, batch)?;
        restart.transition(RestartState::SteadyState);
        info!("restart reconciliation complete");
    }
    Ok(())
}

// Indexes the persisted connected routes by owner port and prefix. The
// owner is recorded on the route's interface nexthop.
fn collect_leftover(db: &Database) -> BTreeMap<(String, IpNetwork), RowUuid> {
    let mut leftover = BTreeMap::new();
    for (uuid, row) in &db.routes {
        if row.protocol != Protocol::DIRECT {
            continue;
        }
        let owner = row.nexthops.iter().find_map(|nexthop| {
            db.nexthops.get(nexthop).and_then(|row| row.ifname.clone())
        });
        let Some(owner) = owner else {
            debug!(%uuid, "connected route row without owner port");
            continue;
        };
        leftover.insert((owner, row.prefix), *uuid);
    }
    leftover
}

// Matches leftover routes against the ports' current addresses. Matching
// rows are adopted instead of reinserted, with their selected flags
// corrected where the port's active state disagrees.
fn walk(
    restart: &mut RestartCoordinator,
    ports: &mut PortCache,
    store: &mut Store,
    batch: &mut TxnBatch,
) -> Result<(), Error> {
    for port in ports.ports.values_mut() {
        let desired = port
            .desired_v4()
            .into_iter()
            .map(IpNetwork::V4)
            .chain(port.desired_v6().into_iter().map(IpNetwork::V6))
            .collect::<Vec<_>>();
        for prefix in desired {
            let key = (port.name.clone(), prefix);
            let claimed = match prefix {
                IpNetwork::V4(prefix) => {
                    port.connected_v4.contains_key(&prefix)
                }
                IpNetwork::V6(prefix) => {
                    port.connected_v6.contains_key(&prefix)
                }
            };
            if claimed {
                // Adopted on an earlier pass.
                restart.leftover.remove(&key);
                continue;
            }

            // Make sure the claim can be recorded before taking it.
            batch.ensure_open(store)?;
            let Some(uuid) = restart.leftover.remove(&key) else {
                continue;
            };
            match prefix {
                IpNetwork::V4(prefix) => {
                    port.connected_v4.insert(prefix, uuid);
                }
                IpNetwork::V6(prefix) => {
                    port.connected_v6.insert(prefix, uuid);
                }
            }
            selected::route_flags_update(
                uuid,
                &port.name,
                port.active,
                store,
                batch,
            )?;
            debug!(name = %port.name, %prefix, "adopted connected route");
            batch.finish(store, false);
        }
    }
    Ok(())
}

// Deletes the leftover routes no port claimed.
fn purge(
    restart: &mut RestartCoordinator,
    store: &mut Store,
    batch: &mut TxnBatch,
) -> Result<(), Error> {
    while let Some((key, _)) = restart.leftover.first_key_value() {
        let key = key.clone();

        // Make sure the deletion can be staged before dropping the claim.
        batch.ensure_open(store)?;
        let Some(uuid) = restart.leftover.remove(&key) else {
            break;
        };
        let (owner, prefix) = key;
        if let Some(row) = store.db.routes.get(&uuid).cloned() {
            for nexthop in &row.nexthops {
                let txn = batch.ensure_open(store)?;
                txn.delete(Table::Nexthop, *nexthop);
                batch.note_mutation();
            }
            let txn = batch.ensure_open(store)?;
            txn.delete(Table::Route, uuid);
            batch.note_mutation();
            debug!(%owner, %prefix, "purging stale connected route");
        }
        batch.finish(store, false);
    }
    Ok(())
}
