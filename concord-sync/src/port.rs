//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use concord_store::db::Database;
use concord_store::schema::{PortMode, PortRow, RowUuid};
use concord_utils::ibus::IbusSender;
use concord_utils::ip::{Ipv4NetworkExt, Ipv6NetworkExt};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use tracing::debug;

use crate::debug::Debug;
use crate::ibus;

// Reconciliation work a port still requires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingAction {
    NoChange,
    Added,
    ChangedToL2,
    Deleted,
    AddressUpdated,
    ActiveStateChanged,
}

// Cached state of one routed port.
#[derive(Debug)]
pub struct L3Port {
    pub row: RowUuid,
    pub name: String,
    pub active: bool,
    pub pending: PendingAction,
    // Configured addresses as last observed, host bits included.
    pub primary_v4: Option<Ipv4Network>,
    pub secondary_v4: BTreeSet<Ipv4Network>,
    pub primary_v6: Option<Ipv6Network>,
    pub secondary_v6: BTreeSet<Ipv6Network>,
    // Connected route rows owned by this port, keyed by canonical prefix.
    pub connected_v4: BTreeMap<Ipv4Network, RowUuid>,
    pub connected_v6: BTreeMap<Ipv6Network, RowUuid>,
}

// Cache of all routed ports, keyed by their row identifier.
#[derive(Debug, Default)]
pub struct PortCache {
    pub ports: BTreeMap<RowUuid, L3Port>,
}

// ===== impl L3Port =====

impl L3Port {
    // Canonical prefixes the configured IPv4 addresses cover.
    pub(crate) fn desired_v4(&self) -> BTreeSet<Ipv4Network> {
        self.primary_v4
            .iter()
            .chain(self.secondary_v4.iter())
            .filter(|addr| addr.is_routable())
            .map(|addr| addr.apply_mask())
            .collect()
    }

    // Canonical prefixes the configured IPv6 addresses cover.
    pub(crate) fn desired_v6(&self) -> BTreeSet<Ipv6Network> {
        self.primary_v6
            .iter()
            .chain(self.secondary_v6.iter())
            .filter(|addr| addr.is_routable())
            .map(|addr| addr.apply_mask())
            .collect()
    }

    // All configured addresses, both families.
    pub(crate) fn addresses(&self) -> BTreeSet<IpNetwork> {
        self.primary_v4
            .iter()
            .copied()
            .chain(self.secondary_v4.iter().copied())
            .map(IpNetwork::V4)
            .chain(
                self.primary_v6
                    .iter()
                    .copied()
                    .chain(self.secondary_v6.iter().copied())
                    .map(IpNetwork::V6),
            )
            .collect()
    }

    fn load_addresses(&mut self, row: &PortRow) {
        self.primary_v4 = row.ipv4_address;
        self.secondary_v4 = row.ipv4_secondary.clone();
        self.primary_v6 = row.ipv6_address;
        self.secondary_v6 = row.ipv6_secondary.clone();
    }
}

// ===== impl PortCache =====

impl PortCache {
    // Classifies a port row insertion or modification.
    pub(crate) fn observe_update(
        &mut self,
        uuid: RowUuid,
        row: &PortRow,
        db: &Database,
        ibus_tx: &IbusSender,
    ) {
        match self.ports.entry(uuid) {
            Entry::Vacant(v) => {
                // Only routed ports are tracked.
                if row.mode != PortMode::Routed {
                    return;
                }
                let mut port = L3Port {
                    row: uuid,
                    name: row.name.clone(),
                    active: port_active(db, row),
                    pending: PendingAction::Added,
                    primary_v4: None,
                    secondary_v4: Default::default(),
                    primary_v6: None,
                    secondary_v6: Default::default(),
                    connected_v4: Default::default(),
                    connected_v6: Default::default(),
                };
                port.load_addresses(row);
                for addr in port.addresses() {
                    ibus::notify_addr_add(ibus_tx, &port.name, addr);
                }
                Debug::PortUpdate(&port.name, port.pending).log();
                v.insert(port);
            }
            Entry::Occupied(mut o) => {
                let port = o.get_mut();
                // A rename must propagate to the owner names recorded on
                // the persisted nexthop rows.
                let renamed = port.name != row.name;
                port.name = row.name.clone();

                if row.mode != PortMode::Routed {
                    port.pending = PendingAction::ChangedToL2;
                    for addr in port.addresses() {
                        ibus::notify_addr_del(ibus_tx, &port.name, addr);
                    }
                    Debug::PortUpdate(&port.name, port.pending).log();
                    return;
                }

                // A port tagged for removal can return to the L3 domain
                // before it was swept; reconcile it from scratch.
                let reclaimed = matches!(
                    port.pending,
                    PendingAction::ChangedToL2 | PendingAction::Deleted
                );

                // Track address changes, announcing the differences.
                let old = port.addresses();
                port.load_addresses(row);
                let new = port.addresses();
                for addr in old.difference(&new) {
                    ibus::notify_addr_del(ibus_tx, &port.name, *addr);
                }
                for addr in new.difference(&old) {
                    ibus::notify_addr_add(ibus_tx, &port.name, *addr);
                }

                let active = port_active(db, row);
                let active_changed = active != port.active;
                port.active = active;

                if old != new || reclaimed || renamed {
                    port.pending = PendingAction::AddressUpdated;
                } else if active_changed
                    && port.pending == PendingAction::NoChange
                {
                    port.pending = PendingAction::ActiveStateChanged;
                }
                if port.pending != PendingAction::NoChange {
                    Debug::PortUpdate(&port.name, port.pending).log();
                }
            }
        }
    }

    // Classifies a port row deletion. The cached entry survives until its
    // connected routes are cleaned up.
    pub(crate) fn observe_delete(&mut self, uuid: RowUuid, ibus_tx: &IbusSender) {
        if let Some(port) = self.ports.get_mut(&uuid) {
            port.pending = PendingAction::Deleted;
            for addr in port.addresses() {
                ibus::notify_addr_del(ibus_tx, &port.name, addr);
            }
            Debug::PortUpdate(&port.name, port.pending).log();
        }
    }

    // Evicts the ports that left the L3 domain once their connected
    // routes are cleaned up. Ports still owning records stay behind for
    // the synchronizer and are evicted one pass later.
    pub(crate) fn sweep(&mut self) {
        self.ports.retain(|_, port| {
            let evict = matches!(
                port.pending,
                PendingAction::ChangedToL2 | PendingAction::Deleted
            ) && port.connected_v4.is_empty()
                && port.connected_v6.is_empty();
            if evict {
                debug!(name = %port.name, "evicting port");
            }
            !evict
        });
    }

    // Recomputes the active state of every port after interface changes.
    pub(crate) fn refresh_active(&mut self, db: &Database) {
        for (uuid, port) in self.ports.iter_mut() {
            let Some(row) = db.ports.get(uuid) else {
                continue;
            };
            let active = port_active(db, row);
            if active != port.active {
                port.active = active;
                if port.pending == PendingAction::NoChange {
                    port.pending = PendingAction::ActiveStateChanged;
                    Debug::PortUpdate(&port.name, port.pending).log();
                }
            }
        }
    }

    // Drops connected route references that never materialized, scheduling
    // the owning ports for reconciliation. Called after a commit failure.
    pub(crate) fn revalidate(&mut self, db: &Database) {
        for port in self.ports.values_mut() {
            let len_v4 = port.connected_v4.len();
            let len_v6 = port.connected_v6.len();
            port.connected_v4.retain(|_, uuid| db.routes.contains_key(uuid));
            port.connected_v6.retain(|_, uuid| db.routes.contains_key(uuid));
            if (port.connected_v4.len() != len_v4
                || port.connected_v6.len() != len_v6)
                && port.pending == PendingAction::NoChange
            {
                port.pending = PendingAction::AddressUpdated;
            }
        }
    }
}

// ===== helper functions =====

// A port forwards only when its backing interface is administratively
// enabled and has link. The interface is found through the row reference,
// falling back to a name match.
pub(crate) fn port_active(db: &Database, row: &PortRow) -> bool {
    row.interface
        .as_ref()
        .and_then(|uuid| db.interfaces.get(uuid))
        .or_else(|| db.interface_by_name(&row.name).map(|(_, row)| row))
        .is_some_and(|iface| iface.admin_up && iface.link_up)
}

// Ifindex of the interface backing a port, or zero when unknown.
pub(crate) fn port_ifindex(db: &Database, port: &L3Port) -> u32 {
    db.ports
        .get(&port.row)
        .and_then(|row| row.interface.as_ref())
        .and_then(|uuid| db.interfaces.get(uuid))
        .or_else(|| db.interface_by_name(&port.name).map(|(_, row)| row))
        .and_then(|iface| iface.ifindex)
        .unwrap_or(0)
}
