//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use concord_utils::protocol::Protocol;
use ipnetwork::IpNetwork;

use crate::notify::{ChangeOp, RowChange};
use crate::schema::{
    ColumnMask, InterfaceRow, NexthopRow, PortRow, RouteRow, RowData, RowUuid,
    Table,
};

// Full collection of store tables.
//
// The server owns the authoritative copy; every client keeps a replica
// that converges by applying sequence-numbered update batches.
#[derive(Clone, Debug, Default)]
pub struct Database {
    pub interfaces: BTreeMap<RowUuid, InterfaceRow>,
    pub ports: BTreeMap<RowUuid, PortRow>,
    pub routes: BTreeMap<RowUuid, RouteRow>,
    pub nexthops: BTreeMap<RowUuid, NexthopRow>,
}

// ===== impl Database =====

impl Database {
    pub fn get(&self, table: Table, uuid: &RowUuid) -> Option<RowData> {
        match table {
            Table::Interface => {
                self.interfaces.get(uuid).cloned().map(RowData::Interface)
            }
            Table::Port => self.ports.get(uuid).cloned().map(RowData::Port),
            Table::Route => self.routes.get(uuid).cloned().map(RowData::Route),
            Table::Nexthop => {
                self.nexthops.get(uuid).cloned().map(RowData::Nexthop)
            }
        }
    }

    pub fn contains(&self, table: Table, uuid: &RowUuid) -> bool {
        match table {
            Table::Interface => self.interfaces.contains_key(uuid),
            Table::Port => self.ports.contains_key(uuid),
            Table::Route => self.routes.contains_key(uuid),
            Table::Nexthop => self.nexthops.contains_key(uuid),
        }
    }

    pub fn insert(&mut self, uuid: RowUuid, data: RowData) {
        match data {
            RowData::Interface(row) => {
                self.interfaces.insert(uuid, row);
            }
            RowData::Port(row) => {
                self.ports.insert(uuid, row);
            }
            RowData::Route(row) => {
                self.routes.insert(uuid, row);
            }
            RowData::Nexthop(row) => {
                self.nexthops.insert(uuid, row);
            }
        }
    }

    pub fn remove(&mut self, table: Table, uuid: &RowUuid) -> Option<RowData> {
        match table {
            Table::Interface => {
                self.interfaces.remove(uuid).map(RowData::Interface)
            }
            Table::Port => self.ports.remove(uuid).map(RowData::Port),
            Table::Route => self.routes.remove(uuid).map(RowData::Route),
            Table::Nexthop => self.nexthops.remove(uuid).map(RowData::Nexthop),
        }
    }

    pub fn interface_by_name(
        &self,
        name: &str,
    ) -> Option<(RowUuid, &InterfaceRow)> {
        self.interfaces
            .iter()
            .find(|(_, row)| row.name == name)
            .map(|(uuid, row)| (*uuid, row))
    }

    pub fn port_by_name(&self, name: &str) -> Option<(RowUuid, &PortRow)> {
        self.ports
            .iter()
            .find(|(_, row)| row.name == name)
            .map(|(uuid, row)| (*uuid, row))
    }

    pub fn route_by_prefix(
        &self,
        protocol: Protocol,
        prefix: &IpNetwork,
    ) -> Option<(RowUuid, &RouteRow)> {
        self.routes
            .iter()
            .find(|(_, row)| row.protocol == protocol && row.prefix == *prefix)
            .map(|(uuid, row)| (*uuid, row))
    }

    // Applies one row change to the replica.
    pub fn apply(&mut self, change: &RowChange) {
        match change.op {
            ChangeOp::Insert | ChangeOp::Modify => {
                self.insert(change.uuid, change.data.clone());
            }
            ChangeOp::Delete => {
                self.remove(change.data.table(), &change.uuid);
            }
        }
    }

    // Renders the whole database as a list of insertions, used to bring a
    // freshly connected client up to date.
    pub fn snapshot(&self) -> Vec<RowChange> {
        let mut changes = Vec::new();
        for (uuid, row) in &self.interfaces {
            changes.push(RowChange {
                uuid: *uuid,
                op: ChangeOp::Insert,
                data: RowData::Interface(row.clone()),
                columns: ColumnMask::full(Table::Interface),
            });
        }
        for (uuid, row) in &self.ports {
            changes.push(RowChange {
                uuid: *uuid,
                op: ChangeOp::Insert,
                data: RowData::Port(row.clone()),
                columns: ColumnMask::full(Table::Port),
            });
        }
        for (uuid, row) in &self.nexthops {
            changes.push(RowChange {
                uuid: *uuid,
                op: ChangeOp::Insert,
                data: RowData::Nexthop(row.clone()),
                columns: ColumnMask::full(Table::Nexthop),
            });
        }
        for (uuid, row) in &self.routes {
            changes.push(RowChange {
                uuid: *uuid,
                op: ChangeOp::Insert,
                data: RowData::Route(row.clone()),
                columns: ColumnMask::full(Table::Route),
            });
        }
        changes
    }
}
