//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FmtResult};

use bitflags::bitflags;
use concord_utils::protocol::Protocol;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Identifier of a store row, opaque to consumers.
//
// Identifiers are allocated by the committing client and become visible to
// every replica once the owning transaction commits.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct RowUuid(Uuid);

// Store tables.
#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub enum Table {
    Interface,
    Port,
    Route,
    Nexthop,
}

// Physical or virtual network device backing a port.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct InterfaceRow {
    pub name: String,
    pub ifindex: Option<u32>,
    pub admin_up: bool,
    pub link_up: bool,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct InterfaceColumns: u8 {
        const NAME = 0x01;
        const IFINDEX = 0x02;
        const ADMIN_UP = 0x04;
        const LINK_UP = 0x08;
    }
}

// Forwarding mode of a port.
#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub enum PortMode {
    Routed,
    Bridged,
}

// L3 (or L2) port attachment with its configured addresses.
//
// Addresses are stored as configured, host bits included. Consumers that
// need the covering network apply the mask themselves.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PortRow {
    pub name: String,
    pub mode: PortMode,
    pub interface: Option<RowUuid>,
    pub ipv4_address: Option<Ipv4Network>,
    pub ipv4_secondary: BTreeSet<Ipv4Network>,
    pub ipv6_address: Option<Ipv6Network>,
    pub ipv6_secondary: BTreeSet<Ipv6Network>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PortColumns: u8 {
        const NAME = 0x01;
        const MODE = 0x02;
        const INTERFACE = 0x04;
        const IPV4_ADDRESS = 0x08;
        const IPV4_SECONDARY = 0x10;
        const IPV6_ADDRESS = 0x20;
        const IPV6_SECONDARY = 0x40;
    }
}

// Persisted route, one row per (protocol, prefix).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RouteRow {
    pub prefix: IpNetwork,
    pub protocol: Protocol,
    pub distance: u32,
    pub metric: u32,
    pub selected: bool,
    pub nexthops: BTreeSet<RowUuid>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct RouteColumns: u8 {
        const PREFIX = 0x01;
        const PROTOCOL = 0x02;
        const DISTANCE = 0x04;
        const METRIC = 0x08;
        const SELECTED = 0x10;
        const NEXTHOPS = 0x20;
    }
}

// Nexthop referenced by one route row.
//
// At least one of `addr` and `ifname` is set. Connected routes carry an
// interface nexthop only.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct NexthopRow {
    pub addr: Option<std::net::IpAddr>,
    pub ifname: Option<String>,
    pub selected: bool,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct NexthopColumns: u8 {
        const ADDR = 0x01;
        const IFNAME = 0x02;
        const SELECTED = 0x04;
    }
}

// Typed row content, used both in transactions and in update notifications.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[derive(enum_as_inner::EnumAsInner)]
pub enum RowData {
    Interface(InterfaceRow),
    Port(PortRow),
    Route(RouteRow),
    Nexthop(NexthopRow),
}

// Set of modified columns attached to a row notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[derive(enum_as_inner::EnumAsInner)]
pub enum ColumnMask {
    Interface(InterfaceColumns),
    Port(PortColumns),
    Route(RouteColumns),
    Nexthop(NexthopColumns),
}

// ===== impl RowUuid =====

impl RowUuid {
    pub fn generate() -> RowUuid {
        RowUuid(Uuid::new_v4())
    }
}

impl Display for RowUuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        self.0.fmt(f)
    }
}

// ===== impl Table =====

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Table::Interface => write!(f, "interface"),
            Table::Port => write!(f, "port"),
            Table::Route => write!(f, "route"),
            Table::Nexthop => write!(f, "nexthop"),
        }
    }
}

// ===== impl InterfaceRow =====

impl InterfaceRow {
    pub fn changed_columns(&self, other: &InterfaceRow) -> InterfaceColumns {
        let mut columns = InterfaceColumns::empty();
        if self.name != other.name {
            columns.insert(InterfaceColumns::NAME);
        }
        if self.ifindex != other.ifindex {
            columns.insert(InterfaceColumns::IFINDEX);
        }
        if self.admin_up != other.admin_up {
            columns.insert(InterfaceColumns::ADMIN_UP);
        }
        if self.link_up != other.link_up {
            columns.insert(InterfaceColumns::LINK_UP);
        }
        columns
    }
}

// ===== impl PortRow =====

impl PortRow {
    pub fn changed_columns(&self, other: &PortRow) -> PortColumns {
        let mut columns = PortColumns::empty();
        if self.name != other.name {
            columns.insert(PortColumns::NAME);
        }
        if self.mode != other.mode {
            columns.insert(PortColumns::MODE);
        }
        if self.interface != other.interface {
            columns.insert(PortColumns::INTERFACE);
        }
        if self.ipv4_address != other.ipv4_address {
            columns.insert(PortColumns::IPV4_ADDRESS);
        }
        if self.ipv4_secondary != other.ipv4_secondary {
            columns.insert(PortColumns::IPV4_SECONDARY);
        }
        if self.ipv6_address != other.ipv6_address {
            columns.insert(PortColumns::IPV6_ADDRESS);
        }
        if self.ipv6_secondary != other.ipv6_secondary {
            columns.insert(PortColumns::IPV6_SECONDARY);
        }
        columns
    }
}

// ===== impl RouteRow =====

impl RouteRow {
    pub fn changed_columns(&self, other: &RouteRow) -> RouteColumns {
        let mut columns = RouteColumns::empty();
        if self.prefix != other.prefix {
            columns.insert(RouteColumns::PREFIX);
        }
        if self.protocol != other.protocol {
            columns.insert(RouteColumns::PROTOCOL);
        }
        if self.distance != other.distance {
            columns.insert(RouteColumns::DISTANCE);
        }
        if self.metric != other.metric {
            columns.insert(RouteColumns::METRIC);
        }
        if self.selected != other.selected {
            columns.insert(RouteColumns::SELECTED);
        }
        if self.nexthops != other.nexthops {
            columns.insert(RouteColumns::NEXTHOPS);
        }
        columns
    }
}

// ===== impl NexthopRow =====

impl NexthopRow {
    pub fn changed_columns(&self, other: &NexthopRow) -> NexthopColumns {
        let mut columns = NexthopColumns::empty();
        if self.addr != other.addr {
            columns.insert(NexthopColumns::ADDR);
        }
        if self.ifname != other.ifname {
            columns.insert(NexthopColumns::IFNAME);
        }
        if self.selected != other.selected {
            columns.insert(NexthopColumns::SELECTED);
        }
        columns
    }
}

// ===== impl RowData =====

impl RowData {
    pub fn table(&self) -> Table {
        match self {
            RowData::Interface(_) => Table::Interface,
            RowData::Port(_) => Table::Port,
            RowData::Route(_) => Table::Route,
            RowData::Nexthop(_) => Table::Nexthop,
        }
    }

    // Computes the set of columns whose value differs from `old`.
    //
    // Both values must belong to the same table.
    pub fn changed_columns(&self, old: &RowData) -> ColumnMask {
        match (self, old) {
            (RowData::Interface(new), RowData::Interface(old)) => {
                ColumnMask::Interface(new.changed_columns(old))
            }
            (RowData::Port(new), RowData::Port(old)) => {
                ColumnMask::Port(new.changed_columns(old))
            }
            (RowData::Route(new), RowData::Route(old)) => {
                ColumnMask::Route(new.changed_columns(old))
            }
            (RowData::Nexthop(new), RowData::Nexthop(old)) => {
                ColumnMask::Nexthop(new.changed_columns(old))
            }
            _ => ColumnMask::full(self.table()),
        }
    }
}

// ===== impl ColumnMask =====

impl ColumnMask {
    pub fn full(table: Table) -> ColumnMask {
        match table {
            Table::Interface => ColumnMask::Interface(InterfaceColumns::all()),
            Table::Port => ColumnMask::Port(PortColumns::all()),
            Table::Route => ColumnMask::Route(RouteColumns::all()),
            Table::Nexthop => ColumnMask::Nexthop(NexthopColumns::all()),
        }
    }

    pub fn none(table: Table) -> ColumnMask {
        match table {
            Table::Interface => {
                ColumnMask::Interface(InterfaceColumns::empty())
            }
            Table::Port => ColumnMask::Port(PortColumns::empty()),
            Table::Route => ColumnMask::Route(RouteColumns::empty()),
            Table::Nexthop => ColumnMask::Nexthop(NexthopColumns::empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ColumnMask::Interface(columns) => columns.is_empty(),
            ColumnMask::Port(columns) => columns.is_empty(),
            ColumnMask::Route(columns) => columns.is_empty(),
            ColumnMask::Nexthop(columns) => columns.is_empty(),
        }
    }

    pub fn table(&self) -> Table {
        match self {
            ColumnMask::Interface(_) => Table::Interface,
            ColumnMask::Port(_) => Table::Port,
            ColumnMask::Route(_) => Table::Route,
            ColumnMask::Nexthop(_) => Table::Nexthop,
        }
    }
}
