//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::IpAddr;

use bitflags::bitflags;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::protocol::Protocol;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct InterfaceFlags: u8 {
        const LOOPBACK = 0x01;
        const OPERATIVE = 0x02;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct AddressFlags: u8 {
        const UNNUMBERED = 0x01;
    }
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Nexthop {
    Address { ifindex: u32, addr: IpAddr },
    Interface { ifindex: u32 },
}

// ===== Ibus messages =====

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceUpdateMsg {
    pub ifname: String,
    pub ifindex: u32,
    pub flags: InterfaceFlags,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct AddressMsg {
    pub ifname: String,
    pub addr: IpNetwork,
    pub flags: AddressFlags,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouteMsg {
    pub protocol: Protocol,
    pub prefix: IpNetwork,
    pub distance: u32,
    pub metric: u32,
    pub nexthops: BTreeSet<Nexthop>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouteKeyMsg {
    pub protocol: Protocol,
    pub prefix: IpNetwork,
}

// Forwarding-plane acknowledgment for a route or one of its nexthops.
//
// When both `nexthop_addr` and `nexthop_ifname` are unset, the update
// applies to every nexthop of the route.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouteSelectedMsg {
    pub protocol: Protocol,
    pub prefix: IpNetwork,
    pub nexthop_addr: Option<IpAddr>,
    pub nexthop_ifname: Option<String>,
    pub selected: bool,
}

// ===== impl Nexthop =====

impl Nexthop {
    // Returns the nexthop address, if this is an address nexthop.
    pub fn addr(&self) -> Option<IpAddr> {
        match self {
            Nexthop::Address { addr, .. } => Some(*addr),
            Nexthop::Interface { .. } => None,
        }
    }

    // Returns the nexthop outgoing interface.
    pub fn ifindex(&self) -> u32 {
        match self {
            Nexthop::Address { ifindex, .. } => *ifindex,
            Nexthop::Interface { ifindex } => *ifindex,
        }
    }
}
