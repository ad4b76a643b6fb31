//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use crate::protocol::Protocol;
use crate::southbound::Nexthop;

// Read-only operational snapshot of the reconciliation engine, for
// troubleshooting purposes.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct StateDump {
    pub ports: Vec<PortDump>,
    pub routes: Vec<RouteDump>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct PortDump {
    pub name: String,
    pub active: bool,
    pub primary_v4: Option<Ipv4Network>,
    pub primary_v6: Option<Ipv6Network>,
    pub secondary_v4: Vec<Ipv4Network>,
    pub secondary_v6: Vec<Ipv6Network>,
    pub connected_v4: Vec<Ipv4Network>,
    pub connected_v6: Vec<Ipv6Network>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouteDump {
    pub prefix: IpNetwork,
    pub protocol: Protocol,
    pub distance: u32,
    pub metric: u32,
    pub active: bool,
    pub nexthops: Vec<Nexthop>,
    pub last_updated: DateTime<Utc>,
}
