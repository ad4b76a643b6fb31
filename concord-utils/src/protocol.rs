//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// The route origins Concord tracks.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    BGP,
    DIRECT,
    ISIS,
    OSPFV2,
    OSPFV3,
    RIPV2,
    RIPNG,
    STATIC,
}

// ===== impl Protocol =====

impl Protocol {
    // Default administrative distance, used when the originator of a
    // route didn't provide one.
    pub fn default_distance(&self) -> u32 {
        match self {
            Protocol::DIRECT => 0,
            Protocol::STATIC => 1,
            Protocol::BGP => 20,
            Protocol::OSPFV2 | Protocol::OSPFV3 => 110,
            Protocol::ISIS => 115,
            Protocol::RIPV2 | Protocol::RIPNG => 120,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::BGP => write!(f, "bgp"),
            Protocol::DIRECT => write!(f, "direct"),
            Protocol::ISIS => write!(f, "isis"),
            Protocol::OSPFV2 => write!(f, "ospfv2"),
            Protocol::OSPFV3 => write!(f, "ospfv3"),
            Protocol::RIPV2 => write!(f, "ripv2"),
            Protocol::RIPNG => write!(f, "ripng"),
            Protocol::STATIC => write!(f, "static"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_ref() {
            "bgp" => Ok(Protocol::BGP),
            "direct" | "connected" => Ok(Protocol::DIRECT),
            "isis" => Ok(Protocol::ISIS),
            "ospfv2" => Ok(Protocol::OSPFV2),
            "ospfv3" => Ok(Protocol::OSPFV3),
            "ripv2" => Ok(Protocol::RIPV2),
            "ripng" => Ok(Protocol::RIPNG),
            "static" => Ok(Protocol::STATIC),
            _ => Err(()),
        }
    }
}
