//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dump::StateDump;
use crate::southbound::{
    AddressMsg, InterfaceUpdateMsg, RouteKeyMsg, RouteMsg, RouteSelectedMsg,
};

// Useful type definition(s).
pub type IbusReceiver = broadcast::Receiver<IbusMsg>;
pub type IbusSender = broadcast::Sender<IbusMsg>;

// Ibus message for communication among the different Concord components.
//
// The bus is a single broadcast channel shared by the reconciliation engine
// and the protocol engines. Each component reacts to the messages addressed
// to its role and ignores the rest.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum IbusMsg {
    // Request to resend the current interface information.
    InterfaceDump,
    // Interface update notification.
    InterfaceUpd(InterfaceUpdateMsg),
    // Interface delete notification.
    InterfaceDel(String),
    // Interface address addition notification.
    InterfaceAddressAdd(AddressMsg),
    // Interface address delete notification.
    InterfaceAddressDel(AddressMsg),
    // Request to install IP route in the RIB.
    RouteIpAdd(RouteMsg),
    // Request to uninstall IP route from the RIB.
    RouteIpDel(RouteKeyMsg),
    // Request to persist a redistributed route in the store.
    RouteAnnounce(RouteMsg),
    // Request to remove a previously announced route from the store.
    RouteWithdraw(RouteKeyMsg),
    // Forwarding-plane installation acknowledgment.
    RouteSelectedUpd(RouteSelectedMsg),
    // Route redistribute update notification.
    RouteRedistributeAdd(RouteMsg),
    // Route redistribute delete notification.
    RouteRedistributeDel(RouteKeyMsg),
    // Request an operational state snapshot.
    StateDumpRequest,
    // Operational state snapshot notification.
    StateDumpUpd(Arc<StateDump>),
}

// ===== global functions =====

// Creates the broadcast channel used for inter-component messaging.
pub fn ibus_channel() -> (IbusSender, IbusReceiver) {
    broadcast::channel(1024)
}
