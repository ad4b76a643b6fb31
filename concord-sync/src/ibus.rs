//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use concord_utils::dump::{PortDump, RouteDump, StateDump};
use concord_utils::ibus::{IbusMsg, IbusSender};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::{
    AddressFlags, AddressMsg, InterfaceUpdateMsg, RouteKeyMsg, RouteMsg,
};
use ipnetwork::IpNetwork;

use crate::redistribute::RedistRequest;
use crate::rib::{Route, RouteFlags};
use crate::{Interface, Master, redistribute, selected};

// ===== global functions =====

pub async fn process_msg(master: &mut Master, msg: IbusMsg) {
    match msg {
        // A protocol engine started and wants the current interface and
        // address information.
        IbusMsg::InterfaceDump => {
            for iface in master.interfaces.values() {
                notify_iface_upd(&master.ibus_tx, iface);
            }
            for port in master.ports.ports.values() {
                for addr in port.addresses() {
                    notify_addr_add(&master.ibus_tx, &port.name, addr);
                }
            }
        }
        // Transient RIB insertion, not persisted to the store.
        IbusMsg::RouteIpAdd(msg) => {
            master.rib.ip_route_add(msg);
        }
        IbusMsg::RouteIpDel(msg) => {
            master.rib.ip_route_del(msg);
        }
        // Redistribution into the store.
        IbusMsg::RouteAnnounce(msg) => {
            master.redist_queue.push_back(RedistRequest::Announce(msg));
            redistribute::drain(master);
            master.batch.finish(&mut master.store, true);
        }
        IbusMsg::RouteWithdraw(msg) => {
            master.redist_queue.push_back(RedistRequest::Withdraw(msg));
            redistribute::drain(master);
            master.batch.finish(&mut master.store, true);
        }
        // Forwarding-plane installation acknowledgment.
        IbusMsg::RouteSelectedUpd(msg) => {
            if let Err(error) = selected::process_selected_upd(
                &mut master.store,
                &mut master.batch,
                msg,
            ) {
                error.log();
            }
            master.batch.finish(&mut master.store, true);
        }
        IbusMsg::StateDumpRequest => {
            let dump = build_dump(master);
            send(&master.ibus_tx, IbusMsg::StateDumpUpd(Arc::new(dump)));
        }
        // Ignore other events, including the engine's own notifications
        // echoed back by the broadcast channel.
        _ => {}
    }
}

// Sends an interface update notification.
pub(crate) fn notify_iface_upd(ibus_tx: &IbusSender, iface: &Interface) {
    let msg = InterfaceUpdateMsg {
        ifname: iface.ifname.clone(),
        ifindex: iface.ifindex,
        flags: iface.flags,
    };
    send(ibus_tx, IbusMsg::InterfaceUpd(msg));
}

// Sends an interface delete notification.
pub(crate) fn notify_iface_del(ibus_tx: &IbusSender, ifname: &str) {
    send(ibus_tx, IbusMsg::InterfaceDel(ifname.to_owned()));
}

// Sends an address addition notification.
pub(crate) fn notify_addr_add(
    ibus_tx: &IbusSender,
    ifname: &str,
    addr: IpNetwork,
) {
    let msg = AddressMsg {
        ifname: ifname.to_owned(),
        addr,
        flags: AddressFlags::default(),
    };
    send(ibus_tx, IbusMsg::InterfaceAddressAdd(msg));
}

// Sends an address delete notification.
pub(crate) fn notify_addr_del(
    ibus_tx: &IbusSender,
    ifname: &str,
    addr: IpNetwork,
) {
    let msg = AddressMsg {
        ifname: ifname.to_owned(),
        addr,
        flags: AddressFlags::default(),
    };
    send(ibus_tx, IbusMsg::InterfaceAddressDel(msg));
}

// Sends a route redistribute update notification.
pub(crate) fn notify_redistribute_add(
    ibus_tx: &IbusSender,
    prefix: IpNetwork,
    route: &Route,
) {
    let msg = RouteMsg {
        protocol: route.protocol,
        prefix,
        distance: route.distance,
        metric: route.metric,
        nexthops: route.nexthops.clone(),
    };
    send(ibus_tx, IbusMsg::RouteRedistributeAdd(msg));
}

// Sends a route redistribute delete notification.
pub(crate) fn notify_redistribute_del(
    ibus_tx: &IbusSender,
    protocol: Protocol,
    prefix: IpNetwork,
) {
    let msg = RouteKeyMsg { protocol, prefix };
    send(ibus_tx, IbusMsg::RouteRedistributeDel(msg));
}

// ===== helper functions =====

fn build_dump(master: &Master) -> StateDump {
    StateDump {
        ports: master
            .ports
            .ports
            .values()
            .map(|port| PortDump {
                name: port.name.clone(),
                active: port.active,
                primary_v4: port.primary_v4,
                primary_v6: port.primary_v6,
                secondary_v4: port.secondary_v4.iter().copied().collect(),
                secondary_v6: port.secondary_v6.iter().copied().collect(),
                connected_v4: port.connected_v4.keys().copied().collect(),
                connected_v6: port.connected_v6.keys().copied().collect(),
            })
            .collect(),
        routes: master
            .rib
            .iter_all()
            .map(|(prefix, route)| RouteDump {
                prefix,
                protocol: route.protocol,
                distance: route.distance,
                metric: route.metric,
                active: route.flags.contains(RouteFlags::ACTIVE),
                nexthops: route.nexthops.iter().cloned().collect(),
                last_updated: route.last_updated,
            })
            .collect(),
    }
}

fn send(ibus_tx: &IbusSender, msg: IbusMsg) {
    let _ = ibus_tx.send(msg);
}
