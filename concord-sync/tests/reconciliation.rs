//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use concord_store::client::{Store, StoreMsg};
use concord_store::notify::{ChangeOp, RowChange, UpdateBatch};
use concord_store::schema::{
    ColumnMask, InterfaceRow, NexthopRow, PortMode, PortRow, RouteRow,
    RowData, RowUuid, Table,
};
use concord_store::server::{self, ServerHandle};
use concord_store::txn::{CommitStatus, Transaction};
use concord_sync::port::PendingAction;
use concord_sync::{Config, Master, events, ibus};
use concord_utils::UnboundedReceiver;
use concord_utils::ibus::{IbusMsg, IbusReceiver, ibus_channel};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::{Nexthop, RouteKeyMsg, RouteMsg};
use const_addrs::{ip, net, net4, net6};
use ipnetwork::{IpNetwork, Ipv4Network};
use maplit::btreeset;

// ===== test harness =====

// Operator-facing store client, used to stage the configuration the
// engine reconciles against.
struct Operator {
    store: Store,
    rx: UnboundedReceiver<StoreMsg>,
}

impl Operator {
    async fn connect(server: &ServerHandle) -> Operator {
        let (mut store, mut rx) = server.connect("operator");
        match rx.recv().await.unwrap() {
            StoreMsg::Update(batch) => assert!(store.apply(&batch)),
            msg => panic!("unexpected message: {msg:?}"),
        }
        Operator { store, rx }
    }

    async fn commit(&mut self, mut txn: Transaction) {
        self.store.commit(&mut txn);
        loop {
            match self.rx.recv().await.unwrap() {
                StoreMsg::Update(batch) => {
                    self.store.apply(&batch);
                }
                StoreMsg::TxnReply { status, .. } => {
                    assert_eq!(status, CommitStatus::Success);
                    break;
                }
            }
        }
    }

    // Applies every update batch already broadcast by the server.
    fn sync(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            if let StoreMsg::Update(batch) = msg {
                self.store.apply(&batch);
            }
        }
    }
}

// Connects the engine and processes its snapshot batch, which runs the
// first reconciliation pass.
async fn connect_engine(
    server: &ServerHandle,
    config: Config,
) -> (Master, UnboundedReceiver<StoreMsg>, IbusReceiver) {
    let (ibus_tx, ibus_rx) = ibus_channel();
    let (store, mut rx) = server.connect("engine");
    let mut master = Master::new(store, ibus_tx, config);
    let msg = rx.recv().await.unwrap();
    assert!(matches!(msg, StoreMsg::Update(_)));
    events::process_store_msg(&mut master, msg).await;
    (master, rx, ibus_rx)
}

// Feeds the engine every queued store message, waiting for in-flight
// commits to complete, until it has nothing left to process.
async fn pump(master: &mut Master, rx: &mut UnboundedReceiver<StoreMsg>) {
    loop {
        if master.batch.in_flight() {
            let msg = rx.recv().await.unwrap();
            events::process_store_msg(master, msg).await;
        } else {
            match rx.try_recv() {
                Ok(msg) => events::process_store_msg(master, msg).await,
                Err(_) => break,
            }
        }
    }
}

fn iface_row(name: &str, ifindex: u32, up: bool) -> InterfaceRow {
    InterfaceRow {
        name: name.to_owned(),
        ifindex: Some(ifindex),
        admin_up: up,
        link_up: up,
    }
}

fn port_row(
    name: &str,
    interface: Option<RowUuid>,
    primary: Option<Ipv4Network>,
    secondary: BTreeSet<Ipv4Network>,
) -> PortRow {
    PortRow {
        name: name.to_owned(),
        mode: PortMode::Routed,
        interface,
        ipv4_address: primary,
        ipv4_secondary: secondary,
        ipv6_address: None,
        ipv6_secondary: Default::default(),
    }
}

// Stages a pre-existing connected route, as a previous incarnation of
// the daemon would have left it.
fn stage_connected(
    txn: &mut Transaction,
    prefix: IpNetwork,
    owner: &str,
) -> RowUuid {
    let nexthop = txn.insert(RowData::Nexthop(NexthopRow {
        addr: None,
        ifname: Some(owner.to_owned()),
        selected: false,
    }));
    txn.insert(RowData::Route(RouteRow {
        prefix,
        protocol: Protocol::DIRECT,
        distance: 0,
        metric: 0,
        selected: false,
        nexthops: btreeset![nexthop],
    }))
}

fn direct_prefixes(master: &Master) -> BTreeSet<IpNetwork> {
    master
        .store
        .db
        .routes
        .values()
        .filter(|row| row.protocol == Protocol::DIRECT)
        .map(|row| row.prefix)
        .collect()
}

fn announce_msg(prefix: IpNetwork, nexthop: Nexthop) -> RouteMsg {
    RouteMsg {
        protocol: Protocol::STATIC,
        prefix,
        distance: 1,
        metric: 0,
        nexthops: btreeset![nexthop],
    }
}

// ===== tests =====

// An addressless port at restart: the pre-existing connected route has
// no matching address and is purged.
#[tokio::test]
async fn restart_purges_addressless_port() {
    let server = server::start();
    let mut operator = Operator::connect(&server).await;

    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    txn.insert(RowData::Port(port_row(
        "eth1",
        Some(iface),
        None,
        Default::default(),
    )));
    stage_connected(&mut txn, net!("10.0.0.0/24"), "eth1");
    operator.commit(txn).await;

    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    assert!(master.restart.steady());
    assert!(master.store.db.routes.is_empty());
    assert!(master.store.db.nexthops.is_empty());
    let port = master.ports.ports.values().next().unwrap();
    assert_eq!(port.name, "eth1");
    assert_eq!(port.pending, PendingAction::NoChange);
    assert!(port.connected_v4.is_empty());
}

// A pre-existing connected route matching a current address is adopted
// rather than reinserted, with its selected flags corrected, and each
// store row is touched by at most one transaction.
#[tokio::test]
async fn restart_adopts_matching_route() {
    let server = server::start();
    let mut operator = Operator::connect(&server).await;

    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    txn.insert(RowData::Port(port_row(
        "eth1",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        Default::default(),
    )));
    let route = stage_connected(&mut txn, net!("10.0.0.0/24"), "eth1");
    operator.commit(txn).await;

    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    // The original row survived with its flags brought in line.
    let row = master.store.db.routes.get(&route).unwrap();
    assert!(row.selected);
    let nexthop = row.nexthops.first().unwrap();
    assert!(master.store.db.nexthops.get(nexthop).unwrap().selected);

    let port = master.ports.ports.values().next().unwrap();
    assert_eq!(
        port.connected_v4.get(&net4!("10.0.0.0/24")).copied(),
        Some(route)
    );

    // Snapshot, then exactly one engine transaction for the flag fixup.
    assert_eq!(master.store.seqno(), 3);
}

// The store's connected routes converge to exactly the canonical
// prefixes of the port's addresses, and replaying an identical
// notification changes nothing.
#[tokio::test]
async fn connected_address_round_trip() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;
    assert!(master.restart.steady());

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth2", 3, true)));
    txn.insert(RowData::Port(port_row(
        "eth2",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        btreeset![net4!("192.168.1.5/24")],
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert_eq!(
        direct_prefixes(&master),
        btreeset![net!("10.0.0.0/24"), net!("192.168.1.0/24")]
    );
    for row in master.store.db.routes.values() {
        assert!(row.selected);
        let nexthop = row.nexthops.first().unwrap();
        let nh_row = master.store.db.nexthops.get(nexthop).unwrap();
        assert_eq!(nh_row.ifname.as_deref(), Some("eth2"));
        assert!(nh_row.selected);
    }

    // The connected routes are mirrored into the RIB.
    let routes = master.rib.ipv4.get(&net4!("10.0.0.0/24")).unwrap();
    let route = routes.values().next().unwrap();
    assert_eq!(route.protocol, Protocol::DIRECT);
    assert_eq!(
        route.nexthops,
        btreeset![Nexthop::Interface { ifindex: 3 }]
    );

    // Replaying the port row verbatim is a no-op: no new rows, no new
    // transaction.
    let (port_uuid, port) = master.store.db.port_by_name("eth2").unwrap();
    let port = port.clone();
    let replay = UpdateBatch {
        seqno: master.store.seqno() + 1,
        changes: vec![RowChange {
            uuid: port_uuid,
            op: ChangeOp::Modify,
            data: RowData::Port(port),
            columns: ColumnMask::full(Table::Port),
        }],
    };
    operator.sync();
    let seqno = operator.store.seqno();
    events::process_store_msg(&mut master, StoreMsg::Update(replay)).await;
    pump(&mut master, &mut rx).await;
    operator.sync();
    assert_eq!(operator.store.seqno(), seqno);
    assert_eq!(direct_prefixes(&master).len(), 2);
}

// A primary address moving within its network updates nothing; moving
// to a different network produces exactly one transaction deleting the
// old prefix and inserting the new one.
#[tokio::test]
async fn primary_address_renumber() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    let port = txn.insert(RowData::Port(port_row(
        "eth1",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        Default::default(),
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    let (route, _) = master
        .store
        .db
        .route_by_prefix(Protocol::DIRECT, &net!("10.0.0.0/24"))
        .unwrap();

    // Same network: the canonical prefix set is unchanged and the pass
    // produces no route mutations.
    let seqno = master.store.seqno();
    operator.sync();
    let mut txn = operator.store.begin();
    txn.update(
        port,
        RowData::Port(port_row(
            "eth1",
            Some(iface),
            Some(net4!("10.0.0.2/24")),
            Default::default(),
        )),
    );
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert_eq!(master.store.seqno(), seqno + 1);
    assert_eq!(
        master
            .store
            .db
            .route_by_prefix(Protocol::DIRECT, &net!("10.0.0.0/24"))
            .map(|(uuid, _)| uuid),
        Some(route)
    );

    // Different network: one engine transaction, one delete plus one
    // insert.
    let seqno = master.store.seqno();
    let mut txn = operator.store.begin();
    txn.update(
        port,
        RowData::Port(port_row(
            "eth1",
            Some(iface),
            Some(net4!("10.0.1.2/24")),
            Default::default(),
        )),
    );
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert_eq!(master.store.seqno(), seqno + 2);
    assert_eq!(direct_prefixes(&master), btreeset![net!("10.0.1.0/24")]);
    assert!(
        master
            .rib
            .ipv4
            .get(&net4!("10.0.0.0/24"))
            .is_none_or(|routes| routes.is_empty())
    );
    assert!(master.rib.ipv4.get(&net4!("10.0.1.0/24")).is_some());
}

// Scenario C: an interface coming up flips the connected route's
// nexthop selected flag, and with it the route-level OR.
#[tokio::test]
async fn port_down_up_selected_flags() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(InterfaceRow {
        name: "eth2".to_owned(),
        ifindex: Some(3),
        admin_up: true,
        link_up: false,
    }));
    txn.insert(RowData::Port(port_row(
        "eth2",
        Some(iface),
        None,
        btreeset![net4!("192.168.1.5/24")],
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    let (route, row) = master
        .store
        .db
        .route_by_prefix(Protocol::DIRECT, &net!("192.168.1.0/24"))
        .unwrap();
    assert!(!row.selected);
    let nexthop = *row.nexthops.first().unwrap();
    assert!(!master.store.db.nexthops.get(&nexthop).unwrap().selected);

    // Link up.
    operator.sync();
    let mut txn = operator.store.begin();
    txn.update(iface, RowData::Interface(iface_row("eth2", 3, true)));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert!(master.store.db.routes.get(&route).unwrap().selected);
    assert!(master.store.db.nexthops.get(&nexthop).unwrap().selected);
}

// The differ removes RIB state the store no longer authorizes, keyed
// per address family, and never touches store rows.
#[tokio::test]
async fn stale_route_differ() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    // A protocol engine announces one route per family.
    let v4 = net!("203.0.113.0/24");
    let v6 = net!("2001:db8:100::/64");
    let msg = announce_msg(
        v4,
        Nexthop::Address { addr: ip!("10.0.0.9"), ifindex: 2 },
    );
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;
    pump(&mut master, &mut rx).await;
    let msg = announce_msg(
        v6,
        Nexthop::Address { addr: ip!("2001:db8::9"), ifindex: 2 },
    );
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;
    pump(&mut master, &mut rx).await;

    assert!(master.rib.ipv4.get(&net4!("203.0.113.0/24")).is_some());
    assert!(master.rib.ipv6.get(&net6!("2001:db8:100::/64")).is_some());
    let row = master
        .store
        .db
        .route_by_prefix(Protocol::STATIC, &v4)
        .map(|(_, row)| row)
        .unwrap();
    assert!(row.selected);

    // The operator revokes the IPv6 route; the equal-looking IPv4 key
    // must not be affected.
    operator.sync();
    let (route, row) = operator
        .store
        .db
        .route_by_prefix(Protocol::STATIC, &v6)
        .map(|(uuid, row)| (uuid, row.clone()))
        .unwrap();
    let mut txn = operator.store.begin();
    txn.delete(Table::Route, route);
    for nexthop in &row.nexthops {
        txn.delete(Table::Nexthop, *nexthop);
    }
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert!(
        master
            .rib
            .ipv6
            .get(&net6!("2001:db8:100::/64"))
            .is_none_or(|routes| routes.is_empty())
    );
    let routes = master.rib.ipv4.get(&net4!("203.0.113.0/24")).unwrap();
    assert!(!routes.is_empty());

    // The reverse direction is off limits: dropping the RIB entry must
    // not delete the persisted row.
    let msg = RouteKeyMsg { protocol: Protocol::STATIC, prefix: v4 };
    ibus::process_msg(&mut master, IbusMsg::RouteIpDel(msg)).await;
    master.process_update_queue().await;
    pump(&mut master, &mut rx).await;

    assert!(
        master
            .rib
            .ipv4
            .get(&net4!("203.0.113.0/24"))
            .is_none_or(|routes| routes.is_empty())
    );
    assert!(
        master
            .store
            .db
            .route_by_prefix(Protocol::STATIC, &v4)
            .is_some()
    );
}

// A withdrawal racing ahead of its announcement must not drive the
// per-protocol announce count negative.
#[tokio::test]
async fn redistribute_withdraw_underflow() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let prefix = net!("198.51.100.0/24");
    let key = RouteKeyMsg { protocol: Protocol::STATIC, prefix };

    // Withdraw before any announcement: rejected, count untouched.
    ibus::process_msg(&mut master, IbusMsg::RouteWithdraw(key.clone())).await;
    pump(&mut master, &mut rx).await;
    assert_eq!(
        master.announced.get(&Protocol::STATIC).copied().unwrap_or(0),
        0
    );

    let msg = announce_msg(
        prefix,
        Nexthop::Address { addr: ip!("10.0.0.9"), ifindex: 0 },
    );
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;
    pump(&mut master, &mut rx).await;
    assert_eq!(master.announced.get(&Protocol::STATIC).copied(), Some(1));

    ibus::process_msg(&mut master, IbusMsg::RouteWithdraw(key.clone())).await;
    pump(&mut master, &mut rx).await;
    assert_eq!(master.announced.get(&Protocol::STATIC).copied(), Some(0));
    assert!(
        master
            .store
            .db
            .route_by_prefix(Protocol::STATIC, &prefix)
            .is_none()
    );

    // And once more into the void.
    ibus::process_msg(&mut master, IbusMsg::RouteWithdraw(key)).await;
    pump(&mut master, &mut rx).await;
    assert_eq!(master.announced.get(&Protocol::STATIC).copied(), Some(0));
}

// With a tiny batch limit the engine needs several transactions to
// converge, deferring work while commits are in flight, but it always
// gets there.
#[tokio::test]
async fn batch_limit_convergence() {
    let server = server::start();
    let config = Config { txn_batch_limit: 2, ..Default::default() };
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, config).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let seqno = operator.store.seqno();
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth3", 4, true)));
    txn.insert(RowData::Port(port_row(
        "eth3",
        Some(iface),
        Some(net4!("10.1.0.1/24")),
        btreeset![net4!("10.2.0.1/24"), net4!("10.3.0.1/24")],
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert_eq!(
        direct_prefixes(&master),
        btreeset![
            net!("10.1.0.0/24"),
            net!("10.2.0.0/24"),
            net!("10.3.0.0/24")
        ]
    );
    let port = master.ports.ports.values().next().unwrap();
    assert_eq!(port.pending, PendingAction::NoChange);

    // One operator transaction plus at least three bounded engine
    // transactions (two mutations per connected route).
    operator.sync();
    assert!(operator.store.seqno() >= seqno + 4);
}

// A port leaving the L3 domain has its connected routes cleaned up and
// is evicted from the cache one pass later.
#[tokio::test]
async fn port_changed_to_l2() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    let port = txn.insert(RowData::Port(port_row(
        "eth1",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        Default::default(),
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;
    assert_eq!(direct_prefixes(&master).len(), 1);

    let mut txn = operator.store.begin();
    let mut row = port_row(
        "eth1",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        Default::default(),
    );
    row.mode = PortMode::Bridged;
    txn.update(port, RowData::Port(row));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    assert!(master.store.db.routes.is_empty());
    assert!(master.ports.ports.is_empty());
    assert!(
        master
            .rib
            .ipv4
            .get(&net4!("10.0.0.0/24"))
            .is_none_or(|routes| routes.is_empty())
    );
}

// A commit built on a precondition that disappeared mid-flight fails
// cleanly; the engine re-derives state from the replica and keeps
// going.
#[tokio::test]
async fn commit_failure_recovery() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    let prefix = net!("203.0.113.0/24");
    let msg = announce_msg(
        prefix,
        Nexthop::Address { addr: ip!("10.0.0.9"), ifindex: 2 },
    );
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;
    pump(&mut master, &mut rx).await;

    // The operator deletes the route behind the engine's back.
    operator.sync();
    let (route, row) = operator
        .store
        .db
        .route_by_prefix(Protocol::STATIC, &prefix)
        .map(|(uuid, row)| (uuid, row.clone()))
        .unwrap();
    let mut txn = operator.store.begin();
    txn.delete(Table::Route, route);
    for nexthop in &row.nexthops {
        txn.delete(Table::Nexthop, *nexthop);
    }
    operator.commit(txn).await;

    // The engine withdraws against its stale replica; the commit is
    // rejected and the engine recovers on the spot.
    let key = RouteKeyMsg { protocol: Protocol::STATIC, prefix };
    ibus::process_msg(&mut master, IbusMsg::RouteWithdraw(key)).await;
    pump(&mut master, &mut rx).await;

    assert!(master.restart.steady());
    assert!(
        master
            .store
            .db
            .route_by_prefix(Protocol::STATIC, &prefix)
            .is_none()
    );
    assert!(
        master
            .rib
            .ipv4
            .get(&net4!("203.0.113.0/24"))
            .is_none_or(|routes| routes.is_empty())
    );

    // Still in business.
    let msg = announce_msg(
        prefix,
        Nexthop::Address { addr: ip!("10.0.0.9"), ifindex: 2 },
    );
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;
    pump(&mut master, &mut rx).await;
    assert!(
        master
            .store
            .db
            .route_by_prefix(Protocol::STATIC, &prefix)
            .is_some()
    );
    assert!(master.rib.ipv4.get(&net4!("203.0.113.0/24")).is_some());
}

// A distance change on a persisted route must retire the RIB entry the
// row contributed at its old distance.
#[tokio::test]
async fn distance_change_replaces_rib_entry() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let prefix = net!("203.0.113.0/24");
    let msg = announce_msg(
        prefix,
        Nexthop::Address { addr: ip!("10.0.0.9"), ifindex: 0 },
    );
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;
    pump(&mut master, &mut rx).await;

    let routes = master.rib.ipv4.get(&net4!("203.0.113.0/24")).unwrap();
    assert_eq!(routes.keys().copied().collect::<Vec<_>>(), vec![1]);

    // The operator reclassifies the route at a higher distance.
    operator.sync();
    let (route, row) = operator
        .store
        .db
        .route_by_prefix(Protocol::STATIC, &prefix)
        .map(|(uuid, row)| (uuid, row.clone()))
        .unwrap();
    let mut txn = operator.store.begin();
    let mut new = row;
    new.distance = 5;
    txn.update(route, RowData::Route(new));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    // Only the new entry remains; the old one must not keep winning the
    // best-route selection.
    let routes = master.rib.ipv4.get(&net4!("203.0.113.0/24")).unwrap();
    assert_eq!(routes.keys().copied().collect::<Vec<_>>(), vec![5]);
}

// A persisted route whose interface nexthop is unknown at ingestion time
// enters the RIB once the interface row shows up.
#[tokio::test]
async fn route_ingested_after_late_interface() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let prefix = net!("203.0.113.0/24");
    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let nexthop = txn.insert(RowData::Nexthop(NexthopRow {
        addr: None,
        ifname: Some("eth9".to_owned()),
        selected: false,
    }));
    txn.insert(RowData::Route(RouteRow {
        prefix,
        protocol: Protocol::STATIC,
        distance: 1,
        metric: 0,
        selected: false,
        nexthops: btreeset![nexthop],
    }));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    // Unresolvable for now.
    assert!(
        master
            .rib
            .ipv4
            .get(&net4!("203.0.113.0/24"))
            .is_none_or(|routes| routes.is_empty())
    );

    // The interface row arrives late; the route must not stay lost.
    let mut txn = operator.store.begin();
    txn.insert(RowData::Interface(iface_row("eth9", 9, true)));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    let routes = master.rib.ipv4.get(&net4!("203.0.113.0/24")).unwrap();
    let route = routes.values().next().unwrap();
    assert_eq!(route.nexthops, btreeset![Nexthop::Interface { ifindex: 9 }]);
    let row = master
        .store
        .db
        .route_by_prefix(Protocol::STATIC, &prefix)
        .map(|(_, row)| row)
        .unwrap();
    assert!(row.selected);
}

// An announcement carrying more nexthops than the batch limit is staged
// in bounded commit groups and resumes across commits until the full
// nexthop set is persisted.
#[tokio::test]
async fn announce_beyond_batch_limit() {
    let server = server::start();
    let config = Config { txn_batch_limit: 2, ..Default::default() };
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, config).await;
    pump(&mut master, &mut rx).await;

    let prefix = net!("203.0.113.0/24");
    let msg = RouteMsg {
        protocol: Protocol::STATIC,
        prefix,
        distance: 1,
        metric: 0,
        nexthops: btreeset![
            Nexthop::Address { addr: ip!("10.0.0.1"), ifindex: 0 },
            Nexthop::Address { addr: ip!("10.0.0.2"), ifindex: 0 },
            Nexthop::Address { addr: ip!("10.0.0.3"), ifindex: 0 },
            Nexthop::Address { addr: ip!("10.0.0.4"), ifindex: 0 }
        ],
    };
    ibus::process_msg(&mut master, IbusMsg::RouteAnnounce(msg)).await;

    // The limit forced an early commit; the staged count stayed within
    // one commit group of it and the remainder of the announcement is
    // parked for resumption.
    assert!(master.batch.in_flight());
    assert!(master.batch.mutation_count() <= 3);
    assert_eq!(master.redist_queue.len(), 1);

    pump(&mut master, &mut rx).await;

    assert!(master.redist_queue.is_empty());
    let row = master
        .store
        .db
        .route_by_prefix(Protocol::STATIC, &prefix)
        .map(|(_, row)| row)
        .unwrap();
    assert_eq!(row.nexthops.len(), 4);
    assert!(row.selected);
    assert_eq!(master.store.db.nexthops.len(), 4);
    assert!(master.store.db.nexthops.values().all(|nh| nh.selected));
    let routes = master.rib.ipv4.get(&net4!("203.0.113.0/24")).unwrap();
    assert_eq!(routes.values().next().unwrap().nexthops.len(), 4);
    assert_eq!(master.announced.get(&Protocol::STATIC).copied(), Some(1));
}

// Renaming a port rewrites the owner name recorded on its connected
// routes' nexthop rows.
#[tokio::test]
async fn port_rename_rewrites_route_owner() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    let port = txn.insert(RowData::Port(port_row(
        "eth1",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        Default::default(),
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    let (route, row) = master
        .store
        .db
        .route_by_prefix(Protocol::DIRECT, &net!("10.0.0.0/24"))
        .map(|(uuid, row)| (uuid, row.clone()))
        .unwrap();
    let nexthop = *row.nexthops.first().unwrap();
    assert_eq!(
        master.store.db.nexthops.get(&nexthop).unwrap().ifname.as_deref(),
        Some("eth1")
    );

    operator.sync();
    let mut txn = operator.store.begin();
    txn.update(
        port,
        RowData::Port(port_row(
            "wan0",
            Some(iface),
            Some(net4!("10.0.0.1/24")),
            Default::default(),
        )),
    );
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    let cached = master.ports.ports.values().next().unwrap();
    assert_eq!(cached.name, "wan0");
    assert_eq!(
        cached.connected_v4.get(&net4!("10.0.0.0/24")).copied(),
        Some(route)
    );
    // The persisted owner name followed the rename; a later restart walk
    // keys its leftovers by it.
    assert_eq!(
        master.store.db.nexthops.get(&nexthop).unwrap().ifname.as_deref(),
        Some("wan0")
    );
}

// Interface dumps and operational state snapshots over the bus.
#[tokio::test]
async fn diagnostics() {
    let server = server::start();
    let (mut master, mut rx, _ibus_rx) =
        connect_engine(&server, Config::default()).await;
    pump(&mut master, &mut rx).await;

    let mut operator = Operator::connect(&server).await;
    let mut txn = operator.store.begin();
    let iface = txn.insert(RowData::Interface(iface_row("eth1", 2, true)));
    txn.insert(RowData::Port(port_row(
        "eth1",
        Some(iface),
        Some(net4!("10.0.0.1/24")),
        Default::default(),
    )));
    operator.commit(txn).await;
    pump(&mut master, &mut rx).await;

    // A late-starting protocol engine asks for the current state.
    let mut sub = master.ibus_tx.subscribe();
    ibus::process_msg(&mut master, IbusMsg::InterfaceDump).await;
    let mut saw_iface = false;
    let mut saw_addr = false;
    while let Ok(msg) = sub.try_recv() {
        match msg {
            IbusMsg::InterfaceUpd(msg) => {
                assert_eq!(msg.ifname, "eth1");
                assert_eq!(msg.ifindex, 2);
                saw_iface = true;
            }
            IbusMsg::InterfaceAddressAdd(msg) => {
                assert_eq!(msg.addr, net!("10.0.0.1/24"));
                saw_addr = true;
            }
            _ => (),
        }
    }
    assert!(saw_iface && saw_addr);

    // Operational snapshot.
    let mut sub = master.ibus_tx.subscribe();
    ibus::process_msg(&mut master, IbusMsg::StateDumpRequest).await;
    let dump = loop {
        match sub.try_recv().unwrap() {
            IbusMsg::StateDumpUpd(dump) => break dump,
            _ => continue,
        }
    };
    assert_eq!(dump.ports.len(), 1);
    assert_eq!(dump.ports[0].name, "eth1");
    assert!(dump.ports[0].active);
    assert_eq!(dump.ports[0].connected_v4, vec![net4!("10.0.0.0/24")]);
    assert!(
        dump.routes
            .iter()
            .any(|route| route.protocol == Protocol::DIRECT
                && route.prefix == net!("10.0.0.0/24")
                && route.active)
    );
}
