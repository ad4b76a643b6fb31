//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]
#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod batch;
pub mod connected;
pub mod debug;
pub mod diff;
pub mod error;
pub mod events;
pub mod ibus;
pub mod netlink;
pub mod port;
pub mod redistribute;
pub mod restart;
pub mod rib;
pub mod selected;

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use concord_store::client::{Store, StoreMsg};
use concord_store::server::ServerHandle;
use concord_utils::UnboundedReceiver;
use concord_utils::ibus::{IbusReceiver, IbusSender};
use concord_utils::protocol::Protocol;
use concord_utils::southbound::InterfaceFlags;
use derive_new::new;
use tokio::time;
use tracing::Instrument;

use crate::batch::TxnBatch;
use crate::netlink::NetlinkHandle;
use crate::port::PortCache;
use crate::redistribute::RedistRequest;
use crate::restart::RestartCoordinator;
use crate::rib::Rib;

// Reconciliation engine context.
//
// Owns every cache the engine mutates; all of them are touched only from
// the engine's own task. Other tasks are reached exclusively through
// channels carrying names, row identifiers or prefixes.
pub struct Master {
    // Internal bus Tx channel.
    pub ibus_tx: IbusSender,
    // Store client and its local replica.
    pub store: Store,
    // Transaction batcher.
    pub batch: TxnBatch,
    // Netlink socket.
    pub netlink: NetlinkHandle,
    // List of interfaces, keyed by name.
    pub interfaces: BTreeMap<String, Interface>,
    // L3 port cache.
    pub ports: PortCache,
    // RIB.
    pub rib: Rib,
    // Restart reconciliation coordinator.
    pub restart: RestartCoordinator,
    // Per-protocol count of announced routes.
    pub announced: BTreeMap<Protocol, u32>,
    // Redistribution requests awaiting (or resuming) persistence.
    pub redist_queue: VecDeque<RedistRequest>,
}

#[derive(Debug, new)]
pub struct Interface {
    pub ifname: String,
    pub ifindex: u32,
    pub flags: InterfaceFlags,
}

// Engine runtime settings.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    // Mutation count that triggers an early transaction commit.
    pub txn_batch_limit: usize,
    // Interval between periodic stale-route diffs, in seconds.
    pub stale_diff_interval: u64,
}

// ===== impl Master =====

impl Master {
    pub fn new(store: Store, ibus_tx: IbusSender, config: Config) -> Master {
        Master {
            ibus_tx,
            store,
            batch: TxnBatch::new(config.txn_batch_limit),
            netlink: NetlinkHandle::init(),
            interfaces: Default::default(),
            ports: Default::default(),
            rib: Default::default(),
            restart: Default::default(),
            announced: Default::default(),
            redist_queue: Default::default(),
        }
    }

    // Programs the routes whose RIB entries changed and synchronizes their
    // persisted selected flags.
    pub async fn process_update_queue(&mut self) {
        self.rib
            .process_update_queue(
                &self.netlink,
                &self.interfaces,
                &mut self.store,
                &mut self.batch,
                &self.ibus_tx,
            )
            .await;
        self.batch.finish(&mut self.store, true);
    }

    async fn run(
        &mut self,
        mut msg_rx: UnboundedReceiver<StoreMsg>,
        mut ibus_rx: IbusReceiver,
        diff_interval: Duration,
    ) {
        let mut diff_timer = time::interval_at(
            time::Instant::now() + diff_interval,
            diff_interval,
        );

        loop {
            tokio::select! {
                Some(msg) = msg_rx.recv() => {
                    events::process_store_msg(self, msg).await;
                }
                Ok(msg) = ibus_rx.recv() => {
                    ibus::process_msg(self, msg).await;
                }
                Some(_) = self.rib.update_queue_rx.recv() => {
                    self.process_update_queue().await;
                }
                _ = diff_timer.tick() => {
                    // Periodic backstop for missed deletion triggers.
                    if self.restart.steady() {
                        diff::run(
                            &mut self.rib,
                            &self.store.db,
                            &self.interfaces,
                        );
                        self.process_update_queue().await;
                    }
                }
            }
        }
    }
}

// ===== impl Config =====

impl Default for Config {
    fn default() -> Config {
        Config { txn_batch_limit: 32, stale_diff_interval: 30 }
    }
}

// ===== global functions =====

pub fn start(
    server: &ServerHandle,
    client_name: &str,
    config: Config,
    ibus_tx: IbusSender,
    ibus_rx: IbusReceiver,
) {
    let (store, msg_rx) = server.connect(client_name);

    tokio::spawn(
        async move {
            let mut master = Master::new(store, ibus_tx, config);

            // Re-adopt the routes a previous incarnation of the daemon
            // left in the kernel; the differ reclaims the stale ones.
            for msg in master.netlink.fetch_routes().await {
                master.rib.ip_route_add(msg);
            }

            let diff_interval =
                Duration::from_secs(config.stale_diff_interval);
            master.run(msg_rx, ibus_rx, diff_interval).await;
        }
        .instrument(tracing::debug_span!("sync")),
    );
}
