//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashSet;
use std::fmt::{Display, Formatter, Result as FmtResult};

use concord_utils::{UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::{Store, StoreMsg};
use crate::db::Database;
use crate::notify::{ChangeOp, RowChange, UpdateBatch};
use crate::schema::{ColumnMask, RowUuid, Table};
use crate::txn::{CommitStatus, TxnData, TxnOp};

// Request sent by a client to the server task.
#[derive(Debug)]
pub(crate) enum ServerRequest {
    Connect { name: String, msg_tx: UnboundedSender<StoreMsg> },
    Commit { reply_tx: UnboundedSender<StoreMsg>, txn: TxnData },
}

// Handle used to connect new clients to a running server.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    request_tx: UnboundedSender<ServerRequest>,
}

// Reason a commit was rejected.
#[derive(Debug)]
enum CommitError {
    DuplicateRow { table: Table, uuid: RowUuid },
    RowNotFound { table: Table, uuid: RowUuid },
    DuplicateName { table: Table, name: String },
    DuplicateRoute,
    DanglingRef { table: Table, uuid: RowUuid },
    EmptyNexthop { uuid: RowUuid },
}

// ===== impl ServerHandle =====

impl ServerHandle {
    // Connects a new client, returning its store handle and the receiving
    // end of its message channel.
    //
    // The first message delivered is an update batch carrying a full
    // snapshot of the database.
    pub fn connect(&self, name: &str) -> (Store, UnboundedReceiver<StoreMsg>) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let _ = self.request_tx.send(ServerRequest::Connect {
            name: name.to_owned(),
            msg_tx: msg_tx.clone(),
        });
        let store =
            Store::new(name.to_owned(), self.request_tx.clone(), msg_tx);
        (store, msg_rx)
    }
}

// ===== impl CommitError =====

impl Display for CommitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CommitError::DuplicateRow { table, uuid } => {
                write!(f, "row already exists in table {table}: {uuid}")
            }
            CommitError::RowNotFound { table, uuid } => {
                write!(f, "row not found in table {table}: {uuid}")
            }
            CommitError::DuplicateName { table, name } => {
                write!(f, "duplicate name in table {table}: {name}")
            }
            CommitError::DuplicateRoute => {
                write!(f, "duplicate (protocol, prefix) in route table")
            }
            CommitError::DanglingRef { table, uuid } => {
                write!(f, "reference to missing row in table {table}: {uuid}")
            }
            CommitError::EmptyNexthop { uuid } => {
                write!(f, "nexthop row without address or interface: {uuid}")
            }
        }
    }
}

// ===== global functions =====

// Starts the server task with an empty database.
pub fn start() -> ServerHandle {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    tokio::task::spawn(run(request_rx));
    ServerHandle { request_tx }
}

async fn run(mut request_rx: UnboundedReceiver<ServerRequest>) {
    let mut db = Database::default();
    // The empty database counts as the first committed state.
    let mut seqno = 1u64;
    let mut clients: Vec<UnboundedSender<StoreMsg>> = Vec::new();

    while let Some(request) = request_rx.recv().await {
        match request {
            ServerRequest::Connect { name, msg_tx } => {
                debug!(client = %name, %seqno, "client connected");
                let mut batch = UpdateBatch::new(seqno);
                batch.changes = db.snapshot();
                let _ = msg_tx.send(StoreMsg::Update(batch));
                clients.push(msg_tx);
            }
            ServerRequest::Commit { reply_tx, txn } => {
                let id = txn.id;
                let status = match commit(&mut db, txn) {
                    Ok(changes) if changes.is_empty() => {
                        CommitStatus::Unchanged
                    }
                    Ok(changes) => {
                        seqno += 1;
                        debug!(
                            txn_id = id, %seqno,
                            changes = changes.len(),
                            "transaction committed"
                        );
                        let batch = UpdateBatch { seqno, changes };
                        // Notify all clients, the committing one included,
                        // before completing the transaction.
                        clients.retain(|msg_tx| {
                            msg_tx
                                .send(StoreMsg::Update(batch.clone()))
                                .is_ok()
                        });
                        CommitStatus::Success
                    }
                    Err(error) => {
                        warn!(txn_id = id, %error, "commit rejected");
                        CommitStatus::Error
                    }
                };
                let _ = reply_tx.send(StoreMsg::TxnReply { id, status });
            }
        }
    }
}

// Validates and applies a transaction, returning the resulting row
// changes. The database is only modified if the whole transaction is
// accepted.
fn commit(
    db: &mut Database,
    txn: TxnData,
) -> Result<Vec<RowChange>, CommitError> {
    let mut work = db.clone();
    let mut changes = Vec::new();

    for op in txn.ops {
        match op {
            TxnOp::Insert { uuid, data } => {
                let table = data.table();
                if work.contains(table, &uuid) {
                    return Err(CommitError::DuplicateRow { table, uuid });
                }
                work.insert(uuid, data.clone());
                changes.push(RowChange {
                    uuid,
                    op: ChangeOp::Insert,
                    data,
                    columns: ColumnMask::full(table),
                });
            }
            TxnOp::Update { uuid, data } => {
                let table = data.table();
                let Some(old) = work.get(table, &uuid) else {
                    return Err(CommitError::RowNotFound { table, uuid });
                };
                let columns = data.changed_columns(&old);
                if columns.is_empty() {
                    continue;
                }
                work.insert(uuid, data.clone());
                changes.push(RowChange {
                    uuid,
                    op: ChangeOp::Modify,
                    data,
                    columns,
                });
            }
            TxnOp::Delete { table, uuid } => {
                let Some(old) = work.remove(table, &uuid) else {
                    return Err(CommitError::RowNotFound { table, uuid });
                };
                changes.push(RowChange {
                    uuid,
                    op: ChangeOp::Delete,
                    data: old,
                    columns: ColumnMask::none(table),
                });
            }
        }
    }

    validate(&work)?;
    *db = work;
    Ok(changes)
}

// Integrity checks applied to the post-transaction state.
fn validate(db: &Database) -> Result<(), CommitError> {
    let mut names = HashSet::new();
    for row in db.interfaces.values() {
        if !names.insert(&row.name) {
            return Err(CommitError::DuplicateName {
                table: Table::Interface,
                name: row.name.clone(),
            });
        }
    }
    names.clear();
    for row in db.ports.values() {
        if !names.insert(&row.name) {
            return Err(CommitError::DuplicateName {
                table: Table::Port,
                name: row.name.clone(),
            });
        }
    }

    let mut keys = HashSet::new();
    for row in db.routes.values() {
        if !keys.insert((row.protocol, row.prefix)) {
            return Err(CommitError::DuplicateRoute);
        }
        for nexthop in &row.nexthops {
            if !db.nexthops.contains_key(nexthop) {
                return Err(CommitError::DanglingRef {
                    table: Table::Nexthop,
                    uuid: *nexthop,
                });
            }
        }
    }

    for row in db.ports.values() {
        if let Some(interface) = &row.interface
            && !db.interfaces.contains_key(interface)
        {
            return Err(CommitError::DanglingRef {
                table: Table::Interface,
                uuid: *interface,
            });
        }
    }

    for (uuid, row) in &db.nexthops {
        if row.addr.is_none() && row.ifname.is_none() {
            return Err(CommitError::EmptyNexthop { uuid: *uuid });
        }
    }

    Ok(())
}
