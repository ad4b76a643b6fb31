//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use concord_utils::UnboundedSender;
use tracing::debug;

use crate::db::Database;
use crate::notify::UpdateBatch;
use crate::server::ServerRequest;
use crate::txn::{CommitStatus, Transaction, TxnId, TxnState};

// Message delivered to a connected client.
#[derive(Clone, Debug)]
pub enum StoreMsg {
    // Committed row changes, including the client's own.
    Update(UpdateBatch),
    // Completion of a commit previously submitted by this client.
    TxnReply { id: TxnId, status: CommitStatus },
}

// Client handle to the store.
//
// Owns a local replica of the database, kept up to date by feeding
// received update batches to `apply`. Mutations go through transactions
// created with `begin` and submitted with `commit`; the outcome arrives
// later as a `TxnReply` message.
#[derive(Debug)]
pub struct Store {
    pub name: String,
    pub db: Database,
    seqno: u64,
    next_txn_id: TxnId,
    request_tx: UnboundedSender<ServerRequest>,
    msg_tx: UnboundedSender<StoreMsg>,
}

// ===== impl Store =====

impl Store {
    pub(crate) fn new(
        name: String,
        request_tx: UnboundedSender<ServerRequest>,
        msg_tx: UnboundedSender<StoreMsg>,
    ) -> Store {
        Store {
            name,
            db: Database::default(),
            seqno: 0,
            next_txn_id: 1,
            request_tx,
            msg_tx,
        }
    }

    // Sequence number of the last applied update batch.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    // Applies an update batch to the local replica.
    //
    // Returns `false` when the batch is a duplicate or out-of-order
    // delivery, in which case the replica is left untouched.
    pub fn apply(&mut self, batch: &UpdateBatch) -> bool {
        if batch.seqno <= self.seqno {
            debug!(
                client = %self.name, seqno = batch.seqno,
                "discarding stale update batch"
            );
            return false;
        }
        self.seqno = batch.seqno;
        for change in &batch.changes {
            self.db.apply(change);
        }
        true
    }

    // Opens a new transaction.
    pub fn begin(&mut self) -> Transaction {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        Transaction::new(id)
    }

    // Submits a transaction for commit.
    //
    // The transaction moves to the `Committing` state; its final status is
    // reported through a `TxnReply` message. If the server is gone the
    // transaction fails immediately with an `Error` status.
    pub fn commit(&mut self, txn: &mut Transaction) {
        let data = txn.take_data();
        let request = ServerRequest::Commit {
            reply_tx: self.msg_tx.clone(),
            txn: data,
        };
        match self.request_tx.send(request) {
            Ok(_) => txn.set_state(TxnState::Committing),
            Err(_) => txn.set_state(TxnState::Done(CommitStatus::Error)),
        }
    }
}
