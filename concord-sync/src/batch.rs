//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use concord_store::client::Store;
use concord_store::txn::{CommitStatus, Transaction, TxnId, TxnState};
use tracing::debug;

use crate::debug::Debug;
use crate::error::Error;

// Transaction batcher.
//
// Funnels all store mutations through a single transaction that is
// committed once the staged mutation count reaches the configured limit,
// or at the end of a processing pass. At most one transaction exists at
// any time: while a commit is in flight, `ensure_open` fails with
// `Error::TxnPending` and callers defer their work to a later pass.
#[derive(Debug)]
pub struct TxnBatch {
    limit: usize,
    txn: Option<Transaction>,
    mutations: usize,
    replay: bool,
}

// ===== impl TxnBatch =====

impl TxnBatch {
    pub(crate) fn new(limit: usize) -> TxnBatch {
        TxnBatch { limit, txn: None, mutations: 0, replay: false }
    }

    // Returns the open transaction, creating one if none exists.
    pub fn ensure_open(
        &mut self,
        store: &mut Store,
    ) -> Result<&mut Transaction, Error> {
        if let Some(txn) = &self.txn
            && txn.state() != TxnState::Open
        {
            return Err(Error::TxnPending);
        }
        Ok(self.txn.get_or_insert_with(|| store.begin()))
    }

    // Records one staged mutation.
    pub fn note_mutation(&mut self) {
        self.mutations += 1;
    }

    // Number of mutations staged since the last completed commit.
    pub fn mutation_count(&self) -> usize {
        self.mutations
    }

    // Commits the open transaction if the mutation limit was reached, or
    // unconditionally at the end of a pass.
    pub fn finish(&mut self, store: &mut Store, last: bool) {
        let Some(txn) = &mut self.txn else {
            return;
        };
        if txn.state() != TxnState::Open {
            return;
        }
        if txn.is_empty() {
            if last {
                self.txn = None;
            }
            return;
        }
        if !last && self.mutations < self.limit {
            return;
        }

        let id = txn.id();
        let ops = txn.op_count();
        store.commit(txn);
        if let TxnState::Done(status) = txn.state() {
            // The server is gone; the commit failed on submission.
            Error::TxnFailed(id, status).log();
            self.txn = None;
            self.mutations = 0;
            self.replay = true;
        } else {
            Debug::TxnCommit(id, ops).log();
        }
    }

    // Handles the completion of an in-flight commit.
    pub fn complete(&mut self, id: TxnId, status: CommitStatus) {
        let Some(txn) = &self.txn else {
            debug!(txn_id = id, %status, "unmatched transaction reply");
            return;
        };
        if txn.id() != id {
            debug!(txn_id = id, %status, "unmatched transaction reply");
            return;
        }

        match status {
            CommitStatus::Success | CommitStatus::Unchanged => {
                debug!(txn_id = id, %status, "transaction completed");
            }
            CommitStatus::Aborted | CommitStatus::Error => {
                Error::TxnFailed(id, status).log();
                self.replay = true;
            }
            // Still in flight; keep waiting.
            CommitStatus::Incomplete => return,
        }
        self.txn = None;
        self.mutations = 0;
    }

    // Whether a commit is currently in flight.
    pub fn in_flight(&self) -> bool {
        self.txn
            .as_ref()
            .is_some_and(|txn| txn.state() == TxnState::Committing)
    }

    // Takes the replay flag, set when a commit fails and the state derived
    // from it needs to be rechecked against the replica.
    pub(crate) fn take_replay(&mut self) -> bool {
        std::mem::take(&mut self.replay)
    }
}
