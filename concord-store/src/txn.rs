//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

use crate::schema::{RowData, RowUuid, Table};

pub type TxnId = u64;

// Final status of a commit attempt.
//
// `Incomplete` is never reported by the server. It is the status a client
// observes while the commit is still in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum CommitStatus {
    Success,
    Unchanged,
    Incomplete,
    Aborted,
    Error,
}

// Lifecycle of a transaction as seen by its owning client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Open,
    Committing,
    Done(CommitStatus),
}

// Single mutation within a transaction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum TxnOp {
    Insert { uuid: RowUuid, data: RowData },
    Update { uuid: RowUuid, data: RowData },
    Delete { table: Table, uuid: RowUuid },
}

// Wire form of a transaction submitted for commit.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxnData {
    pub id: TxnId,
    pub ops: Vec<TxnOp>,
}

// Client-side transaction accumulating mutations until committed or
// dropped.
//
// Row identifiers returned by `insert` are provisional: they only become
// visible to replicas once the transaction commits successfully.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TxnState,
    ops: Vec<TxnOp>,
}

// ===== impl CommitStatus =====

impl Display for CommitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CommitStatus::Success => write!(f, "success"),
            CommitStatus::Unchanged => write!(f, "unchanged"),
            CommitStatus::Incomplete => write!(f, "incomplete"),
            CommitStatus::Aborted => write!(f, "aborted"),
            CommitStatus::Error => write!(f, "error"),
        }
    }
}

// ===== impl Transaction =====

impl Transaction {
    pub(crate) fn new(id: TxnId) -> Transaction {
        Transaction { id, state: TxnState::Open, ops: Vec::new() }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TxnState) {
        self.state = state;
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    // Stages a row insertion and returns its provisional identifier.
    pub fn insert(&mut self, data: RowData) -> RowUuid {
        let uuid = RowUuid::generate();
        self.ops.push(TxnOp::Insert { uuid, data });
        uuid
    }

    // Stages a full-row update.
    pub fn update(&mut self, uuid: RowUuid, data: RowData) {
        self.ops.push(TxnOp::Update { uuid, data });
    }

    // Stages a row deletion.
    pub fn delete(&mut self, table: Table, uuid: RowUuid) {
        self.ops.push(TxnOp::Delete { table, uuid });
    }

    pub(crate) fn take_data(&mut self) -> TxnData {
        TxnData { id: self.id, ops: std::mem::take(&mut self.ops) }
    }
}
