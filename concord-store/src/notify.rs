//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

use crate::schema::{ColumnMask, RowData, RowUuid};

// Kind of change applied to a row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum ChangeOp {
    Insert,
    Modify,
    Delete,
}

// Single row change within an update batch.
//
// `data` always carries a full row snapshot: the new content for inserts
// and modifications, the last committed content for deletions. `columns`
// narrows modifications down to the columns that actually changed; it is
// full for inserts and empty for deletions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RowChange {
    pub uuid: RowUuid,
    pub op: ChangeOp,
    pub data: RowData,
    pub columns: ColumnMask,
}

// Atomic batch of row changes, one per committed transaction.
//
// Sequence numbers increase strictly and without gaps per server, allowing
// replicas to discard duplicate or out-of-order deliveries.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdateBatch {
    pub seqno: u64,
    pub changes: Vec<RowChange>,
}

// ===== impl UpdateBatch =====

impl UpdateBatch {
    pub(crate) fn new(seqno: u64) -> UpdateBatch {
        UpdateBatch { seqno, changes: Vec::new() }
    }
}
