//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fmt::{Display, Formatter, Result as FmtResult};

use concord_store::txn::TxnId;
use concord_utils::protocol::Protocol;
use ipnetwork::IpNetwork;
use tracing::debug;

use crate::port::PendingAction;
use crate::restart::RestartState;

// Reconciliation debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    PassBegin(u64),
    PortUpdate(&'a str, PendingAction),
    ConnectedRouteInsert(&'a str, &'a IpNetwork),
    ConnectedRouteDelete(&'a str, &'a IpNetwork),
    StaleRouteDelete(&'a IpNetwork, Protocol),
    RestartTransition(RestartState),
    TxnCommit(TxnId, usize),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Logs the message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::PassBegin(seqno) => {
                debug!(%seqno, "{}", self);
            }
            Debug::PortUpdate(name, action) => {
                debug!(%name, ?action, "{}", self);
            }
            Debug::ConnectedRouteInsert(name, prefix)
            | Debug::ConnectedRouteDelete(name, prefix) => {
                debug!(%name, %prefix, "{}", self);
            }
            Debug::StaleRouteDelete(prefix, protocol) => {
                debug!(%prefix, %protocol, "{}", self);
            }
            Debug::RestartTransition(state) => {
                debug!(?state, "{}", self);
            }
            Debug::TxnCommit(txn_id, ops) => {
                debug!(%txn_id, %ops, "{}", self);
            }
        }
    }
}

impl Display for Debug<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Debug::PassBegin(..) => {
                write!(f, "processing update batch")
            }
            Debug::PortUpdate(..) => {
                write!(f, "port update")
            }
            Debug::ConnectedRouteInsert(..) => {
                write!(f, "connected route insert")
            }
            Debug::ConnectedRouteDelete(..) => {
                write!(f, "connected route delete")
            }
            Debug::StaleRouteDelete(..) => {
                write!(f, "stale route delete")
            }
            Debug::RestartTransition(..) => {
                write!(f, "restart reconciliation state transition")
            }
            Debug::TxnCommit(..) => {
                write!(f, "transaction commit")
            }
        }
    }
}
