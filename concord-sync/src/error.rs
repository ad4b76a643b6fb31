//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fmt::{Display, Formatter, Result as FmtResult};

use concord_store::schema::RowUuid;
use concord_store::txn::{CommitStatus, TxnId};
use concord_utils::protocol::Protocol;
use ipnetwork::IpNetwork;
use tracing::{debug, error, warn};

// Reconciliation errors.
//
// Lookup failures are transient by design: the state they refer to is
// re-derived on a later pass, so they are logged at debug level and never
// abort processing.
#[derive(Debug)]
pub enum Error {
    RouteRowNotFound(Protocol, IpNetwork),
    NexthopRowNotFound(RowUuid),
    TxnPending,
    TxnFailed(TxnId, CommitStatus),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::RouteRowNotFound(protocol, prefix) => {
                debug!(%protocol, %prefix, "{}", self);
            }
            Error::NexthopRowNotFound(uuid) => {
                debug!(%uuid, "{}", self);
            }
            Error::TxnPending => {
                debug!("{}", self);
            }
            Error::TxnFailed(txn_id, status) => match status {
                CommitStatus::Aborted => {
                    warn!(%txn_id, %status, "{}", self);
                }
                _ => {
                    error!(%txn_id, %status, "{}", self);
                }
            },
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::RouteRowNotFound(..) => {
                write!(f, "route row not found")
            }
            Error::NexthopRowNotFound(..) => {
                write!(f, "nexthop row not found")
            }
            Error::TxnPending => {
                write!(f, "transaction commit already in progress")
            }
            Error::TxnFailed(..) => {
                write!(f, "transaction failed")
            }
        }
    }
}

impl std::error::Error for Error {}
