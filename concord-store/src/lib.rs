//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

pub mod client;
pub mod db;
pub mod notify;
pub mod schema;
pub mod server;
pub mod txn;
