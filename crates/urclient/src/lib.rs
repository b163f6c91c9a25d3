// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod backoff;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod http;
pub mod inflight;
pub mod runqueue;
pub mod server;
pub mod test_support;
pub mod transfer;
pub mod transport;

pub use client::{ExecRequest, Pending, RecvFileRequest, SendFileRequest, UrClient};
pub use config::{BrokerConfig, ClientConfig};
pub use error::UrError;
