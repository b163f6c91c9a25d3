// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use crate::server::ServerInfo;

/// Classified exit status of a remote transfer script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCode {
    /// Destination exists and clobber was not requested.
    AlreadyExists,
    /// Destination directory is missing.
    NotADirectory,
    /// Source file is missing on the remote side.
    NotFound,
    /// curl failed, or the script exited with an unrecognised status.
    TransferFailed,
}

impl RemoteCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "EEXIST",
            Self::NotADirectory => "ENOTDIR",
            Self::NotFound => "ENOENT",
            Self::TransferFailed => "ETRANSFER",
        }
    }
}

/// Errors surfaced by client operations, discovery and the run queue.
#[derive(Debug)]
pub enum UrError {
    /// Bad configuration or arguments; always a caller bug.
    Validation(String),
    /// The broker connection is not ready.
    NotReady,
    /// A file operation was requested but the HTTP side-channel is off.
    HttpDisabled,
    /// The broker connection failed underneath the operation.
    Transport(String),
    /// No reply within the operation's deadline.
    Timeout { server_uuid: Option<String>, message: String },
    /// An explicit discovery node list was not satisfied.
    PartialDiscovery { found: Vec<ServerInfo>, missing: Vec<String> },
    /// The remote script exited with a non-zero status.
    Remote { code: RemoteCode, message: String, server_uuid: String, stderr: Option<String> },
    /// The local half of a file transfer failed.
    Transfer { server_uuid: String, message: String },
    /// The run queue gave up on this target.
    Aborted { dispatched: bool },
    /// The inflight was completed by someone else before a result arrived.
    Abandoned,
}

impl UrError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "EINVAL",
            Self::NotReady => "ENOTREADY",
            Self::HttpDisabled => "ENOHTTP",
            Self::Transport(_) => "ETRANSPORT",
            Self::Timeout { .. } => "ETIMEDOUT",
            Self::PartialDiscovery { .. } => "EMISSING",
            Self::Remote { code, .. } => code.as_str(),
            Self::Transfer { .. } => "ETRANSFER",
            Self::Aborted { .. } => "ABORT",
            Self::Abandoned => "EABANDONED",
        }
    }

    pub(crate) fn timeout(server_uuid: Option<&str>, message: impl Into<String>) -> Self {
        Self::Timeout { server_uuid: server_uuid.map(str::to_owned), message: message.into() }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl fmt::Display for UrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotReady => f.write_str("broker connection not ready"),
            Self::HttpDisabled => f.write_str("HTTP was not enabled; cannot transfer files"),
            Self::Transport(msg) => f.write_str(msg),
            Self::Timeout { message, .. } => f.write_str(message),
            Self::PartialDiscovery { missing, .. } => {
                write!(f, "could not find all nodes (missing: {})", missing.join(", "))
            }
            Self::Remote { message, .. } => f.write_str(message),
            Self::Transfer { message, .. } => f.write_str(message),
            Self::Aborted { dispatched: true } => f.write_str("aborted"),
            Self::Aborted { dispatched: false } => f.write_str("aborted (before sent to server)"),
            Self::Abandoned => f.write_str("request completed before a result arrived"),
        }
    }
}

impl std::error::Error for UrError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
