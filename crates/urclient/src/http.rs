// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File side-channel: agents `GET` a file we are sending and `PUT` a file we
//! are receiving at `/file/{correlation-id}`.
//!
//! The handler only routes. It looks the id up, hands the request to the
//! owning inflight as a signal, and waits for the owner to answer.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, trace};

use crate::inflight::{InflightRegistry, InflightSignal};

/// An agent wants the file for this inflight. The owner answers with the
/// full response, normally a streamed body.
pub struct FileFetch {
    pub respond: oneshot::Sender<Response>,
}

/// An agent is uploading the file for this inflight. The owner consumes
/// `body` and answers with a status once it is on disk.
pub struct FileUpload {
    pub body: Body,
    pub respond: oneshot::Sender<StatusCode>,
}

impl fmt::Debug for FileFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileFetch").finish_non_exhaustive()
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload").finish_non_exhaustive()
    }
}

/// Error envelope for side-channel failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorResponse { error: ErrorBody { code: code.to_owned(), message: message.into() } };
    (status, Json(body)).into_response()
}

fn invalid_request() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "INVALID_REQUEST", "invalid request")
}

/// Build the side-channel router over `registry`.
pub fn build_router(registry: InflightRegistry) -> Router {
    Router::new()
        .route("/file/{id}", get(get_file).put(put_file))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn get_file(State(registry): State<InflightRegistry>, Path(id): Path<String>) -> Response {
    let Some(inflight) = registry.lookup(&id) else {
        trace!(%id, "http get: unknown correlation");
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("could not find request {id}"));
    };
    let (tx, rx) = oneshot::channel();
    if !inflight.emit(InflightSignal::HttpGet(FileFetch { respond: tx })) {
        return invalid_request();
    }
    drop(inflight);
    rx.await.unwrap_or_else(|_| invalid_request())
}

async fn put_file(
    State(registry): State<InflightRegistry>,
    Path(id): Path<String>,
    body: Body,
) -> Response {
    let Some(inflight) = registry.lookup(&id) else {
        trace!(%id, "http put: unknown correlation");
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("could not find request {id}"));
    };
    let (tx, rx) = oneshot::channel();
    if !inflight.emit(InflightSignal::HttpPut(FileUpload { body, respond: tx })) {
        return invalid_request();
    }
    drop(inflight);
    match rx.await {
        Ok(status) => status.into_response(),
        Err(_) => invalid_request(),
    }
}

/// A running side-channel listener.
pub struct FileServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl FileServer {
    /// Listen on `ip` at an ephemeral port.
    pub async fn bind(ip: IpAddr, registry: InflightRegistry) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let router = build_router(registry);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                axum::serve(listener, router).with_graceful_shutdown(token.cancelled_owned()).await
            {
                tracing::warn!("http side-channel stopped: {e}");
            }
        });
        debug!(%addr, "http server listening");
        Ok(Self { addr, shutdown, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL an agent uses to reach this inflight; `%%ID%%` is substituted
    /// with the correlation id when the command is published.
    pub fn file_url_template(&self) -> String {
        format!("http://{}/file/%%ID%%", self.addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
