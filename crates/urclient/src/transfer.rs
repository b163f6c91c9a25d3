// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File transfer over the HTTP side-channel.
//!
//! A transfer runs two legs at once: a script on the agent that fetches or
//! pushes `/file/{id}` with curl, and the HTTP exchange on our side. It
//! succeeds only when both the script exits 0 and the HTTP leg finishes.
//! Any failure on either leg ends it immediately.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

use crate::client::OpContext;
use crate::error::{RemoteCode, UrError};
use crate::http::{FileFetch, FileUpload};
use crate::inflight::{CommandReply, Inflight, InflightSignal, Signals};

/// Agent side of `send_file`: `$1` url, `$2` destination path, `$3` "clobber".
pub const SEND_SCRIPT: &str = r#"#!/bin/bash -x

if [[ $3 != "clobber" && -f "$2" ]]; then
    exit 50
fi

if [[ ! -d "$(dirname "$2")" ]]; then
    exit 55
fi

tmpnam="$(dirname "$2")/.oneachnode.$$.$(basename "$2")"
rm -f "$tmpnam"

if ! /usr/bin/curl -gsSf "$1" -o "$tmpnam"; then
    rm -f "$tmpnam"
    exit 60
fi

if ! mv "$tmpnam" "$2"; then
    rm -f "$tmpnam"
    exit 60
fi

exit 0"#;

/// Agent side of `recv_file`: `$1` url, `$2` source path.
pub const RECV_SCRIPT: &str = r#"#!/bin/bash -x

if [[ ! -f "$2" ]]; then
    exit 40
fi

if ! /usr/bin/curl -X PUT -gsSf -T "$2" "$1"; then
    exit 60
fi

exit 0"#;

pub const EXIT_NOT_FOUND: i32 = 40;
pub const EXIT_EXISTS: i32 = 50;
pub const EXIT_NOT_DIR: i32 = 55;
pub const EXIT_TRANSFER: i32 = 60;

const CHUNK_BUFFER: usize = 4;

/// Where `send_file` puts `src_file` on the agent.
pub fn send_destination(src_file: &Path, dst_dir: &Path) -> PathBuf {
    match src_file.file_name() {
        Some(name) => dst_dir.join(name),
        None => dst_dir.to_path_buf(),
    }
}

/// Where `recv_file` stores the file pulled from `server_uuid`.
pub fn recv_destination(dst_dir: &Path, server_uuid: &str) -> PathBuf {
    dst_dir.join(server_uuid)
}

pub fn send_args(url_template: &str, destination: &Path, clobber: bool) -> Vec<String> {
    vec![
        url_template.to_owned(),
        destination.to_string_lossy().into_owned(),
        if clobber { "clobber".to_owned() } else { String::new() },
    ]
}

pub fn recv_args(url_template: &str, src_file: &Path) -> Vec<String> {
    vec![url_template.to_owned(), src_file.to_string_lossy().into_owned()]
}

fn remote(code: RemoteCode, message: &str, server_uuid: &str, stderr: Option<&str>) -> UrError {
    UrError::Remote {
        code,
        message: message.to_owned(),
        server_uuid: server_uuid.to_owned(),
        stderr: stderr.map(|s| s.trim().to_owned()),
    }
}

/// Classify a non-zero exit of [`SEND_SCRIPT`].
pub fn send_failure(reply: &CommandReply, server_uuid: &str) -> UrError {
    match reply.exit_status {
        EXIT_EXISTS => remote(RemoteCode::AlreadyExists, "file exists already", server_uuid, None),
        EXIT_NOT_DIR => {
            remote(RemoteCode::NotADirectory, "target is not a directory", server_uuid, None)
        }
        _ => remote(
            RemoteCode::TransferFailed,
            "curl failed to receive file",
            server_uuid,
            Some(&reply.stderr),
        ),
    }
}

/// Classify a non-zero exit of [`RECV_SCRIPT`].
pub fn recv_failure(reply: &CommandReply, server_uuid: &str) -> UrError {
    match reply.exit_status {
        EXIT_NOT_FOUND => remote(RemoteCode::NotFound, "file does not exist", server_uuid, None),
        _ => remote(
            RemoteCode::TransferFailed,
            "curl failed to send file",
            server_uuid,
            Some(&reply.stderr),
        ),
    }
}

/// Which way the bytes flow.
pub(crate) enum Direction {
    /// Serve `source` to the agent's GET.
    Send { source: PathBuf },
    /// Write the agent's PUT body to `destination`.
    Recv { destination: PathBuf },
}

/// Run both legs of a transfer to completion.
pub(crate) async fn run(
    ctx: OpContext,
    infl: Inflight,
    mut signals: Signals,
    direction: Direction,
) -> Result<(), UrError> {
    let (leg_tx, mut leg_rx) = mpsc::channel::<Result<(), UrError>>(1);
    let mut pump: Option<JoinHandle<()>> = None;
    let mut exec_done = false;
    let mut http_done = false;
    infl.start_timeout(ctx.timeout);

    let result = loop {
        tokio::select! {
            signal = signals.recv() => {
                let Some(signal) = signal else { break Err(UrError::Abandoned) };
                match signal {
                    InflightSignal::Timeout(generation) => {
                        if !infl.is_stale(generation) {
                            break Err(ctx.timed_out("timed out"));
                        }
                    }
                    InflightSignal::CommandReply(reply) if reply.exit_status == 0 => {
                        exec_done = true;
                        if http_done {
                            break Ok(());
                        }
                    }
                    InflightSignal::CommandReply(reply) => {
                        break Err(match &direction {
                            Direction::Send { .. } => send_failure(&reply, &ctx.server_uuid),
                            Direction::Recv { .. } => recv_failure(&reply, &ctx.server_uuid),
                        });
                    }
                    InflightSignal::HttpGet(fetch) => match &direction {
                        Direction::Send { source } if pump.is_none() => {
                            // Curl is connected; from here on the per-chunk timeout applies.
                            infl.cancel_timeout();
                            match serve_file(&ctx, source, fetch, leg_tx.clone()).await {
                                Ok(handle) => pump = Some(handle),
                                Err(e) => break Err(e),
                            }
                        }
                        _ => trace!(request_id = infl.id(), "unexpected GET"),
                    },
                    InflightSignal::HttpPut(upload) => match &direction {
                        Direction::Recv { destination } if pump.is_none() => {
                            infl.cancel_timeout();
                            pump = Some(store_upload(&ctx, destination.clone(), upload, leg_tx.clone()));
                        }
                        _ => trace!(request_id = infl.id(), "unexpected PUT"),
                    },
                    InflightSignal::BrokerError(msg) if ctx.broker_fatal() => {
                        break Err(UrError::Transport(msg));
                    }
                    InflightSignal::BrokerClosed if ctx.broker_fatal() => {
                        break Err(UrError::Transport("broker connection closed".into()));
                    }
                    other => trace!(request_id = infl.id(), ?other, "ignored signal"),
                }
            }
            Some(leg) = leg_rx.recv() => match leg {
                Ok(()) => {
                    http_done = true;
                    if exec_done {
                        break Ok(());
                    }
                    // The bytes are through; curl still has to exit.
                    infl.start_timeout(ctx.timeout);
                }
                Err(e) => break Err(e),
            }
        }
    };

    infl.complete();
    if let Some(pump) = pump {
        pump.abort();
    }
    debug!(server_uuid = %ctx.server_uuid, ok = result.is_ok(), "transfer finished");
    result
}

async fn serve_file(
    ctx: &OpContext,
    source: &Path,
    fetch: FileFetch,
    done: mpsc::Sender<Result<(), UrError>>,
) -> Result<JoinHandle<()>, UrError> {
    let file = match tokio::fs::File::open(source).await {
        Ok(file) => file,
        Err(e) => {
            let _ = fetch.respond.send(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            return Err(ctx.transfer_error(format!(
                "could not read input file \"{}\": {e}",
                source.display()
            )));
        }
    };

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHUNK_BUFFER);
    let _ = fetch.respond.send(Response::new(Body::from_stream(ReceiverStream::new(body_rx))));

    let ctx = ctx.clone();
    let source = source.to_path_buf();
    Ok(tokio::spawn(async move {
        let mut chunks = ReaderStream::new(file);
        let outcome = loop {
            let Some(chunk) = chunks.next().await else { break Ok(()) };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    break Err(ctx.transfer_error(format!(
                        "could not read input file \"{}\": {e}",
                        source.display()
                    )))
                }
            };
            match tokio::time::timeout(ctx.timeout, body_tx.send(Ok(chunk))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    break Err(ctx.transfer_error(format!(
                        "response error for host \"{}\"",
                        ctx.server_uuid
                    )))
                }
                Err(_) => break Err(ctx.timed_out("timed out")),
            }
        };
        drop(body_tx);
        let _ = done.send(outcome).await;
    }))
}

fn store_upload(
    ctx: &OpContext,
    destination: PathBuf,
    upload: FileUpload,
    done: mpsc::Sender<Result<(), UrError>>,
) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let FileUpload { body, respond } = upload;
        let outcome = write_body(&ctx, &destination, body).await;
        let status = if outcome.is_ok() { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
        let _ = respond.send(status);
        let _ = done.send(outcome).await;
    })
}

async fn write_body(ctx: &OpContext, destination: &Path, body: Body) -> Result<(), UrError> {
    let write_error = |e: std::io::Error| {
        ctx.transfer_error(format!("could not write output file \"{}\": {e}", destination.display()))
    };
    let mut file = tokio::fs::File::create(destination).await.map_err(write_error)?;
    let mut stream = body.into_data_stream();
    loop {
        let chunk = match tokio::time::timeout(ctx.timeout, stream.next()).await {
            Err(_) => return Err(ctx.timed_out("timed out")),
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return Err(ctx.transfer_error(format!(
                    "request error for host \"{}\": {e}",
                    ctx.server_uuid
                )))
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        file.write_all(&chunk).await.map_err(write_error)?;
    }
    file.flush().await.map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;
