// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Concurrency-bounded fan-out of one action across many servers.
//!
//! A [`RunQueue`] is a handle to an actor task that owns two ordered
//! sequences, pending and outstanding. Every state change (a command from
//! the handle or a finished dispatch) re-runs the dispatch loop, which
//! moves work from pending to outstanding while the ceiling allows.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::client::Pending;
use crate::error::UrError;
use crate::inflight::{CommandReply, Inflight};
use crate::server::ServerInfo;

/// The single action a queue runs against every server.
#[derive(Debug, Clone)]
pub enum Action {
    Exec { script: String, env: HashMap<String, String>, args: Vec<String> },
    SendFile { src_file: PathBuf, dst_dir: PathBuf, clobber: bool },
    RecvFile { src_file: PathBuf, dst_dir: PathBuf },
}

impl Action {
    pub fn validate(&self) -> Result<(), UrError> {
        let empty = match self {
            Self::Exec { script, .. } => script.trim().is_empty().then_some("script"),
            Self::SendFile { src_file, dst_dir, .. } | Self::RecvFile { src_file, dst_dir } => {
                if src_file.as_os_str().is_empty() {
                    Some("src_file")
                } else if dst_dir.as_os_str().is_empty() {
                    Some("dst_dir")
                } else {
                    None
                }
            }
        };
        match empty {
            Some(field) => Err(UrError::validation(format!("{field} must not be empty"))),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::SendFile { .. } => "send_file",
            Self::RecvFile { .. } => "recv_file",
        }
    }
}

#[derive(Debug)]
pub enum ActionOutput {
    Exec(CommandReply),
    SendFile,
    /// Local path of the received file.
    RecvFile(PathBuf),
}

/// Target of one queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueServer {
    pub uuid: String,
    pub hostname: String,
}

impl From<&ServerInfo> for QueueServer {
    fn from(info: &ServerInfo) -> Self {
        Self { uuid: info.uuid.clone(), hostname: info.hostname.clone() }
    }
}

#[derive(Debug)]
pub enum QueueEvent {
    Dispatch(QueueServer),
    Success(QueueServer, ActionOutput),
    Failure(QueueServer, UrError),
    /// Emitted exactly once, after which the stream ends.
    End,
}

pub type QueueEvents = mpsc::UnboundedReceiver<QueueEvent>;

/// Starts an [`Action`] against one server.
pub trait ActionDispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        server_uuid: &str,
        action: &Action,
        timeout: Duration,
    ) -> Result<Pending<ActionOutput>, UrError>;
}

#[derive(Debug, Clone)]
pub struct RunQueueOptions {
    pub action: Action,
    /// Most requests outstanding at once; 0 means unlimited.
    pub concurrency: usize,
    /// Per-request timeout handed to the dispatcher.
    pub timeout: Duration,
}

#[derive(Debug)]
enum Command {
    AddServer(QueueServer),
    Start,
    Close,
    Cancel,
    Abort,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicUsize,
    outstanding: AtomicUsize,
}

/// Handle to a running queue. Dropping every handle closes the queue.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl RunQueue {
    pub fn new(
        dispatcher: Arc<dyn ActionDispatch>,
        options: RunQueueOptions,
    ) -> Result<(Self, QueueEvents), UrError> {
        options.action.validate()?;
        if options.timeout.is_zero() {
            return Err(UrError::validation("timeout must be greater than 0"));
        }

        let (tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (done_tx, done) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let actor = Actor {
            dispatcher,
            options,
            epoch: Instant::now(),
            next_seq: 0,
            pending: VecDeque::new(),
            outstanding: VecDeque::new(),
            started: false,
            closed: false,
            finished: false,
            counters: Arc::clone(&counters),
            events: events_tx,
            done_tx,
        };
        tokio::spawn(actor.run(commands, done));
        Ok((Self { tx, closed: Arc::new(AtomicBool::new(false)), counters }, events))
    }

    /// Queue `server`. Rejected once the queue is closed.
    pub fn add_server(&self, server: QueueServer) -> Result<(), UrError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UrError::validation("add_server() after close()"));
        }
        if server.uuid.trim().is_empty() {
            return Err(UrError::validation("server uuid must not be empty"));
        }
        self.send(Command::AddServer(server));
        Ok(())
    }

    /// Begin dispatching. Idempotent.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// No more servers; `End` follows once everything queued has finished.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send(Command::Close);
    }

    /// Fail every pending request without dispatching it. Outstanding
    /// requests run to completion.
    pub fn cancel(&self) {
        self.closed.store(true, Ordering::Release);
        self.send(Command::Cancel);
    }

    /// Fail everything now, completing the inflights of outstanding requests.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        self.send(Command::Abort);
    }

    pub fn count_dispatched(&self) -> usize {
        self.counters.dispatched.load(Ordering::Acquire)
    }

    pub fn count_outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) {
        // The actor only goes away after End, when commands are moot.
        let _ = self.tx.send(command);
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    AddServer,
    Dispatch,
    ExecDone,
}

struct Request {
    seq: u64,
    server: QueueServer,
    timeline: Vec<(Stage, Duration)>,
    inflight: Option<Inflight>,
    task: Option<AbortHandle>,
}

type Done = (u64, Result<ActionOutput, UrError>);

struct Actor {
    dispatcher: Arc<dyn ActionDispatch>,
    options: RunQueueOptions,
    epoch: Instant,
    next_seq: u64,
    pending: VecDeque<Request>,
    outstanding: VecDeque<Request>,
    started: bool,
    closed: bool,
    finished: bool,
    counters: Arc<Counters>,
    events: mpsc::UnboundedSender<QueueEvent>,
    done_tx: mpsc::UnboundedSender<Done>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut done: mpsc::UnboundedReceiver<Done>,
    ) {
        let mut handles_alive = true;
        while !self.finished {
            tokio::select! {
                command = commands.recv(), if handles_alive => match command {
                    Some(command) => self.handle(command),
                    None => {
                        handles_alive = false;
                        self.closed = true;
                    }
                },
                Some((seq, result)) = done.recv() => self.finish_request(seq, result),
            }
            self.pump();
        }
        debug!(
            action = self.options.action.name(),
            dispatched = self.counters.dispatched.load(Ordering::Acquire),
            "run queue ended"
        );
    }

    fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::AddServer(server) => {
                self.next_seq += 1;
                let at = self.elapsed();
                self.pending.push_back(Request {
                    seq: self.next_seq,
                    server,
                    timeline: vec![(Stage::AddServer, at)],
                    inflight: None,
                    task: None,
                });
            }
            Command::Start => self.started = true,
            Command::Close => self.closed = true,
            Command::Cancel => {
                self.closed = true;
                for req in std::mem::take(&mut self.pending) {
                    self.emit(QueueEvent::Failure(req.server, UrError::Aborted { dispatched: false }));
                }
            }
            Command::Abort => {
                self.closed = true;
                for req in std::mem::take(&mut self.pending) {
                    self.emit(QueueEvent::Failure(req.server, UrError::Aborted { dispatched: false }));
                }
                for req in std::mem::take(&mut self.outstanding) {
                    if let Some(infl) = &req.inflight {
                        infl.complete();
                    }
                    if let Some(task) = &req.task {
                        task.abort();
                    }
                    self.emit(QueueEvent::Failure(req.server, UrError::Aborted { dispatched: true }));
                }
                self.counters.outstanding.store(0, Ordering::Release);
            }
        }
    }

    /// Move pending work to outstanding while the ceiling allows.
    fn pump(&mut self) {
        loop {
            if self.finished || !(self.started || self.closed) {
                return;
            }
            let ceiling = self.options.concurrency;
            if ceiling > 0 && self.outstanding.len() >= ceiling {
                return;
            }
            let Some(req) = self.pending.pop_front() else {
                if self.closed && self.outstanding.is_empty() {
                    self.finished = true;
                    self.emit(QueueEvent::End);
                }
                return;
            };
            self.dispatch(req);
        }
    }

    fn dispatch(&mut self, mut req: Request) {
        let at = self.elapsed();
        req.timeline.push((Stage::Dispatch, at));
        self.counters.dispatched.fetch_add(1, Ordering::AcqRel);
        self.emit(QueueEvent::Dispatch(req.server.clone()));

        let seq = req.seq;
        let done = self.done_tx.clone();
        match self.dispatcher.dispatch(&req.server.uuid, &self.options.action, self.options.timeout) {
            Ok(pending) => {
                req.inflight = Some(pending.inflight().clone());
                let task = tokio::spawn(async move {
                    let result = pending.wait().await;
                    let _ = done.send((seq, result));
                });
                req.task = Some(task.abort_handle());
            }
            Err(e) => {
                let _ = done.send((seq, Err(e)));
            }
        }
        self.outstanding.push_back(req);
        self.counters.outstanding.store(self.outstanding.len(), Ordering::Release);
    }

    fn finish_request(&mut self, seq: u64, result: Result<ActionOutput, UrError>) {
        let Some(idx) = self.outstanding.iter().position(|r| r.seq == seq) else {
            // Aborted while its result was in the mailbox.
            debug!(seq, "completion for a request no longer outstanding");
            return;
        };
        let Some(mut req) = self.outstanding.remove(idx) else { return };
        self.counters.outstanding.store(self.outstanding.len(), Ordering::Release);

        let at = self.elapsed();
        req.timeline.push((Stage::ExecDone, at));
        debug!(
            seq,
            server_uuid = %req.server.uuid,
            ok = result.is_ok(),
            timeline = ?req.timeline,
            "request finished"
        );
        match result {
            Ok(output) => self.emit(QueueEvent::Success(req.server, output)),
            Err(e) => self.emit(QueueEvent::Failure(req.server, e)),
        }
    }
}

#[cfg(test)]
#[path = "runqueue_tests.rs"]
mod tests;
