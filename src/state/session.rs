//! Connection session state machine.
//!
//! A session owns everything about one physical connection except the
//! transport itself: the codec, the command queue, the statement cache and the
//! buffers. The driver feeds it received bytes with [`Session::on_bytes`] and
//! writes out whatever accumulates in [`Session::write_buffer`].
//!
//! Commands that cannot be admitted yet (still connecting, queue full, or
//! waiting for their statement to be prepared) wait in the backlog in
//! submission order.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::buffers::Buffers;
use crate::command::{Command, CommandId, Request, Response};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::{Codec, Encoded, Limits};
use crate::statement::{PreparedStatement, StatementInfo};

use super::cache::{Evicted, StatementCache};
use super::queue::{CommandQueue, Held};
use super::startup::{CancelKey, Handshake};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress; nothing but handshake bytes is sent
    Connecting,
    /// Ready, nothing outstanding
    Idle,
    /// Commands in flight or waiting
    Busy,
    /// Draining before the terminate frame
    Closing,
    /// Terminal
    Closed,
    /// Terminal after a transport or fatal protocol error
    Broken,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Broken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Finish outstanding work, then say goodbye.
    Graceful,
    /// Fail outstanding work with `ConnectionLost`.
    Forced,
}

/// A failed prepare, applied to the commands that were waiting for it.
#[derive(Debug)]
struct PrepareFailure {
    sql: Arc<str>,
    error: Error,
    /// Last command in the backlog when the prepare failed
    upto: CommandId,
}

/// Statement bookkeeping of one session.
#[derive(Debug)]
struct Statements {
    cache: StatementCache,
    /// SQL with a prepare in flight
    preparing: HashSet<Arc<str>>,
    /// Handles to close on the server
    closes: Vec<Evicted>,
    failures: Vec<PrepareFailure>,
}

impl Statements {
    fn new(capacity: usize) -> Self {
        Self {
            cache: StatementCache::new(capacity),
            preparing: HashSet::new(),
            closes: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn on_complete(
        &mut self,
        request: &Request,
        result: &Result<Response>,
        held: Option<Held>,
        backlog_tail: Option<CommandId>,
    ) {
        if let Some(held) = held
            && let Some(evicted) = self.cache.release(&held.sql, &held.info)
        {
            self.closes.push(evicted);
        }

        let Request::Prepare { sql } = request else {
            return;
        };
        self.preparing.remove(sql);
        match result {
            Ok(Response::Prepared(stmt)) => {
                let evicted = self.cache.insert(Arc::clone(sql), Arc::clone(stmt.info()));
                self.closes.extend(evicted);
            }
            Err(Error::Cancelled) | Ok(_) => {}
            Err(error) => {
                if let Some(upto) = backlog_tail {
                    debug!(%sql, %error, "prepare failed; failing waiting commands");
                    self.failures.push(PrepareFailure {
                        sql: Arc::clone(sql),
                        error: error.duplicate(),
                        upto,
                    });
                }
            }
        }
    }

    /// The error of a failed prepare this command was waiting for.
    fn failure_for(&mut self, sql: &str, id: CommandId) -> Option<Error> {
        self.failures.retain(|failure| failure.upto >= id);
        self.failures
            .iter()
            .find(|failure| &*failure.sql == sql)
            .map(|failure| failure.error.duplicate())
    }

    /// Forget failures no waiting command can still run into.
    fn prune_failures(&mut self, oldest_waiting: Option<CommandId>) {
        match oldest_waiting {
            Some(id) => self.failures.retain(|failure| failure.upto >= id),
            None => self.failures.clear(),
        }
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.preparing.clear();
        self.closes.clear();
        self.failures.clear();
    }
}

/// Sans-I/O state of one connection.
pub struct Session {
    state: SessionState,
    codec: Codec,
    queue: CommandQueue,
    statements: Statements,
    backlog: VecDeque<Command>,
    handshake: Option<Box<dyn Handshake>>,
    cancel_key: Option<CancelKey>,
    buffers: Buffers,
    last_id: CommandId,
    close_after_startup: bool,
    failure: Option<Error>,
}

impl Session {
    /// Create a session in the `Connecting` state. Call [`start`](Self::start)
    /// before feeding bytes.
    pub fn new(opts: &Opts, handshake: Box<dyn Handshake>) -> Self {
        Self {
            state: SessionState::Connecting,
            codec: Codec::new(opts.protocol, Limits::from(opts)),
            queue: CommandQueue::new(opts.pipelining_limit),
            statements: Statements::new(opts.statement_cache_capacity),
            backlog: VecDeque::new(),
            handshake: Some(handshake),
            cancel_key: None,
            buffers: Buffers::take(),
            last_id: CommandId::default(),
            close_after_startup: false,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_broken(&self) -> bool {
        self.state == SessionState::Broken
    }

    /// The error that broke the session, once.
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    /// Key for cancel requests, known once the handshake completes.
    pub fn cancel_key(&self) -> Option<CancelKey> {
        self.cancel_key
    }

    /// Commands sent and awaiting their result.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Commands accepted but not yet admitted to the queue.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.cache.len()
    }

    /// Bytes to hand to the transport.
    pub fn write_buffer(&self) -> &[u8] {
        &self.buffers.outbound
    }

    /// The transport accepted the first `n` bytes of the write buffer.
    pub fn consume_written(&mut self, n: usize) {
        let n = n.min(self.buffers.outbound.len());
        self.buffers.outbound.drain(..n);
    }

    /// The transport accepted the whole write buffer.
    pub fn clear_written(&mut self) {
        self.buffers.outbound.clear();
    }

    /// Write the handshake's opening message.
    pub fn start(&mut self) {
        let started = match self.handshake.as_mut() {
            Some(handshake) => handshake.start(&mut self.buffers.outbound),
            None => Ok(()),
        };
        match started {
            Ok(()) => self.process(),
            Err(err) => self.break_with(err),
        }
    }

    /// Accept a command. It resolves exactly once, in submission order.
    pub fn submit(&mut self, mut command: Command) {
        self.last_id = self.last_id.next();
        command.id = self.last_id;

        if self.state.is_terminal() {
            command.resolve(Err(Error::ConnectionLost));
            return;
        }
        if self.state == SessionState::Closing || self.close_after_startup {
            command.resolve(Err(Error::InvalidUsage("session is closing".into())));
            return;
        }
        trace!(id = %command.id, kind = ?command.kind(), "submitted");
        self.backlog.push_back(command);
        self.process();
    }

    /// Bytes received from the transport.
    pub fn on_bytes(&mut self, data: &[u8]) {
        if self.state.is_terminal() {
            return;
        }
        self.buffers.inbound.extend_from_slice(data);
        self.process();
    }

    /// The transport reached end of stream.
    pub fn on_closed(&mut self) {
        if !self.state.is_terminal() {
            self.break_with(Error::ConnectionLost);
        }
    }

    /// The transport failed.
    pub fn on_transport_error(&mut self, err: std::io::Error) {
        if !self.state.is_terminal() {
            self.break_with(Error::Io(err));
        }
    }

    pub fn close(&mut self, mode: CloseMode) {
        match (self.state, mode) {
            (SessionState::Closed | SessionState::Broken, _) => {}
            (SessionState::Connecting, CloseMode::Graceful) => {
                self.close_after_startup = true;
            }
            (state, CloseMode::Forced) => {
                debug!(?state, "forced close");
                self.fail_outstanding();
                if state != SessionState::Connecting {
                    self.write_terminate();
                }
                self.state = SessionState::Closed;
            }
            (_, CloseMode::Graceful) => {
                debug!(in_flight = self.queue.len(), backlog = self.backlog.len(), "closing");
                self.state = SessionState::Closing;
                self.process();
            }
        }
    }

    fn process(&mut self) {
        if let Err(err) = self.try_process() {
            self.break_with(err);
        }
    }

    fn try_process(&mut self) -> Result<()> {
        if self.state == SessionState::Connecting && !self.step_handshake()? {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Ok(());
        }
        loop {
            self.decode_responses()?;
            if self.admit() == 0 {
                break;
            }
        }
        self.settle();
        Ok(())
    }

    fn step_handshake(&mut self) -> Result<bool> {
        let Some(handshake) = self.handshake.as_mut() else {
            return Ok(true);
        };
        let buffers = &mut *self.buffers;
        let (consumed, ready) = handshake.step(&buffers.inbound, &mut buffers.outbound)?;
        buffers.inbound.drain(..consumed);
        if ready {
            self.cancel_key = handshake.cancel_key();
            self.handshake = None;
            self.state = if self.close_after_startup {
                SessionState::Closing
            } else {
                SessionState::Idle
            };
            debug!(backlog = self.backlog.len(), "session ready");
        }
        Ok(ready)
    }

    fn decode_responses(&mut self) -> Result<()> {
        let statements = &mut self.statements;
        let backlog_tail = self.backlog.back().map(Command::id);
        let buffers = &mut *self.buffers;
        let consumed = self.queue.on_response_bytes(
            &mut self.codec,
            &buffers.inbound,
            |request, result, held| statements.on_complete(request, result, held, backlog_tail),
        )?;
        buffers.inbound.drain(..consumed);
        Ok(())
    }

    /// Move commands from the backlog into the queue while there is room.
    fn admit(&mut self) -> usize {
        let mut admitted = 0;
        while !self.queue.is_full() {
            if let Some((sql, info)) = self.statements.closes.pop() {
                trace!(%sql, handle = %info.handle, "closing evicted statement");
                let close = self.internal(Request::CloseStatement { sql });
                self.send(close, Some(info), None);
                admitted += 1;
                continue;
            }
            let Some(command) = self.backlog.pop_front() else {
                break;
            };
            match self.route(command) {
                Some(waiting) => {
                    self.backlog.push_front(waiting);
                    break;
                }
                None => admitted += 1,
            }
        }
        admitted
    }

    /// Send or resolve one command. Returns it back if it has to wait.
    fn route(&mut self, command: Command) -> Option<Command> {
        if command.is_cancelled() {
            trace!(id = %command.id, "dropping cancelled command");
            command.resolve(Err(Error::Cancelled));
            return None;
        }
        if command.is_abandoned() {
            trace!(id = %command.id, "dropping abandoned command");
            return None;
        }

        match &command.request {
            Request::SimpleQuery { .. } | Request::Ping => self.send(command, None, None),
            Request::Prepare { sql } => {
                let sql = Arc::clone(sql);
                if self.statements.preparing.contains(&sql) {
                    return Some(command);
                }
                if let Some(info) = self.statements.cache.get(&sql) {
                    let stmt = PreparedStatement::new(sql, info);
                    self.ready(command, Ok(Response::Prepared(stmt)), None);
                } else {
                    self.statements.preparing.insert(sql);
                    self.send(command, None, None);
                }
            }
            Request::Execute { sql, .. } | Request::Batch { sql, .. } => {
                let sql = Arc::clone(sql);
                if let Err(error) = self.codec.check_params(&command.request) {
                    debug!(id = %command.id, %error, "rejected before sending");
                    self.ready(command, Err(error), None);
                    return None;
                }
                if let Some(error) = self.statements.failure_for(&sql, command.id) {
                    self.ready(command, Err(error), None);
                    return None;
                }
                if self.statements.preparing.contains(&sql) {
                    return Some(command);
                }
                let Some(info) = self.statements.cache.acquire(&sql) else {
                    debug!(id = %command.id, %sql, "statement not prepared on this session");
                    self.statements.preparing.insert(Arc::clone(&sql));
                    let prepare = self.internal(Request::Prepare { sql });
                    self.send(prepare, None, None);
                    return Some(command);
                };
                let held = Held {
                    sql,
                    info: Arc::clone(&info),
                };
                self.send(command, Some(info), Some(held));
            }
            Request::CloseStatement { sql } => {
                let sql = Arc::clone(sql);
                if self.statements.preparing.contains(&sql) {
                    return Some(command);
                }
                match self.statements.cache.remove(&sql) {
                    Some(info) => self.send(command, Some(info), None),
                    // unknown here, or closed once its executions finish
                    None => self.ready(command, Ok(Response::Closed), None),
                }
            }
        }
        None
    }

    fn internal(&mut self, request: Request) -> Command {
        let mut command = Command::internal(request);
        self.last_id = self.last_id.next();
        command.id = self.last_id;
        command
    }

    /// Encode into scratch space, then commit the bytes and queue the command.
    fn send(&mut self, command: Command, statement: Option<Arc<StatementInfo>>, held: Option<Held>) {
        let buffers = &mut *self.buffers;
        buffers.scratch.clear();
        let result = match self
            .codec
            .encode(&command.request, statement.as_deref(), &mut buffers.scratch)
        {
            Ok(Encoded::Awaiting(state)) => {
                if command.mark_sent() {
                    buffers.outbound.extend_from_slice(&buffers.scratch);
                    trace!(id = %command.id, bytes = buffers.scratch.len(), "sent");
                    if let Err(command) = self.queue.push(command, state, held) {
                        command.resolve(Err(Error::protocol("command queue overflow")));
                    }
                    return;
                }
                Err(Error::Cancelled)
            }
            Ok(Encoded::NoResponse(response)) => {
                command.mark_sent();
                Ok(response)
            }
            Err(err) => {
                debug!(id = %command.id, %err, "encoding failed; nothing sent");
                Err(err)
            }
        };
        self.ready(command, result, held);
    }

    fn ready(&mut self, command: Command, result: Result<Response>, held: Option<Held>) {
        if let Err(command) = self.queue.push_ready(command, result, held) {
            command.resolve(Err(Error::protocol("command queue overflow")));
        }
    }

    fn settle(&mut self) {
        self.statements
            .prune_failures(self.backlog.front().map(Command::id));
        let drained = self.queue.is_empty() && self.backlog.is_empty();
        match self.state {
            SessionState::Idle | SessionState::Busy => {
                let next = if drained {
                    SessionState::Idle
                } else {
                    SessionState::Busy
                };
                if next != self.state {
                    trace!(from = ?self.state, to = ?next, "session state");
                    self.state = next;
                }
            }
            SessionState::Closing if drained => {
                self.statements.clear();
                self.write_terminate();
                self.state = SessionState::Closed;
                debug!("session closed");
            }
            _ => {}
        }
    }

    fn write_terminate(&mut self) {
        if let Err(err) = self.codec.encode_terminate(&mut self.buffers.outbound) {
            warn!(%err, "failed to encode terminate");
        }
    }

    fn fail_outstanding(&mut self) {
        self.queue.on_connection_broken();
        for command in self.backlog.drain(..) {
            command.resolve(Err(Error::ConnectionLost));
        }
        self.statements.clear();
        self.handshake = None;
    }

    fn break_with(&mut self, error: Error) {
        if self.state.is_terminal() {
            return;
        }
        warn!(%error, state = ?self.state, "session broken");
        self.fail_outstanding();
        self.failure = Some(error);
        self.state = SessionState::Broken;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("protocol", &self.codec.protocol())
            .field("in_flight", &self.queue.len())
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}
