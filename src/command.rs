//! Commands, their completion slots and the caller-side `Pending` future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{OwnedSemaphorePermit, oneshot};

use crate::error::{Error, Result};
use crate::row::QueryResult;
use crate::statement::PreparedStatement;
use crate::value::Value;

/// Session-scoped, monotonically increasing command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommandId(u64);

impl CommandId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    SimpleQuery,
    Prepare,
    Execute,
    CloseStatement,
    Batch,
    Ping,
}

/// A logical request. SQL text is opaque to the client.
#[derive(Debug, Clone)]
pub enum Request {
    /// Text query; may contain several statements on protocols that allow it.
    SimpleQuery { sql: String },
    /// Prepare a statement (cache hit: no wire traffic).
    Prepare { sql: Arc<str> },
    /// Execute a statement with bound parameters, preparing it first if needed.
    Execute { sql: Arc<str>, params: Vec<Value> },
    /// Close a cached statement on the server.
    CloseStatement { sql: Arc<str> },
    /// Execute a statement once per parameter set, pipelined.
    Batch { sql: Arc<str>, params: Vec<Vec<Value>> },
    /// Lightweight round trip.
    Ping,
}

impl Request {
    pub fn kind(&self) -> CommandKind {
        match self {
            Request::SimpleQuery { .. } => CommandKind::SimpleQuery,
            Request::Prepare { .. } => CommandKind::Prepare,
            Request::Execute { .. } => CommandKind::Execute,
            Request::CloseStatement { .. } => CommandKind::CloseStatement,
            Request::Batch { .. } => CommandKind::Batch,
            Request::Ping => CommandKind::Ping,
        }
    }

    /// Largest parameter value, as measured by `len`.
    pub(crate) fn largest_param(&self, len: fn(&Value) -> usize) -> usize {
        let largest = |params: &[Value]| params.iter().map(len).max();
        match self {
            Request::Execute { params, .. } => largest(params).unwrap_or(0),
            Request::Batch { params, .. } => params
                .iter()
                .filter_map(|set| largest(set))
                .max()
                .unwrap_or(0),
            _ => 0,
        }
    }
}

/// Logical result of a command.
#[derive(Debug, Clone)]
pub enum Response {
    Rows(QueryResult),
    Prepared(PreparedStatement),
    Closed,
    Batch(Vec<QueryResult>),
    Pong,
}

impl Response {
    pub fn into_rows(self) -> Result<QueryResult> {
        match self {
            Response::Rows(result) => Ok(result),
            other => Err(unexpected("rows", &other)),
        }
    }

    pub fn into_prepared(self) -> Result<PreparedStatement> {
        match self {
            Response::Prepared(stmt) => Ok(stmt),
            other => Err(unexpected("prepared statement", &other)),
        }
    }

    pub fn into_batch(self) -> Result<Vec<QueryResult>> {
        match self {
            Response::Batch(results) => Ok(results),
            other => Err(unexpected("batch results", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> Error {
    let got = match got {
        Response::Rows(_) => "rows",
        Response::Prepared(_) => "prepared statement",
        Response::Closed => "closed",
        Response::Batch(_) => "batch results",
        Response::Pong => "pong",
    };
    Error::protocol(format!("expected {}, got {}", expected, got))
}

/// Single-resolution result slot.
///
/// `resolve` consumes the slot, so resolving twice does not type-check.
/// Internal commands (statement closes issued by the cache) have no caller.
#[derive(Debug)]
pub(crate) struct Completion(Option<oneshot::Sender<Result<Response>>>);

impl Completion {
    pub(crate) fn internal() -> Self {
        Self(None)
    }

    pub(crate) fn resolve(self, result: Result<Response>) {
        if let Some(tx) = self.0 {
            // receiver gone means the caller stopped waiting
            let _ = tx.send(result);
        }
    }

    /// The caller dropped its `Pending`.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.0.as_ref().is_some_and(oneshot::Sender::is_closed)
    }
}

const QUEUED: u8 = 0;
const SENT: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation flag shared between a command and its `Pending`.
#[derive(Debug, Clone)]
pub(crate) struct Ticket(Arc<AtomicU8>);

impl Ticket {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(QUEUED)))
    }

    /// Claim the command for sending. Fails if it was cancelled first.
    pub(crate) fn mark_sent(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, SENT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancel the command. Fails if it was already sent.
    pub(crate) fn cancel(&self) -> bool {
        let state = self
            .0
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        matches!(state, Ok(_) | Err(CANCELLED))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }
}

/// A unit of work owned by a session from submission until resolution.
#[derive(Debug)]
pub struct Command {
    pub(crate) id: CommandId,
    pub(crate) request: Request,
    completion: Completion,
    ticket: Ticket,
    permit: Option<OwnedSemaphorePermit>,
}

impl Command {
    /// Create a command and the future its caller awaits.
    pub fn new(request: Request) -> (Command, Pending) {
        let (tx, rx) = oneshot::channel();
        let ticket = Ticket::new();
        let command = Command {
            id: CommandId::default(),
            request,
            completion: Completion(Some(tx)),
            ticket: ticket.clone(),
            permit: None,
        };
        (command, Pending { rx, ticket })
    }

    /// A command issued by the session itself; nobody awaits its result.
    pub(crate) fn internal(request: Request) -> Command {
        Command {
            id: CommandId::default(),
            request,
            completion: Completion::internal(),
            ticket: Ticket::new(),
            permit: None,
        }
    }

    /// Attach an in-flight permit, released when the command resolves.
    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.request.kind()
    }

    pub(crate) fn mark_sent(&self) -> bool {
        self.ticket.mark_sent()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.ticket.is_cancelled()
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.completion.is_abandoned()
    }

    /// Resolve the completion slot; the in-flight permit is released afterwards.
    pub(crate) fn resolve(self, result: Result<Response>) {
        let Command {
            completion, permit, ..
        } = self;
        completion.resolve(result);
        drop(permit);
    }
}

/// Future for the result of a submitted command.
///
/// Dropping it abandons the result; a command not yet sent is then skipped.
#[derive(Debug)]
pub struct Pending {
    rx: oneshot::Receiver<Result<Response>>,
    ticket: Ticket,
}

impl Pending {
    /// Cancel the command if it has not been sent yet.
    ///
    /// Returns `true` if the command will never be sent; the future then
    /// resolves with `Error::Cancelled`. Once sent, cancellation is not
    /// possible and the server's answer is delivered as usual.
    pub fn cancel(&self) -> bool {
        self.ticket.cancel()
    }
}

#[cfg(test)]
impl Pending {
    /// Poll once without a runtime.
    pub(crate) fn try_result(&mut self) -> Option<Result<Response>> {
        let mut cx = Context::from_waker(std::task::Waker::noop());
        match Pin::new(self).poll(&mut cx) {
            Poll::Ready(result) => Some(result),
            Poll::Pending => None,
        }
    }
}

impl Future for Pending {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.ticket.is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::ConnectionLost)))
    }
}
