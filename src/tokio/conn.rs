//! Asynchronous connection handle.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::debug;

use crate::command::{Command, Pending, Request};
use crate::error::{Error, Result};
use crate::opts::{Opts, Protocol};
use crate::row::{FromRow, QueryResult};
use crate::state::{CancelKey, CloseMode, Handshake, NoHandshake, PgStartup, Session};
use crate::statement::{IntoStatement, PreparedStatement, normalize};
use crate::value::{ToParams, Value};

use super::driver::{self, Message};
use super::stream::Stream;

/// Handle to one pipelined connection.
///
/// The connection itself lives in a background task; handles are cheap to
/// clone and may be used from several tasks at once. Results arrive in
/// submission order. The connection closes gracefully once every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct Conn {
    tx: mpsc::UnboundedSender<Message>,
    permits: Arc<Semaphore>,
    protocol: Protocol,
    cancel: Option<Arc<CancelTarget>>,
}

/// Where cancel requests for a connection go.
#[derive(Debug)]
struct CancelTarget {
    key: CancelKey,
    /// Connect options without credentials
    opts: Opts,
}

impl Conn {
    /// Connect to a server.
    ///
    /// PostgreSQL runs the startup and password exchange. MySQL and DB2
    /// logins are not built in; pass a pre-authenticated transport to
    /// [`Conn::from_stream`] instead.
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        opts.validate()?;
        let handshake: Box<dyn Handshake> = match opts.protocol {
            Protocol::Postgres => Box::new(PgStartup::new(&opts)),
            other => {
                return Err(Error::Unsupported(format!(
                    "{:?} login; connect a pre-authenticated transport with Conn::from_stream",
                    other
                )));
            }
        };
        let stream = Stream::connect(&opts).await?;
        Self::from_stream(stream, &opts, handshake).await
    }

    /// Run a session over an already established transport.
    ///
    /// Returns once `handshake` completes.
    pub async fn from_stream<S>(stream: S, opts: &Opts, handshake: Box<dyn Handshake>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        opts.validate()?;
        let mut session = Session::new(opts, handshake);
        session.start();

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(driver::run(stream, session, rx, ready_tx));
        let cancel_key = ready_rx.await.unwrap_or(Err(Error::ConnectionLost))?;
        debug!(protocol = ?opts.protocol, cancellable = cancel_key.is_some(), "connected");

        let cancel = cancel_key.map(|key| {
            Arc::new(CancelTarget {
                key,
                opts: Opts {
                    password: None,
                    ..opts.clone()
                },
            })
        });
        Ok(Self {
            tx,
            permits: Arc::new(Semaphore::new(opts.pipelining_limit)),
            protocol: opts.protocol,
            cancel,
        })
    }

    /// Run a session over a transport that needs no handshake.
    pub async fn from_authenticated_stream<S>(stream: S, opts: &Opts) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream(stream, opts, Box::new(NoHandshake)).await
    }

    /// A handle whose connection is gone; every call fails with `ConnectionLost`.
    pub(crate) fn detached(protocol: Protocol) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        permits.close();
        Self {
            tx,
            permits,
            protocol,
            cancel: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The session has terminated (closed, broken or transport gone).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hand a request to the session.
    ///
    /// Waits while `pipelining_limit` commands of this connection are
    /// unresolved. The returned future resolves with the command's result.
    pub async fn submit(&self, request: Request) -> Result<Pending> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_closed| Error::ConnectionLost)?;
        let (command, pending) = Command::new(request);
        self.tx
            .send(Message::Submit(command.with_permit(permit)))
            .map_err(|_closed| Error::ConnectionLost)?;
        Ok(pending)
    }

    async fn run(&self, request: Request) -> Result<crate::command::Response> {
        self.submit(request).await?.await
    }

    /// Execute a text query. Several statements are allowed where the
    /// protocol supports it; their results are chained through `next`.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.run(Request::SimpleQuery { sql: sql.into() })
            .await?
            .into_rows()
    }

    /// Execute a text query and decode every row.
    pub async fn query_collect<T: for<'a> FromRow<'a>>(&self, sql: &str) -> Result<Vec<T>> {
        collect(&self.query(sql).await?)
    }

    /// Execute a text query and decode the first row.
    pub async fn query_first<T: for<'a> FromRow<'a>>(&self, sql: &str) -> Result<Option<T>> {
        first(&self.query(sql).await?)
    }

    /// Prepare a statement on this connection's cache.
    ///
    /// A cached statement is returned without a round trip.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let sql = Arc::from(normalize(sql));
        self.run(Request::Prepare { sql }).await?.into_prepared()
    }

    /// Execute a statement, preparing it first if this connection has not.
    pub async fn execute<S: IntoStatement, P: ToParams>(
        &self,
        statement: S,
        params: P,
    ) -> Result<QueryResult> {
        let request = Request::Execute {
            sql: statement.statement_sql(),
            params: params.to_params(),
        };
        self.run(request).await?.into_rows()
    }

    /// Execute a statement and decode every row.
    pub async fn execute_collect<T, S, P>(&self, statement: S, params: P) -> Result<Vec<T>>
    where
        T: for<'a> FromRow<'a>,
        S: IntoStatement,
        P: ToParams,
    {
        collect(&self.execute(statement, params).await?)
    }

    /// Execute a statement once per parameter set as one unit.
    ///
    /// Fails with the first error; results are in parameter set order.
    pub async fn batch<S: IntoStatement>(
        &self,
        statement: S,
        params: Vec<Vec<Value>>,
    ) -> Result<Vec<QueryResult>> {
        let request = Request::Batch {
            sql: statement.statement_sql(),
            params,
        };
        self.run(request).await?.into_batch()
    }

    /// Drop a statement from the cache and close it on the server.
    pub async fn close_statement<S: IntoStatement>(&self, statement: S) -> Result<()> {
        let sql = statement.statement_sql();
        self.run(Request::CloseStatement { sql }).await?;
        Ok(())
    }

    /// Round trip to check the connection is alive.
    pub async fn ping(&self) -> Result<()> {
        self.run(Request::Ping).await?;
        Ok(())
    }

    /// Key the server handed out for cancel requests; PostgreSQL only.
    pub fn cancel_key(&self) -> Option<CancelKey> {
        self.cancel.as_ref().map(|target| target.key)
    }

    /// Ask the server to interrupt whatever this connection is running.
    ///
    /// Opens a side connection to the host in the connect options and sends
    /// a CancelRequest. Best effort: the interrupted command still resolves,
    /// usually with SQLSTATE 57014, and work that already finished is
    /// unaffected.
    pub async fn cancel(&self) -> Result<()> {
        let target = self.cancel_target()?;
        let stream = Stream::connect(&target.opts).await?;
        send_cancel(stream, target.key).await
    }

    /// [`cancel`](Self::cancel) over a transport the caller opened.
    pub async fn cancel_over<S: AsyncWrite + Unpin>(&self, stream: S) -> Result<()> {
        let target = self.cancel_target()?;
        send_cancel(stream, target.key).await
    }

    fn cancel_target(&self) -> Result<&CancelTarget> {
        self.cancel.as_deref().ok_or_else(|| {
            Error::Unsupported(format!(
                "cancel request on {:?}: the server sent no cancel key",
                self.protocol
            ))
        })
    }

    /// Finish outstanding commands, then close the connection.
    ///
    /// Commands submitted afterwards fail with `InvalidUsage`.
    pub async fn close(&self) -> Result<()> {
        self.shutdown(CloseMode::Graceful).await
    }

    /// Close now; outstanding commands fail with `ConnectionLost`.
    pub async fn abort(&self) -> Result<()> {
        self.shutdown(CloseMode::Forced).await
    }

    async fn shutdown(&self, mode: CloseMode) -> Result<()> {
        if self.tx.send(Message::Close(mode)).is_ok() {
            self.tx.closed().await;
        }
        Ok(())
    }

    /// Ask for a graceful close without waiting for it.
    pub(crate) fn close_in_background(&self) {
        // already gone is fine
        let _ = self.tx.send(Message::Close(CloseMode::Graceful));
    }

    /// Close now without waiting; outstanding commands fail.
    pub(crate) fn abort_in_background(&self) {
        let _ = self.tx.send(Message::Close(CloseMode::Forced));
    }
}

async fn send_cancel<S: AsyncWrite + Unpin>(mut stream: S, key: CancelKey) -> Result<()> {
    let mut packet = Vec::with_capacity(16);
    key.encode(&mut packet);
    stream.write_all(&packet).await?;
    stream.flush().await?;
    // the server closes its side without answering
    let _ = stream.shutdown().await;
    debug!(process_id = key.process_id, "cancel request sent");
    Ok(())
}

fn collect<T: for<'a> FromRow<'a>>(result: &QueryResult) -> Result<Vec<T>> {
    result.rows.iter().map(T::from_row).collect()
}

fn first<T: for<'a> FromRow<'a>>(result: &QueryResult) -> Result<Option<T>> {
    result.rows.first().map(T::from_row).transpose()
}
