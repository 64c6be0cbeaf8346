//! In-memory fake PostgreSQL servers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use zero_sqlclient::tokio::{BoxFuture, Conn, Connect};
use zero_sqlclient::{Error, Opts, Protocol, Result};

pub fn opts(pipelining_limit: usize) -> Opts {
    Opts {
        pipelining_limit,
        ..Opts::for_protocol(Protocol::Postgres)
    }
}

pub fn message(type_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![type_byte];
    out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn ready() -> Vec<u8> {
    message(b'Z', b"I")
}

pub fn row_description(names: &[&str]) -> Vec<u8> {
    let mut payload = (names.len() as u16).to_be_bytes().to_vec();
    for name in names {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0i16.to_be_bytes());
        payload.extend_from_slice(&25u32.to_be_bytes());
        payload.extend_from_slice(&(-1i16).to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
    }
    message(b'T', &payload)
}

pub fn data_row(value: &[u8]) -> Vec<u8> {
    let mut payload = 1i16.to_be_bytes().to_vec();
    payload.extend_from_slice(&(value.len() as i32).to_be_bytes());
    payload.extend_from_slice(value);
    message(b'D', &payload)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut payload = tag.as_bytes().to_vec();
    payload.push(0);
    message(b'C', &payload)
}

pub fn error(code: &str, text: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', text)] {
        payload.push(field);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    message(b'E', &payload)
}

/// Answer to a simple query returning one row with one text column.
pub fn select_response(value: &str) -> Vec<u8> {
    let mut out = row_description(&["v"]);
    out.extend(data_row(value.as_bytes()));
    out.extend(command_complete("SELECT 1"));
    out.extend(ready());
    out
}

/// Server side of a duplex pipe, reading frontend messages.
pub struct FakeServer {
    stream: DuplexStream,
    buffer: Vec<u8>,
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Next typed frontend message, `None` on EOF.
    pub async fn next_message(&mut self) -> Option<(u8, Vec<u8>)> {
        loop {
            if self.buffer.len() >= 5 {
                let len = i32::from_be_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]) as usize;
                if self.buffer.len() > len {
                    let msg: Vec<u8> = self.buffer.drain(..1 + len).collect();
                    return Some((msg[0], msg[5..].to_vec()));
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next message, or `None` if nothing arrives within `wait`.
    pub async fn next_message_within(&mut self, wait: Duration) -> Option<(u8, Vec<u8>)> {
        tokio::time::timeout(wait, self.next_message()).await.ok().flatten()
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
    }

    /// Send `bytes` in tiny pieces to exercise partial frame handling.
    pub async fn send_split(&mut self, bytes: &[u8], piece: usize) {
        for chunk in bytes.chunks(piece) {
            self.send(chunk).await;
            tokio::task::yield_now().await;
        }
    }
}

fn cstr(bytes: &[u8]) -> (String, &[u8]) {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s = String::from_utf8_lossy(&bytes[..end]).into_owned();
    (s, bytes.get(end + 1..).unwrap_or_default())
}

/// First parameter value of a Bind message.
fn first_bind_value(payload: &[u8]) -> Option<Vec<u8>> {
    let (_portal, rest) = cstr(payload);
    let (_statement, rest) = cstr(rest);
    let formats = i16::from_be_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2 + formats * 2..];
    let count = i16::from_be_bytes([rest[0], rest[1]]);
    if count == 0 {
        return None;
    }
    let len = i32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]);
    if len < 0 {
        return None;
    }
    Some(rest[6..6 + len as usize].to_vec())
}

/// Counters shared between a test and its automatic servers.
#[derive(Debug, Default)]
pub struct Stats {
    pub parses: AtomicUsize,
    pub closes: AtomicUsize,
    pub queries: AtomicUsize,
}

impl Stats {
    pub fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

/// Answer every command like a tiny PostgreSQL.
///
/// `SELECT <text>` returns one row holding `<text>`; any SQL containing
/// `nope` fails with SQLSTATE 42703; an empty query is a ping. Executions
/// return their first parameter as the single column.
pub async fn serve(stream: DuplexStream, stats: Arc<Stats>) {
    let mut server = FakeServer::new(stream);
    let mut reply = Vec::new();
    let mut failed = false;

    while let Some((type_byte, payload)) = server.next_message().await {
        match type_byte {
            b'Q' => {
                stats.queries.fetch_add(1, Ordering::SeqCst);
                let (sql, _) = cstr(&payload);
                if sql.is_empty() {
                    reply.extend(message(b'I', &[]));
                    reply.extend(ready());
                } else if sql.contains("nope") {
                    reply.extend(error("42703", "column \"nope\" does not exist"));
                    reply.extend(ready());
                } else {
                    let value = sql.strip_prefix("SELECT ").unwrap_or("ok");
                    reply.extend(select_response(value.trim_matches('\'')));
                }
                server.send(&std::mem::take(&mut reply)).await;
            }
            b'P' => {
                stats.parses.fetch_add(1, Ordering::SeqCst);
                let (_name, rest) = cstr(&payload);
                let (sql, _) = cstr(rest);
                if sql.contains("nope") {
                    reply.extend(error("42703", "column \"nope\" does not exist"));
                    failed = true;
                } else {
                    reply.extend(message(b'1', &[]));
                }
            }
            b'D' if !failed => {
                let mut params = 1u16.to_be_bytes().to_vec();
                params.extend_from_slice(&25u32.to_be_bytes());
                reply.extend(message(b't', &params));
                reply.extend(row_description(&["v"]));
            }
            b'B' if !failed => {
                reply.extend(message(b'2', &[]));
                let value = first_bind_value(&payload).unwrap_or_else(|| b"ok".to_vec());
                reply.extend(data_row(&value));
            }
            b'E' if !failed => {
                reply.extend(command_complete("SELECT 1"));
            }
            b'C' => {
                stats.closes.fetch_add(1, Ordering::SeqCst);
                reply.extend(message(b'3', &[]));
            }
            b'S' => {
                reply.extend(ready());
                failed = false;
                server.send(&std::mem::take(&mut reply)).await;
            }
            b'X' => break,
            _ => {}
        }
    }
}

/// What a [`FakeConnector`] does on its n-th connect (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// A healthy server.
    Serve,
    /// The connect attempt fails.
    Refuse,
    /// The server hangs up on the first message it receives.
    HangUp,
    /// The server reads everything and never answers.
    Silent,
}

/// Pool connector backed by in-memory servers.
pub struct FakeConnector {
    pub opts: Opts,
    pub stats: Arc<Stats>,
    pub connects: Arc<AtomicUsize>,
    pub plan: Arc<dyn Fn(usize) -> Plan + Send + Sync>,
}

impl FakeConnector {
    pub fn healthy(opts: Opts) -> Self {
        Self::with_plan(opts, |_| Plan::Serve)
    }

    pub fn with_plan(opts: Opts, plan: impl Fn(usize) -> Plan + Send + Sync + 'static) -> Self {
        Self {
            opts,
            stats: Arc::new(Stats::default()),
            connects: Arc::new(AtomicUsize::new(0)),
            plan: Arc::new(plan),
        }
    }
}

impl Connect for FakeConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Conn>> {
        Box::pin(async move {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(64 * 1024);
            match (self.plan)(n) {
                Plan::Serve => {
                    tokio::spawn(serve(server, Arc::clone(&self.stats)));
                }
                Plan::Refuse => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )));
                }
                Plan::HangUp => {
                    tokio::spawn(async move {
                        let mut server = FakeServer::new(server);
                        let _ = server.next_message().await;
                    });
                }
                Plan::Silent => {
                    tokio::spawn(async move {
                        let mut server = FakeServer::new(server);
                        while server.next_message().await.is_some() {}
                    });
                }
            }
            Conn::from_authenticated_stream(client, &self.opts).await
        })
    }
}
