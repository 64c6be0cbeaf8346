//! Connection behavior against in-memory servers.
//!
//! ## Test Matrix
//!
//! - `test_results_in_order_under_split_delivery` - three pipelined queries, answers fed byte by byte
//! - `test_pipelining_limit_bounds_in_flight` - the third command is not written until one resolves
//! - `test_connection_loss_fails_everything_outstanding` - EOF with commands in flight
//! - `test_execute_prepares_once_per_connection` - statement cache hit/miss counts
//! - `test_batch_runs_every_parameter_set` - one prepare, results in parameter set order
//! - `test_prepare_failure_reaches_execute` - auto-prepare error surfaces on the execute
//! - `test_payload_too_large_sends_nothing` - oversized parameter never reaches the wire
//! - `test_cancel_before_send` - a cancelled command is never written
//! - `test_pg_startup_handshake` - commands wait for ReadyForQuery
//! - `test_auth_failure_fails_connect` - class 28 error surfaces as `Error::Auth`
//! - `test_close_is_graceful` - outstanding work finishes, then Terminate
//! - `test_cancel_after_send` - CancelRequest on a side connection, the command fails with 57014
//! - `test_cancel_without_key_is_unsupported` - no backend key, no cancel request
//! - `test_handles_see_close_before_transport_shutdown` - a stuck shutdown does not hide a broken session

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use zero_sqlclient::state::PgStartup;
use zero_sqlclient::tokio::Conn;
use zero_sqlclient::{Error, Request, Value};

const QUIET: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_results_in_order_under_split_delivery() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(client, &opts(8)).await.unwrap();
    let mut server = FakeServer::new(server);

    let mut pending = Vec::new();
    for sql in ["SELECT 'a'", "SELECT 'b'", "SELECT 'c'"] {
        let request = Request::SimpleQuery { sql: sql.into() };
        pending.push(conn.submit(request).await.unwrap());
    }
    for _ in 0..3 {
        assert_eq!(server.next_message().await.unwrap().0, b'Q');
    }

    let mut answers = select_response("a");
    answers.extend(select_response("b"));
    answers.extend(select_response("c"));
    server.send_split(&answers, 1).await;

    let mut values = Vec::new();
    for pending in pending {
        let result = pending.await.unwrap().into_rows().unwrap();
        values.push(result.rows[0].get::<String>(0).unwrap());
    }
    assert_eq!(values, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_pipelining_limit_bounds_in_flight() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(client, &opts(2)).await.unwrap();
    let mut server = FakeServer::new(server);

    let first = conn.submit(Request::SimpleQuery { sql: "SELECT 1".into() }).await.unwrap();
    let second = conn.submit(Request::SimpleQuery { sql: "SELECT 2".into() }).await.unwrap();
    let third = tokio::spawn({
        let conn = conn.clone();
        async move { conn.query("SELECT 3").await }
    });

    assert!(server.next_message().await.is_some());
    assert!(server.next_message().await.is_some());
    assert!(server.next_message_within(QUIET).await.is_none());

    server.send(&select_response("1")).await;
    assert!(first.await.is_ok());
    let (type_byte, payload) = server.next_message().await.unwrap();
    assert_eq!(type_byte, b'Q');
    assert_eq!(payload, b"SELECT 3\0");

    server.send(&select_response("2")).await;
    server.send(&select_response("3")).await;
    assert!(second.await.is_ok());
    let third = third.await.unwrap().unwrap();
    assert_eq!(third.rows[0].get::<i32>(0).unwrap(), 3);
}

#[tokio::test]
async fn test_connection_loss_fails_everything_outstanding() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(client, &opts(4)).await.unwrap();
    let mut server = FakeServer::new(server);

    let mut pending = Vec::new();
    for i in 0..3 {
        let request = Request::SimpleQuery {
            sql: format!("SELECT {}", i),
        };
        pending.push(conn.submit(request).await.unwrap());
    }
    for _ in 0..3 {
        server.next_message().await.unwrap();
    }
    drop(server);

    for pending in pending {
        assert!(matches!(pending.await, Err(Error::ConnectionLost)));
    }
    conn.close().await.unwrap();
    assert!(conn.is_closed());
    assert!(matches!(conn.query("SELECT 1").await, Err(Error::ConnectionLost)));
}

#[tokio::test]
async fn test_execute_prepares_once_per_connection() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let stats = Arc::new(Stats::default());
    tokio::spawn(serve(server, Arc::clone(&stats)));
    let conn = Conn::from_authenticated_stream(client, &opts(16)).await.unwrap();

    let sql = "SELECT v FROM t WHERE v = $1";
    let padded = format!("  {}\n", sql);
    let (a, b, c) = tokio::join!(
        conn.execute(sql, ("a",)),
        conn.execute(sql, ("b",)),
        conn.execute(padded.as_str(), ("c",)),
    );
    assert_eq!(a.unwrap().rows[0].get::<&str>(0).unwrap(), "a");
    assert_eq!(b.unwrap().rows[0].get::<&str>(0).unwrap(), "b");
    assert_eq!(c.unwrap().rows[0].get::<&str>(0).unwrap(), "c");
    assert_eq!(stats.parses(), 1);

    let stmt = conn.prepare(sql).await.unwrap();
    assert_eq!(stats.parses(), 1);
    assert_eq!(stmt.columns().len(), 1);
    let rows: Vec<(String,)> = conn.execute_collect(&stmt, ("d",)).await.unwrap();
    assert_eq!(rows, vec![("d".to_string(),)]);

    conn.close_statement(&stmt).await.unwrap();
    assert_eq!(stats.closes(), 1);
    conn.execute(sql, ("e",)).await.unwrap();
    assert_eq!(stats.parses(), 2);
}

#[tokio::test]
async fn test_batch_runs_every_parameter_set() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let stats = Arc::new(Stats::default());
    tokio::spawn(serve(server, Arc::clone(&stats)));
    let conn = Conn::from_authenticated_stream(client, &opts(4)).await.unwrap();

    let params = vec![
        vec![Value::Text("x".into())],
        vec![Value::Text("y".into())],
        vec![Value::Int(7)],
    ];
    let results = conn.batch("SELECT $1", params).await.unwrap();
    let values: Vec<String> = results
        .iter()
        .map(|r| r.rows[0].get::<String>(0).unwrap())
        .collect();
    assert_eq!(values, vec!["x", "y", "7"]);
    assert_eq!(stats.parses(), 1);
}

#[tokio::test]
async fn test_prepare_failure_reaches_execute() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let stats = Arc::new(Stats::default());
    tokio::spawn(serve(server, Arc::clone(&stats)));
    let conn = Conn::from_authenticated_stream(client, &opts(4)).await.unwrap();

    let err = conn.execute("SELECT nope", ()).await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42703"));
    // the session is still healthy
    let result = conn.query("SELECT 'fine'").await.unwrap();
    assert_eq!(result.rows[0].get::<&str>(0).unwrap(), "fine");
    let rows: Vec<(String,)> = conn.query_collect("SELECT 'x'").await.unwrap();
    assert_eq!(rows, vec![("x".to_string(),)]);
}

#[tokio::test]
async fn test_payload_too_large_sends_nothing() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let options = zero_sqlclient::Opts {
        max_param_size: 8,
        ..opts(4)
    };
    let conn = Conn::from_authenticated_stream(client, &options).await.unwrap();
    let mut server = FakeServer::new(server);

    let err = conn
        .execute("INSERT INTO t VALUES ($1)", (vec![0u8; 9],))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { size: 9, limit: 8 }));
    assert!(server.next_message_within(QUIET).await.is_none());

    let follow_up = tokio::spawn({
        let conn = conn.clone();
        async move { conn.query("SELECT 1").await }
    });
    let (type_byte, _) = server.next_message().await.unwrap();
    assert_eq!(type_byte, b'Q');
    server.send(&select_response("1")).await;
    assert!(follow_up.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancel_before_send() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(client, &opts(1)).await.unwrap();
    let mut server = FakeServer::new(server);

    // the execute waits behind its own prepare, which holds the only slot
    let request = Request::Execute {
        sql: Arc::from("SELECT $1"),
        params: vec![Value::Int(1)],
    };
    let pending = conn.submit(request).await.unwrap();
    assert_eq!(server.next_message().await.unwrap().0, b'P');
    assert!(pending.cancel());
    assert!(matches!(pending.await, Err(Error::Cancelled)));

    let mut prepared = message(b'1', &[]);
    prepared.extend(message(b't', &0u16.to_be_bytes()));
    prepared.extend(message(b'n', &[]));
    prepared.extend(ready());
    server.send(&prepared).await;

    let follow_up = tokio::spawn({
        let conn = conn.clone();
        async move { conn.ping().await }
    });
    assert_eq!(server.next_message().await.unwrap().0, b'D');
    assert_eq!(server.next_message().await.unwrap().0, b'S');
    let (type_byte, payload) = server.next_message().await.unwrap();
    assert_eq!((type_byte, payload), (b'Q', b"\0".to_vec()));
    let mut pong = message(b'I', &[]);
    pong.extend(ready());
    server.send(&pong).await;
    follow_up.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pg_startup_handshake() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let options = zero_sqlclient::Opts {
        user: "alice".into(),
        ..opts(4)
    };
    let server_task = tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut server = server;
        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut startup = vec![0u8; i32::from_be_bytes(len) as usize - 4];
        server.read_exact(&mut startup).await.unwrap();
        assert!(startup.windows(6).any(|w| w == b"alice\0"));

        let mut reply = message(b'R', &0i32.to_be_bytes());
        reply.extend(message(b'S', b"server_version\x0016.1\0"));
        reply.extend(ready());
        server.write_all(&reply).await.unwrap();

        let mut server = FakeServer::new(server);
        let (type_byte, _) = server.next_message().await.unwrap();
        assert_eq!(type_byte, b'Q');
        server.send(&select_response("hello")).await;
        server
    });

    let conn = Conn::from_stream(client, &options, Box::new(PgStartup::new(&options)))
        .await
        .unwrap();
    let greeting: Option<(String,)> = conn.query_first("SELECT 'hello'").await.unwrap();
    assert_eq!(greeting, Some(("hello".to_string(),)));
    drop(server_task.await.unwrap());
}

#[tokio::test]
async fn test_auth_failure_fails_connect() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let options = zero_sqlclient::Opts {
        user: "alice".into(),
        ..opts(4)
    };
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut server = server;
        let mut startup = [0u8; 256];
        let _ = server.read(&mut startup).await;
        let mut payload = Vec::new();
        for (field, value) in [(b'S', "FATAL"), (b'C', "28P01"), (b'M', "bad password")] {
            payload.push(field);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let _ = server.write_all(&message(b'E', &payload)).await;
        let _ = server.read(&mut startup).await;
    });

    let err = Conn::from_stream(client, &options, Box::new(PgStartup::new(&options)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
}

#[tokio::test]
async fn test_close_is_graceful() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(client, &opts(4)).await.unwrap();
    let mut server = FakeServer::new(server);

    let pending = conn.submit(Request::SimpleQuery { sql: "SELECT 1".into() }).await.unwrap();
    assert_eq!(server.next_message().await.unwrap().0, b'Q');

    let closing = tokio::spawn({
        let conn = conn.clone();
        async move { conn.close().await }
    });
    assert!(server.next_message_within(QUIET).await.is_none());
    server.send(&select_response("1")).await;
    assert!(pending.await.is_ok());

    assert_eq!(server.next_message().await.unwrap().0, b'X');
    closing.await.unwrap().unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_cancel_after_send() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (client, server) = tokio::io::duplex(64 * 1024);
    let options = zero_sqlclient::Opts {
        user: "alice".into(),
        ..opts(4)
    };
    let server_task = tokio::spawn(async move {
        let mut server = server;
        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut startup = vec![0u8; i32::from_be_bytes(len) as usize - 4];
        server.read_exact(&mut startup).await.unwrap();

        let mut reply = message(b'R', &0i32.to_be_bytes());
        reply.extend(message(b'K', &[0, 0, 0x30, 0x39, 0, 0, 0, 7]));
        reply.extend(ready());
        server.write_all(&reply).await.unwrap();
        FakeServer::new(server)
    });

    let conn = Conn::from_stream(client, &options, Box::new(PgStartup::new(&options)))
        .await
        .unwrap();
    let mut server = server_task.await.unwrap();
    let key = conn.cancel_key().unwrap();
    assert_eq!((key.process_id, key.secret_key), (12345, 7));

    let pending = conn
        .submit(Request::SimpleQuery { sql: "SELECT pg_sleep(60)".into() })
        .await
        .unwrap();
    assert_eq!(server.next_message().await.unwrap().0, b'Q');

    let (side, mut postmaster) = tokio::io::duplex(64);
    conn.cancel_over(side).await.unwrap();
    let mut request = Vec::new();
    postmaster.read_to_end(&mut request).await.unwrap();
    assert_eq!(
        request,
        [0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e, 0, 0, 0x30, 0x39, 0, 0, 0, 7]
    );

    let mut answer = error("57014", "canceling statement due to user request");
    answer.extend(ready());
    server.send(&answer).await;
    let err = pending.await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("57014"));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_cancel_without_key_is_unsupported() {
    let (client, _server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(client, &opts(4)).await.unwrap();
    assert!(conn.cancel_key().is_none());
    let (side, _postmaster) = tokio::io::duplex(64);
    assert!(matches!(
        conn.cancel_over(side).await,
        Err(Error::Unsupported(_))
    ));
}

/// Transport whose shutdown never completes.
struct StuckShutdown(tokio::io::DuplexStream);

impl tokio::io::AsyncRead for StuckShutdown {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for StuckShutdown {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Pending
    }
}

#[tokio::test]
async fn test_handles_see_close_before_transport_shutdown() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Conn::from_authenticated_stream(StuckShutdown(client), &opts(4))
        .await
        .unwrap();
    let pending = conn.submit(Request::SimpleQuery { sql: "SELECT 1".into() }).await.unwrap();
    let mut server = FakeServer::new(server);
    assert_eq!(server.next_message().await.unwrap().0, b'Q');
    drop(server);

    assert!(matches!(pending.await, Err(Error::ConnectionLost)));
    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
