//! The task that moves bytes between a [`Session`] and its transport.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::state::{CancelKey, CloseMode, Session, SessionState};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) enum Message {
    Submit(Command),
    Close(CloseMode),
}

/// Run a session until it is closed or broken.
///
/// `ready` is answered once the handshake finishes or fails, with the
/// session's cancel key if the server sent one. Dropping every
/// sender closes the session gracefully.
pub(crate) async fn run<S>(
    stream: S,
    mut session: Session,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    ready: oneshot::Sender<Result<Option<CancelKey>>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut ready = Some(ready);
    let mut inbox_open = true;

    loop {
        if session.state() != SessionState::Connecting
            && let Some(ready) = ready.take()
        {
            let startup = match session.take_failure() {
                Some(err) => Err(err),
                None if session.is_broken() => Err(Error::ConnectionLost),
                None => Ok(session.cancel_key()),
            };
            // the connecting caller may have given up
            let _ = ready.send(startup);
        }
        if session.is_broken() || (session.is_terminal() && session.write_buffer().is_empty()) {
            break;
        }

        let pending_write = !session.write_buffer().is_empty();
        let running = !session.is_terminal();
        tokio::select! {
            written = writer.write(session.write_buffer()), if pending_write => match written {
                Ok(0) => {
                    if session.is_terminal() {
                        break;
                    }
                    session.on_transport_error(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    trace!(bytes = n, "wrote");
                    session.consume_written(n);
                }
                Err(err) => {
                    if session.is_terminal() {
                        break;
                    }
                    session.on_transport_error(err);
                }
            },
            message = inbox.recv(), if inbox_open && running => match message {
                Some(Message::Submit(command)) => session.submit(command),
                Some(Message::Close(mode)) => session.close(mode),
                None => {
                    debug!("all handles dropped; closing session");
                    inbox_open = false;
                    session.close(CloseMode::Graceful);
                }
            },
            read = reader.read(&mut chunk), if running => match read {
                Ok(0) => session.on_closed(),
                Ok(n) => session.on_bytes(&chunk[..n]),
                Err(err) => session.on_transport_error(err),
            },
            else => break,
        }
    }

    // handles see the session as closed before the transport winds down
    inbox.close();
    // commands that raced with the shutdown
    while let Ok(message) = inbox.try_recv() {
        if let Message::Submit(command) = message {
            session.submit(command);
        }
    }

    if !session.is_broken() {
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
    debug!(state = ?session.state(), "session task finished");
}
