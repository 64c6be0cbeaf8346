//! Ordered, bounded queue of commands in flight on one session.
//!
//! Responses are matched to commands purely by position: the decoder always
//! works on the head entry's [`ResponseState`]. Entries whose result is known
//! without a server reply wait in line and resolve when they reach the head.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::command::{Command, Request, Response};
use crate::error::{Error, Result};
use crate::protocol::{Codec, Decoded, ResponseState};
use crate::statement::StatementInfo;

/// A statement cache reference held by an execution until it resolves.
#[derive(Debug)]
pub struct Held {
    pub sql: Arc<str>,
    pub info: Arc<StatementInfo>,
}

#[derive(Debug)]
enum Slot {
    Awaiting(ResponseState),
    Ready(Result<Response>),
}

#[derive(Debug)]
struct Entry {
    command: Command,
    slot: Slot,
    held: Option<Held>,
}

#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    entries: VecDeque<Entry>,
}

impl CommandQueue {
    /// `capacity` is the pipelining limit; `1` means one command at a time.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Append a sent command. A full queue hands the command back.
    pub fn push(
        &mut self,
        command: Command,
        state: ResponseState,
        held: Option<Held>,
    ) -> core::result::Result<(), Command> {
        self.push_entry(Entry {
            command,
            slot: Slot::Awaiting(state),
            held,
        })
    }

    /// Append a command whose result is already known.
    pub fn push_ready(
        &mut self,
        command: Command,
        result: Result<Response>,
        held: Option<Held>,
    ) -> core::result::Result<(), Command> {
        self.push_entry(Entry {
            command,
            slot: Slot::Ready(result),
            held,
        })
    }

    fn push_entry(&mut self, entry: Entry) -> core::result::Result<(), Command> {
        if self.is_full() {
            return Err(entry.command);
        }
        tracing::trace!(id = %entry.command.id, kind = ?entry.command.kind(), "queued");
        self.entries.push_back(entry);
        Ok(())
    }

    /// Decode `input` against the head entries, resolving each completed one.
    ///
    /// `on_complete` sees every request and its result just before the
    /// command's slot is resolved. Returns the bytes consumed; a trailing
    /// partial frame is left for the next call. An `Err` means the stream
    /// is desynchronized: the head command has already been failed with it.
    pub fn on_response_bytes<F>(
        &mut self,
        codec: &mut Codec,
        input: &[u8],
        mut on_complete: F,
    ) -> Result<usize>
    where
        F: FnMut(&Request, &Result<Response>, Option<Held>),
    {
        let mut consumed = 0;
        loop {
            self.flush_ready(&mut on_complete);
            let Some(head) = self.entries.front_mut() else {
                break;
            };
            let Slot::Awaiting(state) = &mut head.slot else {
                continue;
            };
            match codec.decode(state, &input[consumed..]) {
                Ok((n, Decoded::Partial)) => return Ok(consumed + n),
                Ok((n, Decoded::Complete(result))) => {
                    consumed += n;
                    if let Some(entry) = self.entries.pop_front() {
                        finish(entry.command, result, entry.held, &mut on_complete);
                    }
                }
                Err(err) => {
                    if let Some(entry) = self.entries.pop_front() {
                        finish(entry.command, Err(err.duplicate()), entry.held, &mut on_complete);
                    }
                    return Err(err);
                }
            }
        }

        if consumed < input.len() {
            consumed += codec.decode_unsolicited(&input[consumed..])?;
        }
        Ok(consumed)
    }

    /// Resolve entries at the head whose result is already known.
    pub fn flush_ready<F>(&mut self, on_complete: &mut F)
    where
        F: FnMut(&Request, &Result<Response>, Option<Held>),
    {
        while matches!(self.entries.front(), Some(Entry { slot: Slot::Ready(_), .. })) {
            let Some(Entry {
                command,
                slot: Slot::Ready(result),
                held,
            }) = self.entries.pop_front()
            else {
                break;
            };
            finish(command, result, held, on_complete);
        }
    }

    /// Fail every queued command with `ConnectionLost`, in order.
    pub fn on_connection_broken(&mut self) {
        for entry in self.entries.drain(..) {
            tracing::trace!(id = %entry.command.id, "failing queued command: connection lost");
            entry.command.resolve(Err(Error::ConnectionLost));
        }
    }
}

fn finish<F>(command: Command, result: Result<Response>, held: Option<Held>, on_complete: &mut F)
where
    F: FnMut(&Request, &Result<Response>, Option<Held>),
{
    tracing::trace!(id = %command.id, ok = result.is_ok(), "command complete");
    on_complete(&command.request, &result, held);
    command.resolve(result);
}
