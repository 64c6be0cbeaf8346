//! Wire protocol codecs.
//!
//! A session picks one [`Codec`] variant at construction and never branches on
//! the protocol again: the queue hands the codec the head command's
//! [`ResponseState`] together with whatever bytes have arrived.
//!
//! # Structure
//!
//! - `codec`: Low-level encoding/decoding primitives
//! - `types`: Fixed-width wire integers
//! - `postgres`, `mysql`, `drda`: one codec per protocol

pub mod codec;
pub mod drda;
pub mod mysql;
pub mod postgres;
pub mod types;

use crate::command::{Request, Response};
use crate::error::{Error, Result};
use crate::opts::{Opts, Protocol};
use crate::statement::StatementInfo;
use crate::value::Value;

pub use drda::DrdaCodec;
pub use mysql::MySqlCodec;
pub use postgres::PgCodec;

/// Encoding limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest encoded size of a single parameter value
    pub max_param_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_param_size: 16 * 1024 * 1024,
        }
    }
}

impl From<&Opts> for Limits {
    fn from(opts: &Opts) -> Self {
        Self {
            max_param_size: opts.max_param_size,
        }
    }
}

/// Outcome of encoding one command.
#[derive(Debug)]
pub enum Encoded {
    /// Frames were written; decode the answer with this state.
    Awaiting(ResponseState),
    /// The protocol sends no answer for this command; its result is already known.
    NoResponse(Response),
}

/// Outcome of feeding bytes to the decoder.
#[derive(Debug)]
pub enum Decoded {
    /// The response is not complete yet.
    Partial,
    /// The response is complete. An error here concerns only this command.
    Complete(Result<Response>),
}

/// Per-command decoder state, owned by the queue entry it belongs to.
#[derive(Debug)]
pub enum ResponseState {
    Postgres(postgres::PgResponse),
    MySql(mysql::MySqlResponse),
    Drda(drda::DrdaResponse),
}

/// Protocol codec of one session.
#[derive(Debug)]
pub enum Codec {
    Postgres(PgCodec),
    MySql(MySqlCodec),
    Drda(DrdaCodec),
}

impl Codec {
    pub fn new(protocol: Protocol, limits: Limits) -> Self {
        match protocol {
            Protocol::Postgres => Codec::Postgres(PgCodec::new(limits)),
            Protocol::MySql => Codec::MySql(MySqlCodec::new(limits)),
            Protocol::Drda => Codec::Drda(DrdaCodec::new(limits)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Codec::Postgres(_) => Protocol::Postgres,
            Codec::MySql(_) => Protocol::MySql,
            Codec::Drda(_) => Protocol::Drda,
        }
    }

    fn limits(&self) -> Limits {
        match self {
            Codec::Postgres(codec) => codec.limits(),
            Codec::MySql(codec) => codec.limits(),
            Codec::Drda(codec) => codec.limits(),
        }
    }

    /// Reject a request whose parameters exceed the configured limit.
    pub fn check_params(&self, request: &Request) -> Result<()> {
        let limit = self.limits().max_param_size;
        let measure = match self {
            Codec::Postgres(_) | Codec::Drda(_) => Value::text_len,
            Codec::MySql(_) => Value::binary_len,
        };
        let size = request.largest_param(measure);
        if size > limit {
            return Err(Error::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    /// Append the frames for `request` to `out`.
    ///
    /// `statement` is the session's cache entry for execute, batch and close.
    /// On error nothing is left in `out`.
    pub fn encode(
        &mut self,
        request: &Request,
        statement: Option<&StatementInfo>,
        out: &mut Vec<u8>,
    ) -> Result<Encoded> {
        self.check_params(request)?;

        let start = out.len();
        let encoded = match self {
            Codec::Postgres(codec) => codec.encode(request, statement, out),
            Codec::MySql(codec) => codec.encode(request, statement, out),
            Codec::Drda(codec) => codec.encode(request, statement, out),
        };
        if encoded.is_err() {
            out.truncate(start);
        }
        encoded
    }

    /// Decode as much of `input` as belongs to the command owning `state`.
    ///
    /// Returns the number of bytes consumed; only whole frames are consumed.
    /// An `Err` is fatal: the byte stream can no longer be trusted.
    pub fn decode(
        &mut self,
        state: &mut ResponseState,
        input: &[u8],
    ) -> Result<(usize, Decoded)> {
        match (self, state) {
            (Codec::Postgres(codec), ResponseState::Postgres(state)) => codec.decode(state, input),
            (Codec::MySql(codec), ResponseState::MySql(state)) => codec.decode(state, input),
            (Codec::Drda(codec), ResponseState::Drda(state)) => codec.decode(state, input),
            _ => Err(Error::fatal_protocol(
                "response state does not belong to this codec",
            )),
        }
    }

    /// Handle bytes that arrive while no command is outstanding.
    pub fn decode_unsolicited(&mut self, input: &[u8]) -> Result<usize> {
        match self {
            Codec::Postgres(codec) => codec.decode_unsolicited(input),
            Codec::MySql(codec) => codec.decode_unsolicited(input),
            Codec::Drda(codec) => codec.decode_unsolicited(input),
        }
    }

    /// Append the protocol's goodbye frame, if it has one.
    pub fn encode_terminate(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Codec::Postgres(codec) => codec.encode_terminate(out),
            Codec::MySql(codec) => codec.encode_terminate(out),
            Codec::Drda(codec) => codec.encode_terminate(out),
        }
    }
}
