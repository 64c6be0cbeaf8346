//! PostgreSQL frontend/backend protocol v3.
//!
//! Every command is terminated by `Sync`, so the server answers each one with
//! exactly one `ReadyForQuery` and an `ErrorResponse` only aborts the command
//! it belongs to.

use std::sync::Arc;

use crate::command::{Request, Response};
use crate::error::{Error, Result, ServerError};
use crate::row::{ColumnInfo, Columns, QueryResult, Row};
use crate::statement::{PreparedStatement, StatementHandle, StatementInfo};
use crate::value::Value;

use super::codec::{
    FrameBuilder, read_bytes, read_cstr, read_i16, read_i32, read_u8, read_u16, read_u32,
};
use super::{Decoded, Encoded, Limits};

/// Backend message type bytes.
pub mod msg_type {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';

    /// Messages the server may send at any time.
    pub fn is_async(type_byte: u8) -> bool {
        matches!(
            type_byte,
            NOTICE_RESPONSE | NOTIFICATION_RESPONSE | PARAMETER_STATUS
        )
    }
}

/// Frontend message type bytes.
mod frontend {
    pub const BIND: u8 = b'B';
    pub const CLOSE: u8 = b'C';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const PARSE: u8 = b'P';
    pub const QUERY: u8 = b'Q';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Upper bound on a single backend message; anything larger is a desync.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// One complete backend message.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    pub type_byte: u8,
    pub payload: &'a [u8],
}

/// Split one message off the front of `input`.
///
/// Returns `None` if the message is not complete yet, otherwise the message
/// and the number of bytes it occupies.
pub fn split_message(input: &[u8]) -> Result<Option<(RawMessage<'_>, usize)>> {
    if input.len() < 5 {
        return Ok(None);
    }
    let (type_byte, rest) = read_u8(input)?;
    let (len, _) = read_i32(rest)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
        .ok_or_else(|| Error::fatal_protocol(format!("invalid message length {}", len)))?;
    let total = 1 + len;
    if input.len() < total {
        return Ok(None);
    }
    Ok(Some((
        RawMessage {
            type_byte,
            payload: &input[5..total],
        },
        total,
    )))
}

/// Parse ErrorResponse/NoticeResponse fields.
pub fn parse_error_fields(payload: &[u8]) -> Result<ServerError> {
    let mut fields = ServerError::default();
    let mut severity_non_localized = None;
    let mut data = payload;

    while let Some((&field_type, rest)) = data.split_first() {
        if field_type == 0 {
            break;
        }
        let (value, rest) = read_cstr(rest)?;
        data = rest;

        match field_type {
            b'S' => fields.severity = Some(value.to_string()),
            b'V' => severity_non_localized = Some(value.to_string()),
            b'C' => fields.code = Some(value.to_string()),
            b'M' => fields.message = value.to_string(),
            b'D' => fields.detail = Some(value.to_string()),
            b'H' => fields.hint = Some(value.to_string()),
            _ => {}
        }
    }

    if severity_non_localized.is_some() {
        fields.severity = severity_non_localized;
    }
    Ok(fields)
}

/// Error severities after which the backend closes the connection.
fn is_fatal_severity(fields: &ServerError) -> bool {
    matches!(fields.severity.as_deref(), Some("FATAL") | Some("PANIC"))
}

fn parse_row_description(payload: &[u8]) -> Result<Vec<ColumnInfo>> {
    let (num_fields, mut data) = read_u16(payload)?;
    let mut columns = Vec::with_capacity(num_fields as usize);
    for _ in 0..num_fields {
        let (name, rest) = read_cstr(data)?;
        // table oid, column number
        let (_, rest) = read_bytes(rest, 6)?;
        let (type_oid, rest) = read_u32(rest)?;
        // type size, type modifier, format code
        let (_, rest) = read_bytes(rest, 8)?;
        columns.push(ColumnInfo::new(name, type_oid));
        data = rest;
    }
    Ok(columns)
}

fn parse_parameter_description(payload: &[u8]) -> Result<Vec<u32>> {
    let (count, mut data) = read_u16(payload)?;
    let mut oids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (oid, rest) = read_u32(data)?;
        oids.push(oid);
        data = rest;
    }
    Ok(oids)
}

fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let (count, mut data) = read_i16(payload)?;
    let mut values = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let (len, rest) = read_i32(data)?;
        if len < 0 {
            values.push(None);
            data = rest;
        } else {
            let (value, rest) = read_bytes(rest, len as usize)?;
            values.push(Some(value.to_vec()));
            data = rest;
        }
    }
    Ok(values)
}

/// Rows affected from a CommandComplete tag (`INSERT 0 5`, `UPDATE 3`, `SELECT 2`).
fn parse_command_tag(payload: &[u8]) -> Result<Option<u64>> {
    let (tag, _) = read_cstr(payload)?;
    let verb = tag.split(' ').next().unwrap_or_default();
    let count = match verb {
        "INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => {
            tag.rsplit(' ').next().and_then(|n| n.parse().ok())
        }
        _ => None,
    };
    Ok(count)
}

/// What the pending response should turn into.
#[derive(Debug)]
enum Expect {
    Query,
    Prepare { sql: Arc<str>, handle: StatementHandle },
    Execute,
    Batch,
    Close,
    Ping,
}

/// Decoder state for one PostgreSQL command.
#[derive(Debug)]
pub struct PgResponse {
    expect: Expect,
    /// Column set of the result being read; fixed by the statement for execute/batch
    columns: Option<Columns>,
    current: QueryResult,
    results: Vec<QueryResult>,
    param_types: Vec<u32>,
    error: Option<Error>,
}

impl PgResponse {
    fn new(expect: Expect, columns: Option<Columns>) -> Self {
        Self {
            expect,
            columns,
            current: QueryResult::default(),
            results: Vec::new(),
            param_types: Vec::new(),
            error: None,
        }
    }

    fn finish_result(&mut self, rows_affected: Option<u64>) {
        let mut result = std::mem::take(&mut self.current);
        result.rows_affected = rows_affected;
        if let Some(columns) = &self.columns {
            result.columns = columns.to_vec();
        }
        if matches!(self.expect, Expect::Query) {
            self.columns = None;
        }
        self.results.push(result);
    }

    fn on_message(&mut self, msg: RawMessage<'_>) -> Result<Option<Result<Response>>> {
        match msg.type_byte {
            msg_type::PARSE_COMPLETE
            | msg_type::BIND_COMPLETE
            | msg_type::CLOSE_COMPLETE
            | msg_type::NO_DATA => {}
            msg_type::PARAMETER_DESCRIPTION => {
                self.param_types = parse_parameter_description(msg.payload)?;
            }
            msg_type::ROW_DESCRIPTION => {
                self.columns = Some(Arc::from(parse_row_description(msg.payload)?));
            }
            msg_type::DATA_ROW => {
                let columns = self.columns.as_ref().ok_or_else(|| {
                    Error::fatal_protocol("DataRow without RowDescription")
                })?;
                let values = parse_data_row(msg.payload)?;
                if values.len() != columns.len() {
                    return Err(Error::fatal_protocol(format!(
                        "DataRow has {} columns, expected {}",
                        values.len(),
                        columns.len()
                    )));
                }
                self.current.rows.push(Row::new(Arc::clone(columns), values));
            }
            msg_type::COMMAND_COMPLETE => {
                let affected = parse_command_tag(msg.payload)?;
                self.finish_result(affected);
            }
            msg_type::EMPTY_QUERY_RESPONSE | msg_type::PORTAL_SUSPENDED => {
                self.finish_result(None);
            }
            msg_type::ERROR_RESPONSE => {
                let fields = parse_error_fields(msg.payload)?;
                if is_fatal_severity(&fields) {
                    return Err(Error::Server(fields));
                }
                // keep the first error; the rest of the command was skipped by the server
                self.error.get_or_insert(Error::Server(fields));
            }
            msg_type::READY_FOR_QUERY => return Ok(Some(self.complete())),
            msg_type::COPY_IN_RESPONSE
            | msg_type::COPY_OUT_RESPONSE
            | msg_type::COPY_BOTH_RESPONSE => {
                return Err(Error::fatal_protocol("COPY is not supported"));
            }
            other => {
                return Err(Error::fatal_protocol(format!(
                    "unexpected message '{}'",
                    other as char
                )));
            }
        }
        Ok(None)
    }

    fn complete(&mut self) -> Result<Response> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        let mut results = std::mem::take(&mut self.results).into_iter();
        match &self.expect {
            Expect::Query => {
                let mut first = results.next().unwrap_or_default();
                for next in results {
                    first.push_next(next);
                }
                Ok(Response::Rows(first))
            }
            Expect::Execute => Ok(Response::Rows(results.next().unwrap_or_default())),
            Expect::Batch => Ok(Response::Batch(results.collect())),
            Expect::Prepare { sql, handle } => {
                let info = StatementInfo {
                    handle: handle.clone(),
                    param_types: std::mem::take(&mut self.param_types),
                    columns: self.columns.as_deref().map(<[_]>::to_vec).unwrap_or_default(),
                };
                Ok(Response::Prepared(PreparedStatement::new(
                    Arc::clone(sql),
                    Arc::new(info),
                )))
            }
            Expect::Close => Ok(Response::Closed),
            Expect::Ping => Ok(Response::Pong),
        }
    }
}

/// PostgreSQL codec. Owns the statement name counter of its session.
#[derive(Debug)]
pub struct PgCodec {
    limits: Limits,
    next_statement: u64,
}

impl PgCodec {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            next_statement: 0,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn next_statement_name(&mut self) -> String {
        self.next_statement += 1;
        format!("s{}", self.next_statement)
    }

    pub fn encode(
        &mut self,
        request: &Request,
        statement: Option<&StatementInfo>,
        out: &mut Vec<u8>,
    ) -> Result<Encoded> {
        let state = match request {
            Request::SimpleQuery { sql } => {
                write_query(out, sql)?;
                PgResponse::new(Expect::Query, None)
            }
            Request::Ping => {
                write_query(out, "")?;
                PgResponse::new(Expect::Ping, None)
            }
            Request::Prepare { sql } => {
                let name = self.next_statement_name();
                write_parse(out, &name, sql)?;
                write_describe_statement(out, &name)?;
                write_sync(out)?;
                let handle = StatementHandle::Named(name);
                PgResponse::new(
                    Expect::Prepare {
                        sql: Arc::clone(sql),
                        handle,
                    },
                    None,
                )
            }
            Request::Execute { params, .. } => {
                let info = required(statement)?;
                let name = statement_name(info)?;
                write_bind(out, name, params)?;
                write_execute(out)?;
                write_sync(out)?;
                PgResponse::new(Expect::Execute, statement_columns(info))
            }
            Request::Batch { params, .. } => {
                let info = required(statement)?;
                let name = statement_name(info)?;
                for set in params {
                    write_bind(out, name, set)?;
                    write_execute(out)?;
                }
                write_sync(out)?;
                PgResponse::new(Expect::Batch, statement_columns(info))
            }
            Request::CloseStatement { .. } => {
                let info = required(statement)?;
                write_close_statement(out, statement_name(info)?)?;
                write_sync(out)?;
                PgResponse::new(Expect::Close, None)
            }
        };
        Ok(Encoded::Awaiting(super::ResponseState::Postgres(state)))
    }

    pub fn decode(&mut self, state: &mut PgResponse, input: &[u8]) -> Result<(usize, Decoded)> {
        let mut consumed = 0;
        while let Some((msg, len)) = split_message(&input[consumed..])? {
            consumed += len;
            if msg_type::is_async(msg.type_byte) {
                log_async(msg);
                continue;
            }
            if let Some(result) = state.on_message(msg)? {
                return Ok((consumed, Decoded::Complete(result)));
            }
        }
        Ok((consumed, Decoded::Partial))
    }

    /// Bytes that arrive while no command is outstanding.
    pub fn decode_unsolicited(&mut self, input: &[u8]) -> Result<usize> {
        let mut consumed = 0;
        while let Some((msg, len)) = split_message(&input[consumed..])? {
            if msg_type::is_async(msg.type_byte) {
                log_async(msg);
            } else if msg.type_byte == msg_type::ERROR_RESPONSE {
                // e.g. FATAL: terminating connection due to administrator command
                return Err(Error::Server(parse_error_fields(msg.payload)?));
            } else {
                return Err(Error::fatal_protocol(format!(
                    "unsolicited message '{}'",
                    msg.type_byte as char
                )));
            }
            consumed += len;
        }
        Ok(consumed)
    }

    pub fn encode_terminate(&self, out: &mut Vec<u8>) -> Result<()> {
        FrameBuilder::with_type(out, frontend::TERMINATE).finish()
    }
}

fn log_async(msg: RawMessage<'_>) {
    if msg.type_byte == msg_type::NOTICE_RESPONSE {
        if let Ok(notice) = parse_error_fields(msg.payload) {
            tracing::debug!(%notice, "server notice");
        }
    } else {
        tracing::trace!(type_byte = %(msg.type_byte as char), "skipping async message");
    }
}

fn required(statement: Option<&StatementInfo>) -> Result<&StatementInfo> {
    statement.ok_or_else(|| Error::InvalidUsage("statement is not prepared on this session".into()))
}

fn statement_name(info: &StatementInfo) -> Result<&str> {
    match &info.handle {
        StatementHandle::Named(name) => Ok(name),
        other => Err(Error::InvalidUsage(format!(
            "{} is not a PostgreSQL statement",
            other
        ))),
    }
}

fn statement_columns(info: &StatementInfo) -> Option<Columns> {
    Some(Arc::from(info.columns.as_slice()))
}

fn write_query(out: &mut Vec<u8>, sql: &str) -> Result<()> {
    let mut msg = FrameBuilder::with_type(out, frontend::QUERY);
    msg.write_cstr(sql);
    msg.finish()
}

fn write_parse(out: &mut Vec<u8>, name: &str, sql: &str) -> Result<()> {
    let mut msg = FrameBuilder::with_type(out, frontend::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(sql);
    // let the server infer every parameter type
    msg.write_i16(0);
    msg.finish()
}

fn write_describe_statement(out: &mut Vec<u8>, name: &str) -> Result<()> {
    let mut msg = FrameBuilder::with_type(out, frontend::DESCRIBE);
    msg.write_u8(b'S');
    msg.write_cstr(name);
    msg.finish()
}

/// Bind to the unnamed portal. Bytes go out in binary format (bytea), all
/// other values in text format; results come back in text format.
fn write_bind(out: &mut Vec<u8>, statement: &str, params: &[Value]) -> Result<()> {
    let count = i16::try_from(params.len())
        .map_err(|_| Error::InvalidUsage(format!("too many parameters: {}", params.len())))?;
    let mut msg = FrameBuilder::with_type(out, frontend::BIND);
    msg.write_cstr("");
    msg.write_cstr(statement);
    msg.write_i16(count);
    for param in params {
        msg.write_i16(i16::from(matches!(param, Value::Bytes(_))));
    }
    msg.write_i16(count);
    for param in params {
        match param.to_text() {
            None => msg.write_i32(-1),
            Some(bytes) => {
                msg.write_i32(bytes.len() as i32);
                msg.write_bytes(&bytes);
            }
        }
    }
    msg.write_i16(0);
    msg.finish()
}

fn write_execute(out: &mut Vec<u8>) -> Result<()> {
    let mut msg = FrameBuilder::with_type(out, frontend::EXECUTE);
    msg.write_cstr("");
    msg.write_i32(0);
    msg.finish()
}

fn write_close_statement(out: &mut Vec<u8>, name: &str) -> Result<()> {
    let mut msg = FrameBuilder::with_type(out, frontend::CLOSE);
    msg.write_u8(b'S');
    msg.write_cstr(name);
    msg.finish()
}

fn write_sync(out: &mut Vec<u8>) -> Result<()> {
    FrameBuilder::with_type(out, frontend::SYNC).finish()
}
