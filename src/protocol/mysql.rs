//! MySQL client/server protocol (4.1+, classic EOF framing).
//!
//! Every command starts a new sequence at 0; the server numbers its packets
//! from 1. A sequence id mismatch means the stream is desynchronized.

use std::sync::Arc;

use crate::command::{Request, Response};
use crate::error::{Error, Result, ServerError};
use crate::row::{ColumnInfo, Columns, QueryResult, Row};
use crate::statement::{PreparedStatement, StatementHandle, StatementInfo};
use crate::value::Value;

use super::codec::{
    FrameBuilder, LengthField, read_bytes, read_u8, read_u16_le, read_u32_le, read_u64_le, utf8,
};
use super::{Decoded, Encoded, Limits};

/// Command bytes.
mod command {
    pub const QUIT: u8 = 0x01;
    pub const QUERY: u8 = 0x03;
    pub const PING: u8 = 0x0e;
    pub const STMT_PREPARE: u8 = 0x16;
    pub const STMT_EXECUTE: u8 = 0x17;
    pub const STMT_CLOSE: u8 = 0x19;
}

/// Column types with a fixed-size binary encoding.
pub mod field_type {
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONGLONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
}

const UNSIGNED_FLAG: u16 = 0x0020;
const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xfe;
const ERR_HEADER: u8 = 0xff;
const LOCAL_INFILE_HEADER: u8 = 0xfb;

/// Error codes after which the server drops the connection.
const FATAL_ERROR_CODES: &[u16] = &[
    1053, // ER_SERVER_SHUTDOWN
    1077, // ER_NORMAL_SHUTDOWN
    1152, // ER_ABORTING_CONNECTION
    1154, // ER_NET_READ_ERROR_FROM_PIPE
    1156, // ER_NET_PACKETS_OUT_OF_ORDER
    1158, // ER_NET_READ_ERROR
    1159, // ER_NET_READ_INTERRUPTED
    1160, // ER_NET_ERROR_ON_WRITE
    1161, // ER_NET_WRITE_INTERRUPTED
    1184, // ER_NEW_ABORTING_CONNECTION
    1927, // ER_CONNECTION_KILLED
    4031, // ER_CLIENT_INTERACTION_TIMEOUT
];

/// One complete packet.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub sequence_id: u8,
    pub payload: &'a [u8],
}

impl Packet<'_> {
    fn header(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    fn is_eof(&self) -> bool {
        self.header() == Some(EOF_HEADER) && self.payload.len() < 9
    }
}

/// Split one packet off the front of `input`.
pub fn split_packet(input: &[u8]) -> Result<Option<(Packet<'_>, usize)>> {
    if input.len() < 4 {
        return Ok(None);
    }
    let len = usize::from(input[0]) | usize::from(input[1]) << 8 | usize::from(input[2]) << 16;
    if len == 0xFF_FF_FF {
        return Err(Error::fatal_protocol(
            "packets of 16 MiB or more are not supported",
        ));
    }
    let total = 4 + len;
    if input.len() < total {
        return Ok(None);
    }
    Ok(Some((
        Packet {
            sequence_id: input[3],
            payload: &input[4..total],
        },
        total,
    )))
}

/// Read a length-encoded integer; `None` is the NULL marker.
fn read_lenenc_int(data: &[u8]) -> Result<(Option<u64>, &[u8])> {
    let (first, rest) = read_u8(data)?;
    match first {
        0x00..=0xfa => Ok((Some(u64::from(first)), rest)),
        0xfb => Ok((None, rest)),
        0xfc => read_u16_le(rest).map(|(v, rest)| (Some(u64::from(v)), rest)),
        0xfd => {
            let (bytes, rest) = read_bytes(rest, 3)?;
            let v = u64::from(bytes[0]) | u64::from(bytes[1]) << 8 | u64::from(bytes[2]) << 16;
            Ok((Some(v), rest))
        }
        0xfe => read_u64_le(rest).map(|(v, rest)| (Some(v), rest)),
        0xff => Err(Error::fatal_protocol("invalid length-encoded integer")),
    }
}

/// Read length-encoded bytes; `None` is SQL NULL.
fn read_lenenc_bytes(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    match read_lenenc_int(data)? {
        (None, rest) => Ok((None, rest)),
        (Some(len), rest) => {
            let (bytes, rest) = read_bytes(rest, len as usize)?;
            Ok((Some(bytes), rest))
        }
    }
}

fn read_lenenc_str(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_lenenc_bytes(data)?;
    Ok((utf8(bytes.unwrap_or_default())?, rest))
}

fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfa => out.push(value as u8),
        0xfb..=0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn write_lenenc_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_lenenc_int(out, data.len() as u64);
    out.extend_from_slice(data);
}

/// Parse an ERR packet (payload starts with 0xff).
pub fn parse_err(payload: &[u8]) -> Result<ServerError> {
    let (_, rest) = read_u8(payload)?;
    let (code, rest) = read_u16_le(rest)?;
    // protocol 4.1: '#' + 5 byte SQLSTATE
    let (sqlstate, message) = match rest.split_first() {
        Some((b'#', tail)) => {
            let (state, message) = read_bytes(tail, 5)?;
            (Some(utf8(state)?.to_string()), message)
        }
        _ => (None, rest),
    };
    Ok(ServerError {
        severity: Some("ERROR".into()),
        code: sqlstate,
        vendor_code: Some(i32::from(code)),
        message: String::from_utf8_lossy(message).into_owned(),
        detail: None,
        hint: None,
    })
}

fn is_fatal_code(fields: &ServerError) -> bool {
    fields
        .vendor_code
        .and_then(|code| u16::try_from(code).ok())
        .is_some_and(|code| FATAL_ERROR_CODES.contains(&code))
}

/// Column definition with the flags needed to render binary values.
#[derive(Debug, Clone)]
struct Column {
    info: ColumnInfo,
    flags: u16,
}

fn parse_column_definition(payload: &[u8]) -> Result<Column> {
    // catalog, schema, table, org_table
    let mut data = payload;
    for _ in 0..4 {
        let (_, rest) = read_lenenc_bytes(data)?;
        data = rest;
    }
    let (name, rest) = read_lenenc_str(data)?;
    let (_, rest) = read_lenenc_bytes(rest)?;
    // length of fixed fields (0x0c), character set, column length
    let (_, rest) = read_lenenc_int(rest)?;
    let (_, rest) = read_bytes(rest, 6)?;
    let (type_id, rest) = read_u8(rest)?;
    let (flags, _) = read_u16_le(rest)?;
    Ok(Column {
        info: ColumnInfo::new(name, u32::from(type_id)),
        flags,
    })
}

/// OK packet: affected rows, last insert id, status flags.
fn parse_ok(payload: &[u8]) -> Result<(u64, u64, u16)> {
    let (_, rest) = read_u8(payload)?;
    let (affected, rest) = read_lenenc_int(rest)?;
    let (last_insert_id, rest) = read_lenenc_int(rest)?;
    let (status, _) = read_u16_le(rest)?;
    Ok((
        affected.unwrap_or_default(),
        last_insert_id.unwrap_or_default(),
        status,
    ))
}

fn eof_status(payload: &[u8]) -> u16 {
    // header, warnings, status
    match payload {
        [_, _, _, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    }
}

fn parse_text_row(payload: &[u8], count: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut values = Vec::with_capacity(count);
    let mut data = payload;
    for _ in 0..count {
        let (value, rest) = read_lenenc_bytes(data)?;
        values.push(value.map(<[u8]>::to_vec));
        data = rest;
    }
    Ok(values)
}

fn parse_binary_row(payload: &[u8], columns: &[Column]) -> Result<Vec<Option<Vec<u8>>>> {
    let (_, rest) = read_u8(payload)?;
    let (bitmap, mut data) = read_bytes(rest, (columns.len() + 7 + 2) / 8)?;
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(None);
            continue;
        }
        let (text, rest) = binary_to_text(data, column)?;
        values.push(Some(text));
        data = rest;
    }
    Ok(values)
}

/// Render one binary-protocol value in its text-protocol form.
fn binary_to_text<'a>(data: &'a [u8], column: &Column) -> Result<(Vec<u8>, &'a [u8])> {
    let unsigned = column.flags & UNSIGNED_FLAG != 0;
    let fixed = |len: usize| read_bytes(data, len);
    let (text, rest) = match column.info.type_id as u8 {
        field_type::TINY => {
            let (b, rest) = fixed(1)?;
            let text = if unsigned {
                b[0].to_string()
            } else {
                (b[0] as i8).to_string()
            };
            (text, rest)
        }
        field_type::SHORT | field_type::YEAR => {
            let (b, rest) = fixed(2)?;
            let v = u16::from_le_bytes([b[0], b[1]]);
            let text = if unsigned {
                v.to_string()
            } else {
                (v as i16).to_string()
            };
            (text, rest)
        }
        field_type::LONG | field_type::INT24 => {
            let (v, rest) = read_u32_le(data)?;
            let text = if unsigned {
                v.to_string()
            } else {
                (v as i32).to_string()
            };
            (text, rest)
        }
        field_type::LONGLONG => {
            let (v, rest) = read_u64_le(data)?;
            let text = if unsigned {
                v.to_string()
            } else {
                (v as i64).to_string()
            };
            (text, rest)
        }
        field_type::FLOAT => {
            let (v, rest) = read_u32_le(data)?;
            (f32::from_bits(v).to_string(), rest)
        }
        field_type::DOUBLE => {
            let (v, rest) = read_u64_le(data)?;
            (f64::from_bits(v).to_string(), rest)
        }
        field_type::NULL => (String::new(), data),
        field_type::DATE | field_type::DATETIME | field_type::TIMESTAMP => {
            let (len, rest) = read_u8(data)?;
            let (b, rest) = read_bytes(rest, usize::from(len))?;
            (format_datetime(b, column.info.type_id as u8 == field_type::DATE)?, rest)
        }
        field_type::TIME => {
            let (len, rest) = read_u8(data)?;
            let (b, rest) = read_bytes(rest, usize::from(len))?;
            (format_time(b)?, rest)
        }
        _ => {
            let (bytes, rest) = read_lenenc_bytes(data)?;
            return Ok((bytes.unwrap_or_default().to_vec(), rest));
        }
    };
    Ok((text.into_bytes(), rest))
}

fn format_datetime(b: &[u8], date_only: bool) -> Result<String> {
    let (year, month, day) = match b {
        [] => (0, 0, 0),
        [y0, y1, m, d, ..] => (u16::from_le_bytes([*y0, *y1]), *m, *d),
        _ => return Err(Error::fatal_protocol("malformed binary date")),
    };
    let date = format!("{:04}-{:02}-{:02}", year, month, day);
    if date_only {
        return Ok(date);
    }
    let (hour, minute, second) = match b {
        [_, _, _, _, h, mi, s, ..] => (*h, *mi, *s),
        _ => (0, 0, 0),
    };
    let mut text = format!("{} {:02}:{:02}:{:02}", date, hour, minute, second);
    if let [_, _, _, _, _, _, _, u0, u1, u2, u3] = b {
        let micros = u32::from_le_bytes([*u0, *u1, *u2, *u3]);
        text.push_str(&format!(".{:06}", micros));
    }
    Ok(text)
}

fn format_time(b: &[u8]) -> Result<String> {
    let (negative, days, hour, minute, second) = match b {
        [] => (false, 0, 0, 0, 0),
        [neg, d0, d1, d2, d3, h, m, s, ..] => (
            *neg == 1,
            u32::from_le_bytes([*d0, *d1, *d2, *d3]),
            *h,
            *m,
            *s,
        ),
        _ => return Err(Error::fatal_protocol("malformed binary time")),
    };
    let hours = days * 24 + u32::from(hour);
    let sign = if negative { "-" } else { "" };
    let mut text = format!("{}{:02}:{:02}:{:02}", sign, hours, minute, second);
    if let [_, _, _, _, _, _, _, _, u0, u1, u2, u3] = b {
        let micros = u32::from_le_bytes([*u0, *u1, *u2, *u3]);
        text.push_str(&format!(".{:06}", micros));
    }
    Ok(text)
}

#[derive(Debug)]
enum Expect {
    Query,
    Prepare { sql: Arc<str> },
    Execute,
    Batch { remaining: usize },
    Ping,
}

/// Where the decoder is inside one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// First packet of a result: OK, ERR, PREPARE_OK or a column count
    Head,
    /// Result set column definitions
    Columns { remaining: usize },
    ColumnsEof,
    Rows,
    /// Prepared statement parameter definitions
    Params { remaining: usize, columns: usize },
    ParamsEof { columns: usize },
    /// Prepared statement result column definitions
    StatementColumns { remaining: usize },
    StatementColumnsEof,
}

/// Decoder state for one MySQL command.
#[derive(Debug)]
pub struct MySqlResponse {
    expect: Expect,
    binary: bool,
    next_seq: u8,
    stage: Stage,
    columns: Vec<Column>,
    shared: Option<Columns>,
    current: QueryResult,
    /// Results of the execution in progress (several for multi-statement queries)
    results: Vec<QueryResult>,
    /// One chained result per finished execution
    executions: Vec<QueryResult>,
    statement_id: u32,
    param_types: Vec<u32>,
    error: Option<Error>,
}

impl MySqlResponse {
    fn new(expect: Expect, binary: bool) -> Self {
        Self {
            expect,
            binary,
            next_seq: 1,
            stage: Stage::Head,
            columns: Vec::new(),
            shared: None,
            current: QueryResult::default(),
            results: Vec::new(),
            executions: Vec::new(),
            statement_id: 0,
            param_types: Vec::new(),
            error: None,
        }
    }

    fn on_packet(&mut self, packet: Packet<'_>) -> Result<Option<Result<Response>>> {
        if packet.sequence_id != self.next_seq {
            return Err(Error::fatal_protocol(format!(
                "packet out of order: sequence id {}, expected {}",
                packet.sequence_id, self.next_seq
            )));
        }
        self.next_seq = self.next_seq.wrapping_add(1);

        if packet.header() == Some(ERR_HEADER)
            && matches!(self.stage, Stage::Head | Stage::Rows)
        {
            let fields = parse_err(packet.payload)?;
            if is_fatal_code(&fields) {
                return Err(Error::Server(fields));
            }
            self.error.get_or_insert(Error::Server(fields));
            return Ok(self.finish_execution());
        }

        match self.stage {
            Stage::Head => self.on_head(packet),
            Stage::Columns { remaining } => {
                self.columns.push(parse_column_definition(packet.payload)?);
                self.stage = if remaining > 1 {
                    Stage::Columns {
                        remaining: remaining - 1,
                    }
                } else {
                    Stage::ColumnsEof
                };
                Ok(None)
            }
            Stage::ColumnsEof => {
                expect_eof(packet)?;
                let infos: Vec<ColumnInfo> = self.columns.iter().map(|c| c.info.clone()).collect();
                self.shared = Some(Arc::from(infos));
                self.stage = Stage::Rows;
                Ok(None)
            }
            Stage::Rows => {
                if packet.is_eof() {
                    return Ok(self.end_result_set(eof_status(packet.payload)));
                }
                let columns = self
                    .shared
                    .as_ref()
                    .ok_or_else(|| Error::fatal_protocol("row before column definitions"))?;
                let values = if self.binary {
                    parse_binary_row(packet.payload, &self.columns)?
                } else {
                    parse_text_row(packet.payload, columns.len())?
                };
                self.current.rows.push(Row::new(Arc::clone(columns), values));
                Ok(None)
            }
            Stage::Params { remaining, columns } => {
                let param = parse_column_definition(packet.payload)?;
                self.param_types.push(param.info.type_id);
                self.stage = if remaining > 1 {
                    Stage::Params {
                        remaining: remaining - 1,
                        columns,
                    }
                } else {
                    Stage::ParamsEof { columns }
                };
                Ok(None)
            }
            Stage::ParamsEof { columns } => {
                expect_eof(packet)?;
                if columns > 0 {
                    self.stage = Stage::StatementColumns { remaining: columns };
                    Ok(None)
                } else {
                    Ok(Some(self.complete()))
                }
            }
            Stage::StatementColumns { remaining } => {
                self.columns.push(parse_column_definition(packet.payload)?);
                self.stage = if remaining > 1 {
                    Stage::StatementColumns {
                        remaining: remaining - 1,
                    }
                } else {
                    Stage::StatementColumnsEof
                };
                Ok(None)
            }
            Stage::StatementColumnsEof => {
                expect_eof(packet)?;
                Ok(Some(self.complete()))
            }
        }
    }

    fn on_head(&mut self, packet: Packet<'_>) -> Result<Option<Result<Response>>> {
        match packet.header() {
            Some(OK_HEADER) if matches!(self.expect, Expect::Prepare { .. }) => {
                let (_, rest) = read_u8(packet.payload)?;
                let (statement_id, rest) = read_u32_le(rest)?;
                let (columns, rest) = read_u16_le(rest)?;
                let (params, _) = read_u16_le(rest)?;
                self.statement_id = statement_id;
                let (params, columns) = (usize::from(params), usize::from(columns));
                self.stage = match (params, columns) {
                    (0, 0) => return Ok(Some(self.complete())),
                    (0, columns) => Stage::StatementColumns { remaining: columns },
                    (params, columns) => Stage::Params {
                        remaining: params,
                        columns,
                    },
                };
                Ok(None)
            }
            Some(OK_HEADER) => {
                let (affected, last_insert_id, status) = parse_ok(packet.payload)?;
                self.current.rows_affected = Some(affected);
                self.current.last_insert_id = (last_insert_id != 0).then_some(last_insert_id);
                Ok(self.end_result(status))
            }
            Some(LOCAL_INFILE_HEADER) => Err(Error::fatal_protocol(
                "LOAD DATA LOCAL INFILE is not supported",
            )),
            Some(_) => {
                let (count, _) = read_lenenc_int(packet.payload)?;
                let count = count
                    .filter(|&n| n > 0)
                    .ok_or_else(|| Error::fatal_protocol("invalid column count"))?;
                self.columns.clear();
                self.stage = Stage::Columns {
                    remaining: count as usize,
                };
                Ok(None)
            }
            None => Err(Error::fatal_protocol("empty packet")),
        }
    }

    fn end_result_set(&mut self, status: u16) -> Option<Result<Response>> {
        if let Some(columns) = self.shared.take() {
            self.current.columns = columns.to_vec();
        }
        self.end_result(status)
    }

    fn end_result(&mut self, status: u16) -> Option<Result<Response>> {
        self.results.push(std::mem::take(&mut self.current));
        if status & SERVER_MORE_RESULTS_EXISTS != 0 {
            self.stage = Stage::Head;
            return None;
        }
        self.finish_execution()
    }

    /// One server exchange is over. Batches continue with the next execute.
    fn finish_execution(&mut self) -> Option<Result<Response>> {
        let mut results = std::mem::take(&mut self.results).into_iter();
        let mut first = results.next().unwrap_or_default();
        for next in results {
            first.push_next(next);
        }
        self.executions.push(first);
        self.current = QueryResult::default();
        self.shared = None;
        self.stage = Stage::Head;

        if let Expect::Batch { remaining } = &mut self.expect {
            *remaining = remaining.saturating_sub(1);
            if *remaining > 0 {
                self.next_seq = 1;
                return None;
            }
        }
        Some(self.complete())
    }

    fn complete(&mut self) -> Result<Response> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        let mut executions = std::mem::take(&mut self.executions).into_iter();
        match &self.expect {
            Expect::Query | Expect::Execute => {
                Ok(Response::Rows(executions.next().unwrap_or_default()))
            }
            Expect::Batch { .. } => Ok(Response::Batch(executions.collect())),
            Expect::Ping => Ok(Response::Pong),
            Expect::Prepare { sql } => {
                let info = StatementInfo {
                    handle: StatementHandle::Id(self.statement_id),
                    param_types: std::mem::take(&mut self.param_types),
                    columns: self.columns.drain(..).map(|c| c.info).collect(),
                };
                Ok(Response::Prepared(PreparedStatement::new(
                    Arc::clone(sql),
                    Arc::new(info),
                )))
            }
        }
    }
}

fn expect_eof(packet: Packet<'_>) -> Result<()> {
    if packet.is_eof() {
        Ok(())
    } else {
        Err(Error::fatal_protocol("expected EOF packet"))
    }
}

/// MySQL codec.
#[derive(Debug)]
pub struct MySqlCodec {
    limits: Limits,
}

impl MySqlCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn encode(
        &mut self,
        request: &Request,
        statement: Option<&StatementInfo>,
        out: &mut Vec<u8>,
    ) -> Result<Encoded> {
        let state = match request {
            Request::SimpleQuery { sql } => {
                write_command(out, command::QUERY, sql.as_bytes())?;
                MySqlResponse::new(Expect::Query, false)
            }
            Request::Ping => {
                write_command(out, command::PING, &[])?;
                MySqlResponse::new(Expect::Ping, false)
            }
            Request::Prepare { sql } => {
                write_command(out, command::STMT_PREPARE, sql.as_bytes())?;
                MySqlResponse::new(Expect::Prepare { sql: Arc::clone(sql) }, false)
            }
            Request::Execute { params, .. } => {
                let info = required(statement)?;
                write_execute(out, info, params)?;
                MySqlResponse::new(Expect::Execute, true)
            }
            Request::Batch { params, .. } => {
                if params.is_empty() {
                    return Ok(Encoded::NoResponse(Response::Batch(Vec::new())));
                }
                let info = required(statement)?;
                for set in params {
                    write_execute(out, info, set)?;
                }
                MySqlResponse::new(
                    Expect::Batch {
                        remaining: params.len(),
                    },
                    true,
                )
            }
            Request::CloseStatement { .. } => {
                let id = statement_id(required(statement)?)?;
                write_command(out, command::STMT_CLOSE, &id.to_le_bytes())?;
                // the server never answers COM_STMT_CLOSE
                return Ok(Encoded::NoResponse(Response::Closed));
            }
        };
        Ok(Encoded::Awaiting(super::ResponseState::MySql(state)))
    }

    pub fn decode(&mut self, state: &mut MySqlResponse, input: &[u8]) -> Result<(usize, Decoded)> {
        let mut consumed = 0;
        while let Some((packet, len)) = split_packet(&input[consumed..])? {
            consumed += len;
            if let Some(result) = state.on_packet(packet)? {
                return Ok((consumed, Decoded::Complete(result)));
            }
        }
        Ok((consumed, Decoded::Partial))
    }

    /// The server only speaks unprompted to say goodbye (ERR, then close).
    pub fn decode_unsolicited(&mut self, input: &[u8]) -> Result<usize> {
        match split_packet(input)? {
            None => Ok(0),
            Some((packet, _)) if packet.header() == Some(ERR_HEADER) => {
                Err(Error::Server(parse_err(packet.payload)?))
            }
            Some(_) => Err(Error::fatal_protocol("unsolicited packet")),
        }
    }

    pub fn encode_terminate(&self, out: &mut Vec<u8>) -> Result<()> {
        write_command(out, command::QUIT, &[])
    }
}

fn required(statement: Option<&StatementInfo>) -> Result<&StatementInfo> {
    statement.ok_or_else(|| Error::InvalidUsage("statement is not prepared on this session".into()))
}

fn statement_id(info: &StatementInfo) -> Result<u32> {
    match &info.handle {
        StatementHandle::Id(id) => Ok(*id),
        other => Err(Error::InvalidUsage(format!(
            "{} is not a MySQL statement",
            other
        ))),
    }
}

fn write_command(out: &mut Vec<u8>, command: u8, body: &[u8]) -> Result<()> {
    let mut packet = FrameBuilder::new(out, LengthField::U24LEPayload);
    packet.write_u8(0); // sequence id
    packet.write_u8(command);
    packet.write_bytes(body);
    packet.finish()
}

/// COM_STMT_EXECUTE with every parameter bound in binary form.
fn write_execute(out: &mut Vec<u8>, info: &StatementInfo, params: &[Value]) -> Result<()> {
    if params.len() != info.param_count() {
        return Err(Error::InvalidUsage(format!(
            "statement expects {} parameters, got {}",
            info.param_count(),
            params.len()
        )));
    }
    let id = statement_id(info)?;
    let mut packet = FrameBuilder::new(out, LengthField::U24LEPayload);
    packet.write_u8(0); // sequence id
    packet.write_u8(command::STMT_EXECUTE);
    packet.write_bytes(&id.to_le_bytes());
    packet.write_u8(0); // CURSOR_TYPE_NO_CURSOR
    packet.write_bytes(&1u32.to_le_bytes()); // iteration count

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        packet.write_bytes(&null_bitmap);
        packet.write_u8(1); // new params bound
        for param in params {
            packet.write_u8(param_type(param));
            packet.write_u8(0);
        }
        for param in params {
            write_binary_param(packet.buf(), param);
        }
    }
    packet.finish()
}

fn param_type(value: &Value) -> u8 {
    match value {
        Value::Null => field_type::NULL,
        Value::Bool(_) => field_type::TINY,
        Value::Int(_) => field_type::LONGLONG,
        Value::Float(_) => field_type::DOUBLE,
        Value::Text(_) => field_type::VAR_STRING,
        Value::Bytes(_) => field_type::BLOB,
    }
}

fn write_binary_param(out: &mut Vec<u8>, value: &Value) {
    match value {
        // carried by the NULL bitmap
        Value::Null => {}
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
        Value::Text(s) => write_lenenc_bytes(out, s.as_bytes()),
        Value::Bytes(b) => write_lenenc_bytes(out, b),
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::protocol::ResponseState;

    fn awaiting(encoded: Encoded) -> MySqlResponse {
        match encoded {
            Encoded::Awaiting(ResponseState::MySql(state)) => state,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn decode_all(codec: &mut MySqlCodec, state: &mut MySqlResponse, bytes: &[u8]) -> Result<Response> {
        let (consumed, decoded) = codec.decode(state, bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        match decoded {
            Decoded::Complete(result) => result,
            Decoded::Partial => panic!("incomplete"),
        }
    }

    #[test]
    fn test_query_packet() {
        let mut out = Vec::new();
        MySqlCodec::new(Limits::default())
            .encode(&Request::SimpleQuery { sql: "SELECT 1".into() }, None, &mut out)
            .unwrap();
        assert_eq!(&out[..5], &[9, 0, 0, 0, command::QUERY]);
        assert_eq!(&out[5..], b"SELECT 1");
    }

    #[test]
    fn test_text_result_split_delivery() {
        let mut codec = MySqlCodec::new(Limits::default());
        let mut state = MySqlResponse::new(Expect::Query, false);
        let bytes = text_result("name", &["alice", "bob"]);
        let mut buffer = Vec::new();
        let mut result = None;
        for chunk in bytes.chunks(3) {
            buffer.extend_from_slice(chunk);
            let (consumed, decoded) = codec.decode(&mut state, &buffer).unwrap();
            buffer.drain(..consumed);
            if let Decoded::Complete(r) = decoded {
                result = Some(r);
            }
        }
        let rows = result.unwrap().unwrap().into_rows().unwrap();
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[1].get::<&str>(0).unwrap(), "bob");
        assert_eq!(rows.columns[0].name, "name");
    }

    #[test]
    fn test_ok_packet() {
        let mut codec = MySqlCodec::new(Limits::default());
        let mut state = MySqlResponse::new(Expect::Query, false);
        let result = decode_all(&mut codec, &mut state, &ok(1, 3, 42))
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(result.rows_affected, Some(3));
        assert_eq!(result.last_insert_id, Some(42));
    }

    #[test]
    fn test_error_is_per_command() {
        let mut codec = MySqlCodec::new(Limits::default());
        let mut state = MySqlResponse::new(Expect::Query, false);
        let err = decode_all(&mut codec, &mut state, &err(1, 1146, "42S02", "no such table"))
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some("42S02"));
        assert!(!err.is_connection_broken());
    }

    #[test]
    fn test_fatal_error_code() {
        let mut codec = MySqlCodec::new(Limits::default());
        let mut state = MySqlResponse::new(Expect::Query, false);
        assert!(codec
            .decode(&mut state, &err(1, 1927, "70100", "killed"))
            .is_err());
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        let mut codec = MySqlCodec::new(Limits::default());
        let mut state = MySqlResponse::new(Expect::Ping, false);
        let err = codec.decode(&mut state, &ok(2, 0, 0)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_prepare_and_binary_execute() {
        let mut codec = MySqlCodec::new(Limits::default());
        let sql: Arc<str> = Arc::from("SELECT ?");
        let mut out = Vec::new();
        let mut state = awaiting(
            codec
                .encode(&Request::Prepare { sql: Arc::clone(&sql) }, None, &mut out)
                .unwrap(),
        );
        let stmt = decode_all(&mut codec, &mut state, &prepare_ok(7, 1, 1))
            .unwrap()
            .into_prepared()
            .unwrap();
        assert_eq!(stmt.handle(), &StatementHandle::Id(7));
        assert_eq!(stmt.param_types().len(), 1);

        out.clear();
        let request = Request::Execute {
            sql,
            params: vec![Value::Int(-5)],
        };
        let mut state = awaiting(codec.encode(&request, Some(stmt.info()), &mut out).unwrap());
        assert_eq!(out[4], command::STMT_EXECUTE);
        assert_eq!(&out[5..9], &7u32.to_le_bytes());

        // binary result: one LONGLONG column holding -5, then a NULL row
        let mut bytes = packet(1, &[1]);
        bytes.extend(column(2, "v", field_type::LONGLONG));
        bytes.extend(eof(3));
        let mut row = vec![0x00, 0x00];
        row.extend_from_slice(&(-5i64).to_le_bytes());
        bytes.extend(packet(4, &row));
        bytes.extend(packet(5, &[0x00, 0b100]));
        bytes.extend(eof(6));
        let result = decode_all(&mut codec, &mut state, &bytes)
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(result.rows[0].get::<i64>(0).unwrap(), -5);
        assert_eq!(result.rows[1].get::<Option<i64>>(0).unwrap(), None);
    }

    #[test]
    fn test_batch_continues_after_error() {
        let mut codec = MySqlCodec::new(Limits::default());
        let mut state = MySqlResponse::new(Expect::Batch { remaining: 3 }, true);
        let mut bytes = ok(1, 1, 0);
        bytes.extend(err(1, 1062, "23000", "duplicate"));
        bytes.extend(ok(1, 1, 0));
        // all three answers are consumed even though the second failed
        let err = decode_all(&mut codec, &mut state, &bytes).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23000"));
    }

    #[test]
    fn test_close_has_no_response() {
        let mut codec = MySqlCodec::new(Limits::default());
        let info = StatementInfo {
            handle: StatementHandle::Id(3),
            param_types: vec![],
            columns: vec![],
        };
        let mut out = Vec::new();
        let encoded = codec
            .encode(
                &Request::CloseStatement {
                    sql: Arc::from("SELECT 1"),
                },
                Some(&info),
                &mut out,
            )
            .unwrap();
        assert!(matches!(encoded, Encoded::NoResponse(Response::Closed)));
        assert_eq!(out, vec![5, 0, 0, 0, command::STMT_CLOSE, 3, 0, 0, 0]);
    }

    #[test]
    fn test_binary_temporal_rendering() {
        assert_eq!(
            format_datetime(&[0xe8, 0x07, 2, 29, 13, 5, 9], false).unwrap(),
            "2024-02-29 13:05:09"
        );
        assert_eq!(format_datetime(&[0xe8, 0x07, 2, 29], true).unwrap(), "2024-02-29");
        assert_eq!(format_time(&[1, 1, 0, 0, 0, 2, 3, 4]).unwrap(), "-26:03:04");
    }
}
