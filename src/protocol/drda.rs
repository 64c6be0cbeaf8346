//! DB2 Distributed Relational Database Architecture (DRDA).
//!
//! Each request is a chain of DSS frames carrying one DDM object each; the
//! server answers with a reply chain that ends at the first DSS without the
//! chain bit. Statements live in package sections; section 0 is used for
//! immediate execution.
//!
//! Row and parameter data use a compact layout of length-prefixed character
//! data instead of FD:OCA descriptors:
//!
//! - `SQLCARD`: null indicator (0xff = no SQLCA), SQLCODE, SQLSTATE, SQLERRPROC,
//!   0x00, SQLERRD[6], SQLWARN, RDB name and message (u16 length prefixed)
//! - `SQLDARD`: SQLCA, then u16 column count and (type, name) per column, then
//!   u16 parameter count and a type per parameter
//! - `QRYDTA`, `SQLDTA`: values as i32 length (-1 = NULL) followed by text

use std::sync::Arc;

use crate::command::{Request, Response};
use crate::error::{Error, Result, ServerError};
use crate::row::{ColumnInfo, Columns, QueryResult, Row};
use crate::statement::{PreparedStatement, StatementHandle, StatementInfo};
use crate::value::Value;

use super::codec::{
    FrameBuilder, LengthField, read_bytes, read_i32, read_u8, read_u16, utf8,
};
use super::{Decoded, Encoded, Limits};

/// DDM code points.
pub mod codepoint {
    // commands
    pub const EXCSQLIMM: u16 = 0x200a;
    pub const EXCSQLSTT: u16 = 0x200b;
    pub const OPNQRY: u16 = 0x200c;
    pub const PRPSQLSTT: u16 = 0x200d;
    // command parameters and objects
    pub const PKGNAMCSN: u16 = 0x2113;
    pub const SQLDTA: u16 = 0x2412;
    pub const SQLSTT: u16 = 0x2414;
    // reply objects
    pub const SQLCARD: u16 = 0x2408;
    pub const SQLDARD: u16 = 0x2411;
    pub const QRYDSC: u16 = 0x241a;
    pub const QRYDTA: u16 = 0x241b;
    // reply messages
    pub const OPNQRYRM: u16 = 0x2205;
    pub const ENDQRYRM: u16 = 0x220b;
    pub const ENDUOWRM: u16 = 0x220c;
    pub const OPNQFLRM: u16 = 0x2212;
    pub const RDBUPDRM: u16 = 0x2218;
    pub const AGNPRMRM: u16 = 0x1232;
    pub const PRCCNVRM: u16 = 0x1245;
    pub const SYNTAXRM: u16 = 0x124c;
    pub const VALNSPRM: u16 = 0x1252;
    pub const CMDCHKRM: u16 = 0x1254;
}

const DSS_MAGIC: u8 = 0xd0;
const DSS_HEADER_LEN: usize = 6;
const DDM_HEADER_LEN: usize = 4;

const DSS_CHAINED: u8 = 0x40;
const DSS_CONTINUED: u16 = 0x8000;

/// DSS types.
const RQSDSS: u8 = 0x01;
const OBJDSS: u8 = 0x03;

/// SQLCODEs after which the connection is gone.
const FATAL_SQLCODES: &[i32] = &[
    -30080, // communication error
    -30081, // communication error detected
    -1224,  // database manager not able to accept new requests / terminated
];

/// SQLCODE for "no more rows".
const SQLCODE_NO_DATA: i32 = 100;

/// One reply DSS and the DDM object it carries.
#[derive(Debug, Clone, Copy)]
pub struct Dss<'a> {
    pub chained: bool,
    pub correlation_id: u16,
    pub codepoint: u16,
    pub data: &'a [u8],
}

/// Split one DSS off the front of `input`.
pub fn split_dss(input: &[u8]) -> Result<Option<(Dss<'_>, usize)>> {
    if input.len() < DSS_HEADER_LEN {
        return Ok(None);
    }
    let (len, rest) = read_u16(input)?;
    if len & DSS_CONTINUED != 0 {
        return Err(Error::fatal_protocol("continued DSS frames are not supported"));
    }
    let (magic, rest) = read_u8(rest)?;
    if magic != DSS_MAGIC {
        return Err(Error::fatal_protocol(format!("bad DSS magic 0x{:02x}", magic)));
    }
    let len = usize::from(len);
    if len < DSS_HEADER_LEN + DDM_HEADER_LEN {
        return Err(Error::fatal_protocol(format!("invalid DSS length {}", len)));
    }
    if input.len() < len {
        return Ok(None);
    }
    let (format, rest) = read_u8(rest)?;
    let (correlation_id, rest) = read_u16(rest)?;
    let (ddm_len, rest) = read_u16(rest)?;
    let (codepoint, rest) = read_u16(rest)?;
    if usize::from(ddm_len) != len - DSS_HEADER_LEN {
        return Err(Error::fatal_protocol(format!(
            "DDM length {} does not fill DSS of {} bytes",
            ddm_len, len
        )));
    }
    let data = &rest[..len - DSS_HEADER_LEN - DDM_HEADER_LEN];
    Ok(Some((
        Dss {
            chained: format & DSS_CHAINED != 0,
            correlation_id,
            codepoint,
            data,
        },
        len,
    )))
}

/// Parse an SQLCA. `None` means the server sent a null SQLCA (success).
fn parse_sqlca(data: &[u8]) -> Result<(Option<Sqlca>, &[u8])> {
    let (indicator, rest) = read_u8(data)?;
    if indicator == 0xff {
        return Ok((None, rest));
    }
    let (sqlcode, rest) = read_i32(rest)?;
    let (sqlstate, rest) = read_bytes(rest, 5)?;
    let (_sqlerrproc, rest) = read_bytes(rest, 8)?;
    let (_, mut rest) = read_u8(rest)?;
    let mut sqlerrd = [0i32; 6];
    for slot in &mut sqlerrd {
        let (v, tail) = read_i32(rest)?;
        *slot = v;
        rest = tail;
    }
    let (_sqlwarn, rest) = read_bytes(rest, 11)?;
    let (_rdbname, rest) = read_u16_prefixed(rest)?;
    let (message, rest) = read_u16_prefixed(rest)?;
    Ok((
        Some(Sqlca {
            sqlcode,
            sqlstate: utf8(sqlstate)?.to_string(),
            sqlerrd,
            message: utf8(message)?.to_string(),
        }),
        rest,
    ))
}

fn read_u16_prefixed(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_u16(data)?;
    read_bytes(rest, usize::from(len))
}

#[derive(Debug, Clone)]
struct Sqlca {
    sqlcode: i32,
    sqlstate: String,
    sqlerrd: [i32; 6],
    message: String,
}

impl Sqlca {
    fn is_error(&self) -> bool {
        self.sqlcode < 0
    }

    fn rows_affected(&self) -> Option<u64> {
        u64::try_from(self.sqlerrd[2]).ok()
    }

    fn into_error(self) -> Error {
        let fatal = is_fatal_sqlcode(self.sqlcode);
        Error::Server(ServerError {
            severity: Some(if fatal { "FATAL" } else { "ERROR" }.into()),
            code: Some(self.sqlstate),
            vendor_code: Some(self.sqlcode),
            message: self.message,
            detail: None,
            hint: None,
        })
    }
}

fn is_fatal_sqlcode(sqlcode: i32) -> bool {
    FATAL_SQLCODES.contains(&sqlcode)
}

/// Column and parameter descriptors from an SQLDARD.
fn parse_sqldard(data: &[u8]) -> Result<(Option<Sqlca>, Vec<ColumnInfo>, Vec<u32>)> {
    let (sqlca, rest) = parse_sqlca(data)?;
    let (count, mut rest) = read_u16(rest)?;
    let mut columns = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let (type_id, tail) = read_u16(rest)?;
        let (name, tail) = read_u16_prefixed(tail)?;
        columns.push(ColumnInfo::new(utf8(name)?, u32::from(type_id)));
        rest = tail;
    }
    let (count, mut rest) = read_u16(rest)?;
    let mut params = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let (type_id, tail) = read_u16(rest)?;
        params.push(u32::from(type_id));
        rest = tail;
    }
    Ok((sqlca, columns, params))
}

fn parse_qrydta(data: &[u8], columns: &Columns) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let mut values = Vec::with_capacity(columns.len());
        for _ in 0..columns.len() {
            let (len, tail) = read_i32(rest)?;
            if len < 0 {
                values.push(None);
                rest = tail;
            } else {
                let (value, tail) = read_bytes(tail, len as usize)?;
                values.push(Some(value.to_vec()));
                rest = tail;
            }
        }
        if columns.is_empty() {
            return Err(Error::fatal_protocol("QRYDTA for a result without columns"));
        }
        rows.push(Row::new(Arc::clone(columns), values));
    }
    Ok(rows)
}

/// Statements answered through a query (OPNQRY) rather than EXCSQLIMM.
fn is_query(sql: &str) -> bool {
    let keyword = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    ["SELECT", "WITH", "VALUES"]
        .iter()
        .any(|k| k.eq_ignore_ascii_case(keyword))
}

#[derive(Debug)]
enum Expect {
    Query,
    Prepare { sql: Arc<str>, section: u16 },
    Execute,
    Batch,
    Ping,
}

/// Decoder state for one DRDA command.
#[derive(Debug)]
pub struct DrdaResponse {
    expect: Expect,
    columns: Option<Columns>,
    param_types: Vec<u32>,
    /// Between OPNQRYRM and ENDQRYRM
    in_query: bool,
    /// The SQLCARD that follows ENDQRYRM belongs to the finished query
    query_done: bool,
    current: QueryResult,
    results: Vec<QueryResult>,
    error: Option<Error>,
}

impl DrdaResponse {
    fn new(expect: Expect, columns: Option<Columns>) -> Self {
        Self {
            expect,
            columns,
            param_types: Vec::new(),
            in_query: false,
            query_done: false,
            current: QueryResult::default(),
            results: Vec::new(),
            error: None,
        }
    }

    fn record(&mut self, sqlca: Sqlca) -> Result<()> {
        if is_fatal_sqlcode(sqlca.sqlcode) {
            return Err(sqlca.into_error());
        }
        self.error.get_or_insert(sqlca.into_error());
        Ok(())
    }

    fn on_dss(&mut self, dss: Dss<'_>) -> Result<Option<Result<Response>>> {
        match dss.codepoint {
            codepoint::SQLDARD => {
                let (sqlca, columns, params) = parse_sqldard(dss.data)?;
                match sqlca {
                    Some(sqlca) if sqlca.is_error() => self.record(sqlca)?,
                    _ => {
                        self.columns = Some(Arc::from(columns));
                        self.param_types = params;
                    }
                }
            }
            codepoint::OPNQRYRM => {
                self.in_query = true;
                self.query_done = false;
                self.current = QueryResult::default();
            }
            codepoint::QRYDSC | codepoint::RDBUPDRM | codepoint::OPNQFLRM | codepoint::ENDUOWRM => {}
            codepoint::QRYDTA => {
                if !self.in_query {
                    return Err(Error::fatal_protocol("QRYDTA outside of an open query"));
                }
                let columns = self
                    .columns
                    .as_ref()
                    .ok_or_else(|| Error::fatal_protocol("QRYDTA without column descriptors"))?;
                let rows = parse_qrydta(dss.data, columns)?;
                self.current.rows.extend(rows);
            }
            codepoint::ENDQRYRM => {
                let mut result = std::mem::take(&mut self.current);
                if let Some(columns) = &self.columns {
                    result.columns = columns.to_vec();
                }
                self.results.push(result);
                self.in_query = false;
                self.query_done = true;
            }
            codepoint::SQLCARD => {
                let (sqlca, _) = parse_sqlca(dss.data)?;
                match sqlca {
                    Some(sqlca) if sqlca.is_error() => self.record(sqlca)?,
                    _ if self.query_done => self.query_done = false,
                    sqlca => {
                        let rows_affected = sqlca
                            .filter(|s| s.sqlcode != SQLCODE_NO_DATA)
                            .and_then(|s| s.rows_affected());
                        self.results.push(QueryResult {
                            rows_affected,
                            ..Default::default()
                        });
                    }
                }
            }
            codepoint::PRCCNVRM
            | codepoint::SYNTAXRM
            | codepoint::CMDCHKRM
            | codepoint::AGNPRMRM
            | codepoint::VALNSPRM => {
                return Err(Error::fatal_protocol(format!(
                    "server rejected the request: reply message 0x{:04x}",
                    dss.codepoint
                )));
            }
            other => {
                return Err(Error::fatal_protocol(format!(
                    "unexpected reply object 0x{:04x}",
                    other
                )));
            }
        }

        if dss.chained {
            Ok(None)
        } else {
            Ok(Some(self.complete()))
        }
    }

    fn complete(&mut self) -> Result<Response> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        let mut results = std::mem::take(&mut self.results).into_iter();
        match &self.expect {
            Expect::Query | Expect::Execute => {
                Ok(Response::Rows(results.next().unwrap_or_default()))
            }
            Expect::Batch => Ok(Response::Batch(results.collect())),
            Expect::Ping => Ok(Response::Pong),
            Expect::Prepare { sql, section } => {
                let info = StatementInfo {
                    handle: StatementHandle::Section(*section),
                    param_types: std::mem::take(&mut self.param_types),
                    columns: self.columns.as_deref().map(<[_]>::to_vec).unwrap_or_default(),
                };
                Ok(Response::Prepared(PreparedStatement::new(
                    Arc::clone(sql),
                    Arc::new(info),
                )))
            }
        }
    }
}

/// DRDA codec. Owns the section and correlation counters of its session.
#[derive(Debug)]
pub struct DrdaCodec {
    limits: Limits,
    next_section: u16,
    next_correlation: u16,
}

impl DrdaCodec {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            next_section: 1,
            next_correlation: 1,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn allocate_section(&mut self) -> Result<u16> {
        let section = self.next_section;
        self.next_section = section
            .checked_add(1)
            .ok_or_else(|| Error::Unsupported("package sections exhausted".into()))?;
        Ok(section)
    }

    fn correlation(&mut self) -> u16 {
        let id = self.next_correlation;
        self.next_correlation = self.next_correlation.wrapping_add(1).max(1);
        id
    }

    pub fn encode(
        &mut self,
        request: &Request,
        statement: Option<&StatementInfo>,
        out: &mut Vec<u8>,
    ) -> Result<Encoded> {
        let state = match request {
            Request::SimpleQuery { sql } => {
                self.write_immediate(out, sql, false)?;
                DrdaResponse::new(Expect::Query, None)
            }
            Request::Ping => {
                self.write_immediate(out, "VALUES 1", false)?;
                DrdaResponse::new(Expect::Ping, None)
            }
            Request::Prepare { sql } => {
                let section = self.allocate_section()?;
                let id = self.correlation();
                write_dss(out, RQSDSS, true, id, codepoint::PRPSQLSTT, &pkgnamcsn(section))?;
                write_dss(out, OBJDSS, false, id, codepoint::SQLSTT, sql.as_bytes())?;
                DrdaResponse::new(
                    Expect::Prepare {
                        sql: Arc::clone(sql),
                        section,
                    },
                    None,
                )
            }
            Request::Execute { params, .. } => {
                let info = required(statement)?;
                self.write_execute(out, info, params, false)?;
                DrdaResponse::new(Expect::Execute, Some(Arc::from(info.columns.as_slice())))
            }
            Request::Batch { params, .. } => {
                if params.is_empty() {
                    return Ok(Encoded::NoResponse(Response::Batch(Vec::new())));
                }
                let info = required(statement)?;
                for (i, set) in params.iter().enumerate() {
                    self.write_execute(out, info, set, i + 1 < params.len())?;
                }
                DrdaResponse::new(Expect::Batch, Some(Arc::from(info.columns.as_slice())))
            }
            Request::CloseStatement { .. } => {
                // sections are reused by the package; nothing to tell the server
                return Ok(Encoded::NoResponse(Response::Closed));
            }
        };
        Ok(Encoded::Awaiting(super::ResponseState::Drda(state)))
    }

    /// Section 0: prepare + open for queries, EXCSQLIMM for everything else.
    fn write_immediate(&mut self, out: &mut Vec<u8>, sql: &str, chain_after: bool) -> Result<()> {
        let id = self.correlation();
        if is_query(sql) {
            write_dss(out, RQSDSS, true, id, codepoint::PRPSQLSTT, &pkgnamcsn(0))?;
            write_dss(out, OBJDSS, true, id, codepoint::SQLSTT, sql.as_bytes())?;
            let id = self.correlation();
            write_dss(out, RQSDSS, chain_after, id, codepoint::OPNQRY, &pkgnamcsn(0))
        } else {
            write_dss(out, RQSDSS, true, id, codepoint::EXCSQLIMM, &pkgnamcsn(0))?;
            write_dss(out, OBJDSS, chain_after, id, codepoint::SQLSTT, sql.as_bytes())
        }
    }

    fn write_execute(
        &mut self,
        out: &mut Vec<u8>,
        info: &StatementInfo,
        params: &[Value],
        chain_after: bool,
    ) -> Result<()> {
        let section = match &info.handle {
            StatementHandle::Section(section) => *section,
            other => {
                return Err(Error::InvalidUsage(format!(
                    "{} is not a DRDA statement",
                    other
                )));
            }
        };
        let command = if info.columns.is_empty() {
            codepoint::EXCSQLSTT
        } else {
            codepoint::OPNQRY
        };
        let id = self.correlation();
        if params.is_empty() {
            return write_dss(out, RQSDSS, chain_after, id, command, &pkgnamcsn(section));
        }
        write_dss(out, RQSDSS, true, id, command, &pkgnamcsn(section))?;
        write_dss(out, OBJDSS, chain_after, id, codepoint::SQLDTA, &sqldta(params)?)
    }

    pub fn decode(&mut self, state: &mut DrdaResponse, input: &[u8]) -> Result<(usize, Decoded)> {
        let mut consumed = 0;
        while let Some((dss, len)) = split_dss(&input[consumed..])? {
            consumed += len;
            if let Some(result) = state.on_dss(dss)? {
                return Ok((consumed, Decoded::Complete(result)));
            }
        }
        Ok((consumed, Decoded::Partial))
    }

    pub fn decode_unsolicited(&mut self, input: &[u8]) -> Result<usize> {
        match split_dss(input)? {
            None => Ok(0),
            Some((dss, _)) => Err(Error::fatal_protocol(format!(
                "unsolicited reply object 0x{:04x}",
                dss.codepoint
            ))),
        }
    }

    /// DRDA has no goodbye frame; the transport is simply closed.
    pub fn encode_terminate(&self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

fn required(statement: Option<&StatementInfo>) -> Result<&StatementInfo> {
    statement.ok_or_else(|| Error::InvalidUsage("statement is not prepared on this session".into()))
}

/// PKGNAMCSN parameter naming a section of the client package.
fn pkgnamcsn(section: u16) -> Vec<u8> {
    let mut param = Vec::with_capacity(6);
    param.extend_from_slice(&6u16.to_be_bytes());
    param.extend_from_slice(&codepoint::PKGNAMCSN.to_be_bytes());
    param.extend_from_slice(&section.to_be_bytes());
    param
}

fn sqldta(params: &[Value]) -> Result<Vec<u8>> {
    let count = u16::try_from(params.len())
        .map_err(|_| Error::InvalidUsage(format!("too many parameters: {}", params.len())))?;
    let mut data = count.to_be_bytes().to_vec();
    for param in params {
        match param.to_text() {
            None => data.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(text) => {
                data.extend_from_slice(&(text.len() as i32).to_be_bytes());
                data.extend_from_slice(&text);
            }
        }
    }
    Ok(data)
}

fn write_dss(
    out: &mut Vec<u8>,
    dss_type: u8,
    chained: bool,
    correlation_id: u16,
    codepoint: u16,
    data: &[u8],
) -> Result<()> {
    let mut dss = FrameBuilder::new(out, LengthField::U16BEInclusive);
    dss.write_u8(DSS_MAGIC);
    dss.write_u8(dss_type | if chained { DSS_CHAINED } else { 0 });
    dss.write_u16(correlation_id);
    // DDM length is checked through the enclosing DSS length
    dss.write_u16((DDM_HEADER_LEN + data.len()) as u16);
    dss.write_u16(codepoint);
    dss.write_bytes(data);
    dss.finish()
}
