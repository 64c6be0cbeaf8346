//! Connection startup.
//!
//! A session is handed a [`Handshake`] while it is Connecting. The handshake
//! owns the bytes on the wire until it reports completion; commands submitted
//! meanwhile wait in the session backlog.

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::codec::{FrameBuilder, LengthField, read_bytes, read_cstr, read_i32, read_u8};
use crate::protocol::postgres::{msg_type, parse_error_fields, split_message};

/// Startup/authentication exchange run before a session accepts commands.
pub trait Handshake: Send {
    /// Write the client's opening message, if any.
    fn start(&mut self, out: &mut Vec<u8>) -> Result<()>;

    /// Feed server bytes.
    ///
    /// Returns the number of bytes consumed and whether the session is ready.
    /// Bytes past the end of the handshake must not be consumed.
    fn step(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(usize, bool)>;

    /// Key for cancelling work on this session from a side connection.
    fn cancel_key(&self) -> Option<CancelKey> {
        None
    }
}

/// Backend process id and secret sent by a PostgreSQL server at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelKey {
    pub process_id: u32,
    pub secret_key: u32,
}

impl CancelKey {
    /// Write the 16-byte CancelRequest packet.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&16i32.to_be_bytes());
        out.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        out.extend_from_slice(&self.process_id.to_be_bytes());
        out.extend_from_slice(&self.secret_key.to_be_bytes());
    }
}

/// Handshake for transports that are already authenticated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshake;

impl Handshake for NoHandshake {
    fn start(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn step(&mut self, _input: &[u8], _out: &mut Vec<u8>) -> Result<(usize, bool)> {
        Ok((0, true))
    }
}

const PROTOCOL_VERSION_3_0: i32 = 196608;
const CANCEL_REQUEST_CODE: i32 = 80877102;
const PASSWORD_MESSAGE: u8 = b'p';

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgStage {
    Initial,
    Authenticating,
    WaitingReady,
    Ready,
}

/// PostgreSQL v3 startup with trust, cleartext or MD5 password authentication.
#[derive(Debug)]
pub struct PgStartup {
    stage: PgStage,
    user: String,
    password: Option<String>,
    params: Vec<(String, String)>,
    backend_key: Option<CancelKey>,
}

impl PgStartup {
    pub fn new(opts: &Opts) -> Self {
        let mut params = vec![
            ("user".to_string(), opts.user.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(db) = &opts.database {
            params.push(("database".to_string(), db.clone()));
        }
        if let Some(app) = &opts.application_name {
            params.push(("application_name".to_string(), app.clone()));
        }
        params.extend(opts.params.iter().cloned());
        Self {
            stage: PgStage::Initial,
            user: opts.user.clone(),
            password: opts.password.clone(),
            params,
            backend_key: None,
        }
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn on_authentication(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let (code, rest) = read_i32(payload)?;
        match code {
            AUTH_OK => {
                self.stage = PgStage::WaitingReady;
            }
            AUTH_CLEARTEXT => {
                let password = self.password()?.to_string();
                write_password(out, &password)?;
            }
            AUTH_MD5 => {
                let (salt, _) = read_bytes(rest, 4)?;
                let hashed = md5_password(&self.user, self.password()?, salt);
                write_password(out, &hashed)?;
            }
            AUTH_SASL => {
                return Err(Error::Unsupported(
                    "SASL authentication (use a pre-authenticated transport)".into(),
                ));
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "authentication method {}",
                    other
                )));
            }
        }
        Ok(())
    }
}

impl Handshake for PgStartup {
    fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut msg = FrameBuilder::new(out, LengthField::I32BEInclusive);
        msg.write_i32(PROTOCOL_VERSION_3_0);
        for (name, value) in &self.params {
            msg.write_cstr(name);
            msg.write_cstr(value);
        }
        msg.write_u8(0);
        msg.finish()?;
        self.stage = PgStage::Authenticating;
        Ok(())
    }

    fn step(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(usize, bool)> {
        let mut consumed = 0;
        while self.stage != PgStage::Ready {
            let Some((msg, len)) = split_message(&input[consumed..])? else {
                break;
            };
            consumed += len;
            match msg.type_byte {
                msg_type::ERROR_RESPONSE => {
                    let fields = parse_error_fields(msg.payload)?;
                    // class 28: invalid authorization specification
                    if fields.code.as_deref().is_some_and(|c| c.starts_with("28")) {
                        return Err(Error::Auth(fields.message));
                    }
                    return Err(Error::Server(fields));
                }
                msg_type::AUTHENTICATION if self.stage == PgStage::Authenticating => {
                    self.on_authentication(msg.payload, out)?;
                }
                msg_type::PARAMETER_STATUS => {
                    let (name, rest) = read_cstr(msg.payload)?;
                    let (value, _) = read_cstr(rest)?;
                    tracing::trace!(param = %name, value = %value, "server parameter");
                }
                msg_type::BACKEND_KEY_DATA => {
                    let (pid, rest) = read_i32(msg.payload)?;
                    let (secret, _) = read_i32(rest)?;
                    self.backend_key = Some(CancelKey {
                        process_id: pid as u32,
                        secret_key: secret as u32,
                    });
                }
                msg_type::NOTICE_RESPONSE => {}
                msg_type::READY_FOR_QUERY if self.stage == PgStage::WaitingReady => {
                    let (_status, _) = read_u8(msg.payload)?;
                    tracing::debug!(user = %self.user, "startup complete");
                    self.stage = PgStage::Ready;
                }
                other => {
                    return Err(Error::fatal_protocol(format!(
                        "unexpected message during startup: '{}'",
                        other as char
                    )));
                }
            }
        }
        Ok((consumed, self.stage == PgStage::Ready))
    }

    fn cancel_key(&self) -> Option<CancelKey> {
        self.backend_key
    }
}

fn write_password(out: &mut Vec<u8>, password: &str) -> Result<()> {
    let mut msg = FrameBuilder::with_type(out, PASSWORD_MESSAGE);
    msg.write_cstr(password);
    msg.finish()
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let first = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}
