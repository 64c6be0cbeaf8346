//! Connection and pool options.

use std::time::Duration;

use no_panic::no_panic;
use url::Url;

use crate::error::Error;

/// Wire protocol spoken by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// PostgreSQL frontend/backend protocol v3
    #[default]
    Postgres,
    /// MySQL client/server protocol (4.1+)
    MySql,
    /// DB2 Distributed Relational Database Architecture
    Drda,
}

impl Protocol {
    /// Default TCP port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Postgres => 5432,
            Protocol::MySql => 3306,
            Protocol::Drda => 50000,
        }
    }

    /// Default pipelining limit for the protocol.
    ///
    /// MySQL servers answer strictly in order but many proxies do not cope with
    /// pipelined commands, so MySQL defaults to unpipelined mode.
    pub fn default_pipelining_limit(self) -> usize {
        match self {
            Protocol::Postgres => 256,
            Protocol::MySql => 1,
            Protocol::Drda => 1,
        }
    }
}

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    #[default]
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    Prefer,
    /// Require SSL connection
    Require,
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Wire protocol.
    ///
    /// Default: `Protocol::Postgres`
    pub protocol: Protocol,

    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode. Only `Disable` and `Prefer` can be honored; TLS is
    /// provided by the transport, not by this crate.
    ///
    /// Default: `SslMode::Disable`
    pub ssl_mode: SslMode,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// Maximum number of commands in flight on one session. `1` disables pipelining.
    ///
    /// Default: `256`
    pub pipelining_limit: usize,

    /// Maximum number of prepared statements cached per session.
    ///
    /// Default: `256`
    pub statement_cache_capacity: usize,

    /// Maximum encoded size of a single bound parameter.
    ///
    /// Default: `16 MiB`
    pub max_param_size: usize,

    /// Maximum number of sessions owned by a pool.
    ///
    /// Default: `4`
    pub pool_max_size: usize,

    /// Maximum number of callers waiting in `Pool::acquire` (None = unlimited).
    ///
    /// Default: `None`
    pub pool_max_waiters: Option<usize>,

    /// Idle sessions older than this are closed instead of handed out (None = never).
    ///
    /// Default: `None`
    pub pool_idle_timeout: Option<Duration>,

    /// Idle sessions older than this are pinged before being handed out (None = never).
    ///
    /// Default: `Some(30s)`
    pub pool_validation_threshold: Option<Duration>,

    /// How long a validation ping may take before the session counts as dead.
    ///
    /// Default: `5s`
    pub pool_validation_timeout: Duration,

    /// Fresh connection attempts after a failed validation ping.
    ///
    /// Default: `3`
    pub pool_validation_retries: usize,
}

impl Default for Opts {
    #[no_panic]
    fn default() -> Self {
        Self {
            protocol: Protocol::Postgres,
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Disable,
            params: Vec::new(),
            pipelining_limit: 256,
            statement_cache_capacity: 256,
            max_param_size: 16 * 1024 * 1024,
            pool_max_size: 4,
            pool_max_waiters: None,
            pool_idle_timeout: None,
            pool_validation_threshold: Some(Duration::from_secs(30)),
            pool_validation_timeout: Duration::from_secs(5),
            pool_validation_retries: 3,
        }
    }
}

impl Opts {
    /// Options with protocol-appropriate defaults for port and pipelining.
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self {
            protocol,
            port: protocol.default_port(),
            pipelining_limit: protocol.default_pipelining_limit(),
            ..Self::default()
        }
    }

    /// Check option invariants that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pipelining_limit == 0 {
            return Err(Error::InvalidUsage("pipelining_limit must be >= 1".into()));
        }
        if self.pool_max_size == 0 {
            return Err(Error::InvalidUsage("pool_max_size must be >= 1".into()));
        }
        if self.statement_cache_capacity == 0 {
            return Err(Error::InvalidUsage(
                "statement_cache_capacity must be >= 1".into(),
            ));
        }
        if self.ssl_mode == SslMode::Require {
            return Err(Error::Unsupported(
                "sslmode=require needs a TLS transport passed to Conn::from_stream".into(),
            ));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, Error> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidUsage(format!("Invalid {}: {}", key, value))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, Error> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidUsage(format!("Invalid {}: {}", key, value)))
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a connection URL.
    ///
    /// Format: `scheme://[user[:password]@]host[:port][/database][?param1=value1&..]`
    /// where scheme is one of `postgres`, `postgresql`, `pg`, `mysql`, `mariadb`, `db2`.
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, prefer, require
    /// - `application_name`: application name
    /// - `socket`: Unix socket path
    /// - `pipelining_limit`: commands in flight per session (positive integer)
    /// - `statement_cache_capacity`: cached statements per session (positive integer)
    /// - `max_param_size`: bytes per bound parameter (positive integer)
    /// - `pool_max_size`: sessions per pool (positive integer)
    /// - `pool_max_waiters`: callers waiting for a session (integer)
    /// - `pool_idle_timeout_ms`, `pool_validation_threshold_ms`,
    ///   `pool_validation_timeout_ms`: milliseconds
    /// - `pool_validation_retries`: integer
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        let protocol = match url.scheme() {
            "postgres" | "postgresql" | "pg" => Protocol::Postgres,
            "mysql" | "mariadb" => Protocol::MySql,
            "db2" => Protocol::Drda,
            other => {
                return Err(Error::InvalidUsage(format!(
                    "Invalid scheme: expected one of postgres, mysql, db2, got '{}://'",
                    other
                )));
            }
        };

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(protocol.default_port()),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::for_protocol(protocol)
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    opts.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "prefer" => SslMode::Prefer,
                        "require" => SslMode::Require,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                                value
                            )));
                        }
                    };
                }
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "socket" => {
                    opts.socket = Some(value.to_string());
                }
                "pipelining_limit" => {
                    opts.pipelining_limit = parse_positive(&key, &value)?;
                }
                "statement_cache_capacity" => {
                    opts.statement_cache_capacity = parse_positive(&key, &value)?;
                }
                "max_param_size" => {
                    opts.max_param_size = parse_positive(&key, &value)?;
                }
                "pool_max_size" => {
                    opts.pool_max_size = parse_positive(&key, &value)?;
                }
                "pool_max_waiters" => {
                    opts.pool_max_waiters = Some(value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid pool_max_waiters: {}", value))
                    })?);
                }
                "pool_idle_timeout_ms" => {
                    opts.pool_idle_timeout = Some(parse_millis(&key, &value)?);
                }
                "pool_validation_threshold_ms" => {
                    opts.pool_validation_threshold = Some(parse_millis(&key, &value)?);
                }
                "pool_validation_timeout_ms" => {
                    opts.pool_validation_timeout = parse_millis(&key, &value)?;
                }
                "pool_validation_retries" => {
                    opts.pool_validation_retries = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid pool_validation_retries: {}", value))
                    })?;
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}
