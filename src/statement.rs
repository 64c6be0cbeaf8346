//! Prepared statements and statement references for `execute`/`batch`.

use std::sync::Arc;

use crate::row::ColumnInfo;

/// Server-side statement handle. Connection-scoped: a handle is meaningless on
/// any other physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatementHandle {
    /// PostgreSQL named statement (`s1`, `s2`, ...)
    Named(String),
    /// MySQL statement id assigned by the server
    Id(u32),
    /// DRDA package section number
    Section(u16),
}

impl std::fmt::Display for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatementHandle::Named(name) => write!(f, "{}", name),
            StatementHandle::Id(id) => write!(f, "#{}", id),
            StatementHandle::Section(section) => write!(f, "section {}", section),
        }
    }
}

/// Result of a successful prepare on one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub handle: StatementHandle,
    /// Parameter type identifiers
    pub param_types: Vec<u32>,
    /// Result column descriptors (empty for statements without rows)
    pub columns: Vec<ColumnInfo>,
}

impl StatementInfo {
    pub fn param_count(&self) -> usize {
        self.param_types.len()
    }
}

/// A statement prepared on some session.
///
/// Executing it on a pooled connection that has not seen the SQL re-prepares
/// it there transparently; the handle is only a hint for the session that
/// created it.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    sql: Arc<str>,
    info: Arc<StatementInfo>,
}

impl PreparedStatement {
    pub(crate) fn new(sql: Arc<str>, info: Arc<StatementInfo>) -> Self {
        Self { sql, info }
    }

    /// Normalized SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn handle(&self) -> &StatementHandle {
        &self.info.handle
    }

    pub fn param_types(&self) -> &[u32] {
        &self.info.param_types
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.info.columns
    }

    pub(crate) fn sql_arc(&self) -> Arc<str> {
        Arc::clone(&self.sql)
    }

    pub(crate) fn info(&self) -> &Arc<StatementInfo> {
        &self.info
    }
}

/// Cache key for SQL text: surrounding whitespace is not significant, interior
/// whitespace is (it may sit inside a literal).
pub fn normalize(sql: &str) -> &str {
    sql.trim()
}

/// Sealed trait for types that can be used as statement references in
/// `execute`/`batch`/`close_statement`.
///
/// This trait is sealed and cannot be implemented outside this crate.
pub trait IntoStatement: private::Sealed {
    /// Normalized SQL text identifying the statement on any session.
    fn statement_sql(&self) -> Arc<str>;
}

mod private {
    use super::PreparedStatement;

    pub trait Sealed {}

    impl Sealed for &PreparedStatement {}
    impl Sealed for &str {}
    impl Sealed for &String {}
}

impl IntoStatement for &PreparedStatement {
    fn statement_sql(&self) -> Arc<str> {
        self.sql_arc()
    }
}

impl IntoStatement for &str {
    fn statement_sql(&self) -> Arc<str> {
        Arc::from(normalize(self))
    }
}

impl IntoStatement for &String {
    fn statement_sql(&self) -> Arc<str> {
        Arc::from(normalize(self))
    }
}
