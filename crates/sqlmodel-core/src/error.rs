//! Error types shared by the host façade and its drivers.

use std::fmt;

/// The primary error type for all SQLModel operations.
#[derive(Debug)]
pub enum Error {
    /// Driver initialization, connect, login and session-state errors
    Connection(ConnectionError),
    /// Prepare, execute and fetch errors
    Query(QueryError),
    /// Value conversion errors (binding or reading)
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Configuration and DSN errors
    Config(ConfigError),
    /// A native allocation failed
    Resource(ResourceError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// The driver does not implement the requested feature
    Unsupported(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The client library could not be initialized
    NotInitialized,
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// The connection was closed by the caller
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    /// Server message number, when the server reported one
    pub code: Option<i32>,
    /// Server message severity
    pub severity: Option<i32>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// The statement could not be prepared
    Prepare,
    /// Executing a statement failed
    Execute,
    /// Fetching or converting a row failed
    Fetch,
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// The statement was already deallocated
    StatementClosed,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The connection already has an active transaction
    AlreadyActive,
    /// Savepoint not found
    SavepointNotFound,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ResourceError {
    /// Name of the native routine whose allocation failed
    pub verb: &'static str,
    pub message: String,
}

impl Error {
    /// Is this a retryable error (deadlock, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Authentication
                    | ConnectionErrorKind::Disconnected
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Was the operation rejected because the connection is closed?
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::Closed)
    }

    /// Was the operation rejected because the statement was deallocated?
    pub fn is_statement_closed(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::StatementClosed)
    }

    /// Get SQLSTATE if available
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for a [`ConnectionErrorKind::Closed`] error.
    pub fn connection_closed() -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            message: "connection is closed".to_string(),
            source: None,
        })
    }

    /// Shorthand for a [`QueryErrorKind::StatementClosed`] error.
    pub fn statement_closed(sql: Option<&str>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::StatementClosed,
            sql: sql.map(str::to_string),
            sqlstate: None,
            message: "statement is closed".to_string(),
            code: None,
            severity: None,
            source: None,
        })
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Create a query error with only a kind and a message.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            code: None,
            severity: None,
            source: None,
        }
    }

    /// Attach the SQL text that caused the error.
    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Is this a unique constraint violation (server messages 2601 / 2627)?
    pub fn is_unique_violation(&self) -> bool {
        matches!(self.code, Some(2601 | 2627))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "{}", e.message),
            Error::Query(e) => write!(f, "{e}"),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Resource(e) => write!(f, "{}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Unsupported(msg) => write!(f, "Feature not supported: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ResourceError> for Error {
    fn from(err: ResourceError) -> Self {
        Error::Resource(err)
    }
}

/// Result type alias for SQLModel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_code_helpers() {
        let mut query = QueryError::new(QueryErrorKind::Execute, "ct_results failed: duplicate key")
            .with_sql("INSERT INTO t VALUES (1)");
        query.code = Some(2601);
        assert!(query.is_unique_violation());

        let err = Error::Query(query);
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert_eq!(err.to_string(), "ct_results failed: duplicate key");
    }

    #[test]
    fn closed_shorthands() {
        assert!(Error::connection_closed().is_connection_closed());
        assert!(!Error::connection_closed().is_statement_closed());
        let stmt = Error::statement_closed(Some("SELECT 1"));
        assert!(stmt.is_statement_closed());
        assert_eq!(stmt.sql(), Some("SELECT 1"));
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Query(QueryError::new(QueryErrorKind::Deadlock, "deadlock"));
        assert!(deadlock.is_retryable());
        assert!(Error::Timeout.is_retryable());

        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "lost connection".to_string(),
            source: None,
        });
        assert!(lost.is_connection_error());
        assert!(!Error::connection_closed().is_connection_error());
    }

    #[test]
    fn native_messages_display_verbatim() {
        let err = Error::Resource(ResourceError {
            verb: "ct_cmd_alloc",
            message: "ct_cmd_alloc failed: out of memory".to_string(),
        });
        assert_eq!(err.to_string(), "ct_cmd_alloc failed: out of memory");
    }
}
