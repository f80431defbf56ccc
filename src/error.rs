//! Error taxonomy for pgcore.
//!
//! Every failure carries an [`ErrorKind`]. Kinds form a tree (see
//! [`ErrorKind::parent`]) so callers can match on a specific leaf or ask
//! whether an error belongs to a whole family with [`Error::is_a`].
//!
//! Server conditions are classified from their SQLSTATE through a table:
//! the exact five-character code first, then its two-character class, and
//! finally the generic [`ErrorKind::Sql`]. Unknown codes therefore land on
//! the nearest known ancestor instead of failing classification.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Result type for all pgcore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified kind of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Root of everything the server or the transport can cause
    Failure,

    BrokenConnection,
    TooManyConnections,
    InDoubt,

    Sql,
    DataException,
    FeatureNotSupported,
    InsufficientPrivilege,
    InsufficientResources,
    DiskFull,
    OutOfMemory,
    IntegrityConstraintViolation,
    CheckViolation,
    ForeignKeyViolation,
    NotNullViolation,
    RestrictViolation,
    UniqueViolation,
    InvalidCursorName,
    InvalidCursorState,
    InvalidSqlStatementName,
    PlpgsqlError,
    PlpgsqlNoDataFound,
    PlpgsqlRaise,
    PlpgsqlTooManyRows,
    SyntaxError,
    UndefinedColumn,
    UndefinedFunction,
    UndefinedTable,
    TransactionRollback,
    SerializationFailure,
    DeadlockDetected,
    StatementCompletionUnknown,

    // Raised locally, never by the server
    Usage,
    Argument,
    Range,
    Conversion,
    Internal,
}

impl ErrorKind {
    /// The next kind up the hierarchy, or `None` for a root.
    pub fn parent(self) -> Option<ErrorKind> {
        use ErrorKind::*;
        match self {
            Failure | Usage | Argument | Range | Conversion | Internal => None,
            BrokenConnection | InDoubt | Sql => Some(Failure),
            TooManyConnections => Some(BrokenConnection),
            DataException
            | FeatureNotSupported
            | InsufficientPrivilege
            | InsufficientResources
            | IntegrityConstraintViolation
            | InvalidCursorName
            | InvalidCursorState
            | InvalidSqlStatementName
            | PlpgsqlError
            | SyntaxError
            | TransactionRollback => Some(Sql),
            DiskFull | OutOfMemory => Some(InsufficientResources),
            CheckViolation | ForeignKeyViolation | NotNullViolation | RestrictViolation
            | UniqueViolation => Some(IntegrityConstraintViolation),
            PlpgsqlNoDataFound | PlpgsqlRaise | PlpgsqlTooManyRows => Some(PlpgsqlError),
            UndefinedColumn | UndefinedFunction | UndefinedTable => Some(SyntaxError),
            SerializationFailure | DeadlockDetected | StatementCompletionUnknown => {
                Some(TransactionRollback)
            }
        }
    }

    /// True if `self` is `ancestor` or descends from it.
    pub fn is_a(self, ancestor: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// Human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Failure => "failure",
            BrokenConnection => "broken connection",
            TooManyConnections => "too many connections",
            InDoubt => "in-doubt",
            Sql => "sql error",
            DataException => "data exception",
            FeatureNotSupported => "feature not supported",
            InsufficientPrivilege => "insufficient privilege",
            InsufficientResources => "insufficient resources",
            DiskFull => "disk full",
            OutOfMemory => "out of memory",
            IntegrityConstraintViolation => "integrity constraint violation",
            CheckViolation => "check violation",
            ForeignKeyViolation => "foreign key violation",
            NotNullViolation => "not-null violation",
            RestrictViolation => "restrict violation",
            UniqueViolation => "unique violation",
            InvalidCursorName => "invalid cursor name",
            InvalidCursorState => "invalid cursor state",
            InvalidSqlStatementName => "invalid sql statement name",
            PlpgsqlError => "pl/pgsql error",
            PlpgsqlNoDataFound => "pl/pgsql no data found",
            PlpgsqlRaise => "pl/pgsql raise",
            PlpgsqlTooManyRows => "pl/pgsql too many rows",
            SyntaxError => "syntax error",
            UndefinedColumn => "undefined column",
            UndefinedFunction => "undefined function",
            UndefinedTable => "undefined table",
            TransactionRollback => "transaction rollback",
            SerializationFailure => "serialization failure",
            DeadlockDetected => "deadlock detected",
            StatementCompletionUnknown => "statement completion unknown",
            Usage => "usage error",
            Argument => "argument error",
            Range => "range error",
            Conversion => "conversion error",
            Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exact SQLSTATE codes with a dedicated kind.
static BY_CODE: Lazy<HashMap<&'static str, ErrorKind>> = Lazy::new(|| {
    use ErrorKind::*;
    HashMap::from([
        ("23001", RestrictViolation),
        ("23502", NotNullViolation),
        ("23503", ForeignKeyViolation),
        ("23505", UniqueViolation),
        ("23514", CheckViolation),
        ("24000", InvalidCursorState),
        ("26000", InvalidSqlStatementName),
        ("34000", InvalidCursorName),
        ("40001", SerializationFailure),
        ("40003", StatementCompletionUnknown),
        ("40P01", DeadlockDetected),
        ("42501", InsufficientPrivilege),
        ("42601", SyntaxError),
        ("42703", UndefinedColumn),
        ("42883", UndefinedFunction),
        ("42P01", UndefinedTable),
        ("53100", DiskFull),
        ("53200", OutOfMemory),
        ("53300", TooManyConnections),
        ("P0001", PlpgsqlRaise),
        ("P0002", PlpgsqlNoDataFound),
        ("P0003", PlpgsqlTooManyRows),
    ])
});

/// SQLSTATE classes (first two characters) and their nearest kind.
static BY_CLASS: Lazy<HashMap<&'static str, ErrorKind>> = Lazy::new(|| {
    use ErrorKind::*;
    HashMap::from([
        ("08", BrokenConnection),
        ("0A", FeatureNotSupported),
        ("22", DataException),
        ("23", IntegrityConstraintViolation),
        ("24", InvalidCursorState),
        ("26", InvalidSqlStatementName),
        ("34", InvalidCursorName),
        ("40", TransactionRollback),
        ("42", SyntaxError),
        ("53", InsufficientResources),
        ("P0", PlpgsqlError),
    ])
});

/// Map a server-reported SQLSTATE onto the taxonomy.
pub fn classify(sqlstate: &str) -> ErrorKind {
    if let Some(kind) = BY_CODE.get(sqlstate) {
        return *kind;
    }
    sqlstate
        .get(..2)
        .and_then(|class| BY_CLASS.get(class))
        .copied()
        .unwrap_or(ErrorKind::Sql)
}

/// A pgcore error: the classified kind plus the original text.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    sqlstate: Option<String>,
    query: Option<String>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
            query: None,
        }
    }

    /// Create a server-reported error, classified from its SQLSTATE.
    pub fn from_sqlstate(sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            kind: classify(sqlstate),
            message: message.into(),
            sqlstate: Some(sqlstate.to_string()),
            query: None,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    pub fn range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Range, message)
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conversion, message)
    }

    pub fn broken(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BrokenConnection, message)
    }

    pub fn in_doubt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InDoubt, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach the statement that caused this error.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Original text as reported by the server or the detecting call.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// True if this error's kind is `ancestor` or descends from it.
    pub fn is_a(&self, ancestor: ErrorKind) -> bool {
        self.kind.is_a(ancestor)
    }

    /// Serialization failures and deadlocks: the whole transaction may be
    /// restarted from scratch.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::SerializationFailure | ErrorKind::DeadlockDetected
        )
    }

    /// The transport went away (including too-many-connections).
    pub fn is_broken_connection(&self) -> bool {
        self.is_a(ErrorKind::BrokenConnection)
    }
}
