//! Error types for beanorm operations.
//!
//! The taxonomy distinguishes failures a caller can act on:
//!
//! - [`MappingError`] — unknown bean type / property / path, reported at
//!   tree-build time before any statement executes
//! - [`ExecutionError`] — statement or cursor failures, timeouts, cancellation
//! - [`ConsistencyError`] — internal invariant violations (row-ordering in the
//!   hydration state machine); fatal, never retried
//! - [`BatchError`] — a batched-write bucket failed mid-flush
//!
//! Execution and consistency failures carry the generated SQL and a redacted
//! bind-value log for diagnosis.

use crate::value::Value;
use std::fmt;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type for all beanorm operations.
#[derive(Debug)]
pub enum Error {
    /// Unknown bean type, property, or fetch path.
    Mapping(MappingError),
    /// Statement/cursor failure, timeout, or cancellation.
    Execution(ExecutionError),
    /// Internal invariant violation; indicates a bug, not a transient condition.
    Consistency(ConsistencyError),
    /// A batched-write bucket failed mid-flush.
    Batch(BatchError),
    /// Column value could not be converted to the requested representation.
    Type(TypeError),
    /// A unique find matched more than one row.
    NotUnique {
        /// Number of rows the query matched.
        rows: usize,
    },
    /// Custom error with message.
    Custom(String),
}

/// Unknown bean type, property, or fetch path referenced by a query.
#[derive(Debug)]
pub struct MappingError {
    /// The bean type the query targeted.
    pub bean_type: String,
    /// The offending path or property name.
    pub path: String,
    /// Human-readable detail.
    pub message: String,
}

/// Statement or cursor execution failure.
#[derive(Debug)]
pub struct ExecutionError {
    /// What failed.
    pub kind: ExecutionErrorKind,
    /// The generated SQL, when known.
    pub sql: Option<String>,
    /// Redacted bind-value log, when known.
    pub bind_log: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

/// The category of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// Statement preparation or execution failed.
    Statement,
    /// A cursor read failed mid-result.
    Cursor,
    /// The configured statement timeout was reached.
    Timeout,
    /// The statement was cancelled from another thread.
    Cancelled,
}

/// Internal consistency violation detected by the engine.
#[derive(Debug)]
pub struct ConsistencyError {
    /// The generated SQL for the failing execution.
    pub sql: String,
    /// Redacted bind-value log for the failing execution.
    pub bind_log: String,
    /// Human-readable detail.
    pub message: String,
}

/// A batched-write bucket failed; later buckets were not attempted.
#[derive(Debug)]
pub struct BatchError {
    /// Table of the failing bucket.
    pub table: String,
    /// Cascade depth of the failing bucket.
    pub depth: i32,
    /// Human-readable detail.
    pub message: String,
    /// The underlying failure.
    pub source: Option<Box<Error>>,
}

/// Column value conversion failure.
#[derive(Debug)]
pub struct TypeError {
    /// The representation that was requested.
    pub expected: &'static str,
    /// What was actually found.
    pub actual: String,
    /// Property name, when known.
    pub property: Option<String>,
}

impl Error {
    /// Build a mapping error.
    pub fn mapping(
        bean_type: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            bean_type: bean_type.into(),
            path: path.into(),
            message: message.into(),
        })
    }

    /// Build an execution error without SQL context.
    pub fn execution(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Error::Execution(ExecutionError {
            kind,
            sql: None,
            bind_log: None,
            message: message.into(),
        })
    }

    /// Build an execution error carrying the generated SQL and redacted binds.
    pub fn execution_with_sql(
        kind: ExecutionErrorKind,
        message: impl Into<String>,
        sql: impl Into<String>,
        params: &[Value],
    ) -> Self {
        Error::Execution(ExecutionError {
            kind,
            sql: Some(sql.into()),
            bind_log: Some(redacted_bind_log(params)),
            message: message.into(),
        })
    }

    /// Build a consistency error carrying full execution context.
    pub fn consistency(
        message: impl Into<String>,
        sql: impl Into<String>,
        params: &[Value],
    ) -> Self {
        Error::Consistency(ConsistencyError {
            sql: sql.into(),
            bind_log: redacted_bind_log(params),
            message: message.into(),
        })
    }

    /// Attach SQL/bind context to an execution error that lacks it.
    #[must_use]
    pub fn with_sql_context(self, sql: &str, params: &[Value]) -> Self {
        match self {
            Error::Execution(mut e) => {
                if e.sql.is_none() {
                    e.sql = Some(sql.to_string());
                }
                if e.bind_log.is_none() {
                    e.bind_log = Some(redacted_bind_log(params));
                }
                Error::Execution(e)
            }
            other => other,
        }
    }

    /// True when the failure is a timeout or cancellation.
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Error::Execution(ExecutionError {
                kind: ExecutionErrorKind::Timeout | ExecutionErrorKind::Cancelled,
                ..
            })
        )
    }
}

/// Render bind parameters for logging without exposing payload contents.
///
/// Numeric and temporal values are shown verbatim; text, bytes, and JSON are
/// reduced to their type and length.
pub fn redacted_bind_log(params: &[Value]) -> String {
    let parts: Vec<String> = params
        .iter()
        .map(|v| match v {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Double(f) => f.to_string(),
            Value::Date(d) => format!("date({d})"),
            Value::Timestamp(ts) => format!("ts({ts})"),
            Value::Decimal(s) => format!("decimal(len={})", s.len()),
            Value::Text(s) => format!("text(len={})", s.len()),
            Value::Bytes(b) => format!("bytes(len={})", b.len()),
            Value::Json(_) => "json(..)".to_string(),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(
                f,
                "mapping error on {}.{}: {}",
                e.bean_type, e.path, e.message
            ),
            Error::Execution(e) => {
                write!(f, "execution error ({:?}): {}", e.kind, e.message)?;
                if let Some(sql) = &e.sql {
                    write!(f, "; sql: {sql}")?;
                }
                if let Some(binds) = &e.bind_log {
                    write!(f, "; binds: {binds}")?;
                }
                Ok(())
            }
            Error::Consistency(e) => write!(
                f,
                "internal consistency error: {}; sql: {}; binds: {}",
                e.message, e.sql, e.bind_log
            ),
            Error::Batch(e) => {
                write!(
                    f,
                    "batch flush failed for table {} at depth {}: {}",
                    e.table, e.depth, e.message
                )?;
                if let Some(source) = &e.source {
                    write!(f, "; caused by: {source}")?;
                }
                Ok(())
            }
            Error::Type(e) => {
                write!(f, "expected {} but found {}", e.expected, e.actual)?;
                if let Some(prop) = &e.property {
                    write!(f, " (property {prop})")?;
                }
                Ok(())
            }
            Error::NotUnique { rows } => {
                write!(f, "unique query matched {rows} rows")
            }
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Batch(e) => e.source.as_deref().map(|e| e as _),
            _ => None,
        }
    }
}
