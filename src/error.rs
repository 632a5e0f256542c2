//! # Recoverable Error Classification
//!
//! The core reports recoverable input-validation failures (bad wire data,
//! mismatched schemas, failed block allocation) as a `TableError` carried
//! inside an `eyre::Report`. Callers that need to branch on the failure
//! class use `report.downcast_ref::<TableError>()` and match on the kind;
//! callers that only log use the formatted message.
//!
//! Internal invariant violations (bucket membership drift, count skew) are
//! not recoverable and are reported through assertions instead.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The wire data describes a different set of columns than the target
    /// table's schema.
    SchemaMismatch,
    /// The wire data is truncated or contains an invalid length field.
    Deserialization,
    /// A block allocation failed. The table is left consistent; the
    /// partially constructed block is discarded.
    OutOfMemory,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::SchemaMismatch => "schema mismatch",
            ErrorKind::Deserialization => "deserialization error",
            ErrorKind::OutOfMemory => "out of memory",
        }
    }
}

#[derive(Debug)]
pub struct TableError {
    kind: ErrorKind,
    message: String,
}

impl TableError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn schema_mismatch(message: impl Into<String>) -> eyre::Report {
        eyre::Report::new(Self::new(ErrorKind::SchemaMismatch, message))
    }

    pub fn deserialization(message: impl Into<String>) -> eyre::Report {
        eyre::Report::new(Self::new(ErrorKind::Deserialization, message))
    }

    pub fn out_of_memory(message: impl Into<String>) -> eyre::Report {
        eyre::Report::new(Self::new(ErrorKind::OutOfMemory, message))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl std::error::Error for TableError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved_through_report() {
        let report = TableError::schema_mismatch("expected 2 columns");
        let err = report.downcast_ref::<TableError>().unwrap();

        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert!(err.message().contains("expected 2 columns"));
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = TableError::new(ErrorKind::Deserialization, "short read");

        assert_eq!(err.to_string(), "deserialization error: short read");
    }
}
