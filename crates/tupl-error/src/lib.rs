use thiserror::Error;

/// Primary error type for row storage operations.
///
/// Variants are grouped by how the caller is expected to react: corruption
/// is fatal for the read that found it, resource errors are retryable after
/// backoff, attribute and conflict errors abort the single operation, and
/// interpreter errors abort the row request that carried the program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuplError {
    // === Corruption ===
    /// Stored checksum does not match the fixed words of the tuple.
    #[error("tuple checksum mismatch at {location}: stored {stored:#010x}, computed {computed:#010x}")]
    CorruptionDetected {
        location: String,
        stored: u32,
        computed: u32,
    },

    /// A packed tuple could not be decoded.
    #[error("malformed packed tuple: {detail}")]
    MalformedTuple { detail: String },

    // === Resource exhaustion ===
    /// Every physical slot in the partition is allocated.
    #[error("no free tuple slot (capacity {capacity})")]
    SlotPoolExhausted { capacity: usize },

    /// The shadow-buffer budget is spent.
    #[error("no shadow-buffer memory: {in_use} shadow copies outstanding (limit {limit})")]
    ShadowMemoryExhausted { in_use: usize, limit: usize },

    /// The undo log could not reserve the requested space.
    #[error("insufficient undo log space in group {group}: requested {requested} words")]
    UndoLogFull { group: u32, requested: u32 },

    /// The tablespace has no room for another disk slot.
    #[error("tablespace exhausted: cannot preallocate {words} words")]
    DiskSlotExhausted { words: u32 },

    /// The variable-size area has no page with enough room.
    #[error("variable area exhausted: cannot allocate {words} words")]
    VarAreaExhausted { words: u32 },

    /// A disk page required by the operation is not cache-resident.
    #[error("disk page {page} is not resident")]
    PageNotResident { page: String },

    // === Attribute-level ===
    /// Read output would exceed the caller's word budget.
    #[error("read output overflow: {needed} words exceed budget of {budget}")]
    OutputOverflow { needed: usize, budget: usize },

    /// NULL written into a NOT NULL attribute.
    #[error("NOT NULL constraint failed: attribute {attr}")]
    NullConstraintViolated { attr: u16 },

    /// A non-insert tried to change a primary key attribute.
    #[error("primary key attribute {attr} cannot be changed")]
    PrimaryKeyImmutable { attr: u16 },

    /// Insert left a NOT NULL attribute unset.
    #[error("NOT NULL attribute {attr} not set by insert")]
    MissingNotNullAttribute { attr: u16 },

    /// Stored bytes are not valid in the attribute's character set.
    #[error("attribute {attr} holds an unrecognised character encoding")]
    InvalidFormat { attr: u16 },

    /// Attribute id is not part of the table.
    #[error("no such attribute: {attr}")]
    NoSuchAttribute { attr: u16 },

    /// Fixed-size attribute written with the wrong length.
    #[error("attribute {attr} expects {expected} bytes, got {actual}")]
    WrongAttributeSize {
        attr: u16,
        expected: usize,
        actual: usize,
    },

    /// Variable-size attribute written past its declared maximum.
    #[error("attribute {attr} value of {actual} bytes exceeds maximum {max}")]
    AttributeTooLong { attr: u16, max: usize, actual: usize },

    // === Consistency conflicts ===
    /// Insert on a row that already exists or already has a pending insert.
    #[error("duplicate insert on row {row}")]
    DuplicateInsert { row: String },

    /// Operation on a row whose latest pending operation is a delete.
    #[error("row {row} already deleted")]
    RowAlreadyDeleted { row: String },

    /// No visible version of the row exists for this requester.
    #[error("row {row} not found")]
    RowNotFound { row: String },

    /// Another transaction has an open operation on the row.
    #[error("row {row} has an open operation from {holder}")]
    RowLocked { row: String, holder: String },

    // === Interpreter ===
    /// Malformed program or exceeded instruction budget.
    #[error("interpreter fault at word {pc}: {detail}")]
    InterpreterFault { pc: usize, detail: String },

    /// The program executed `exit-refuse`.
    #[error("interpreted program refused the row with code {code}")]
    InterpreterRefused { code: u16 },

    // === Collaborators / internal ===
    /// An ordered-index maintenance hook failed.
    #[error("index maintenance failed in {index}: {detail}")]
    IndexMaintenance { index: String, detail: String },

    /// Operation handle is stale or unknown.
    #[error("no such operation: {op}")]
    NoSuchOperation { op: String },

    /// Request addressed to a partition this context does not own.
    #[error("partition {requested} is not owned here (owner of {owned})")]
    WrongPartition { requested: u32, owned: u32 },

    /// Table definition rejected by the descriptor builder.
    #[error("invalid table definition: {0}")]
    InvalidSchema(String),

    /// Configuration could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Request shape is valid but not supported by this engine.
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification matching the engine's propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Stored data failed verification.
    Corruption,
    /// A capacity-limited resource is exhausted; retry after backoff.
    Resource,
    /// A single attribute value or read budget was rejected.
    Attribute,
    /// The request conflicts with the row's version chain.
    Conflict,
    /// The interpreted program faulted or refused.
    Interpreter,
    /// Configuration, schema, or engine bug.
    Internal,
}

/// Stable numeric codes reported on the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Corruption = 100,
    Malformed = 101,
    SlotPoolFull = 200,
    ShadowMemory = 201,
    UndoLogFull = 202,
    DiskFull = 203,
    VarAreaFull = 204,
    PageNotResident = 205,
    Overflow = 300,
    NullConstraint = 301,
    PrimaryKeyImmutable = 302,
    MissingNotNull = 303,
    InvalidFormat = 304,
    NoSuchAttribute = 305,
    WrongSize = 306,
    TooLong = 307,
    DuplicateInsert = 400,
    RowDeleted = 401,
    NotFound = 402,
    Locked = 403,
    InterpreterFault = 500,
    Refused = 501,
    IndexMaintenance = 600,
    NoSuchOperation = 601,
    WrongPartition = 602,
    InvalidSchema = 603,
    Config = 604,
    Unsupported = 605,
    Internal = 699,
}

impl TuplError {
    /// Map this error to its propagation class.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::CorruptionDetected { .. } | Self::MalformedTuple { .. } => {
                ErrorClass::Corruption
            }
            Self::SlotPoolExhausted { .. }
            | Self::ShadowMemoryExhausted { .. }
            | Self::UndoLogFull { .. }
            | Self::DiskSlotExhausted { .. }
            | Self::VarAreaExhausted { .. }
            | Self::PageNotResident { .. } => ErrorClass::Resource,
            Self::OutputOverflow { .. }
            | Self::NullConstraintViolated { .. }
            | Self::PrimaryKeyImmutable { .. }
            | Self::MissingNotNullAttribute { .. }
            | Self::InvalidFormat { .. }
            | Self::NoSuchAttribute { .. }
            | Self::WrongAttributeSize { .. }
            | Self::AttributeTooLong { .. } => ErrorClass::Attribute,
            Self::DuplicateInsert { .. }
            | Self::RowAlreadyDeleted { .. }
            | Self::RowNotFound { .. }
            | Self::RowLocked { .. } => ErrorClass::Conflict,
            Self::InterpreterFault { .. } | Self::InterpreterRefused { .. } => {
                ErrorClass::Interpreter
            }
            Self::IndexMaintenance { .. }
            | Self::NoSuchOperation { .. }
            | Self::WrongPartition { .. }
            | Self::InvalidSchema(_)
            | Self::Config(_)
            | Self::Unsupported(_)
            | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Stable numeric code for the request boundary.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CorruptionDetected { .. } => ErrorCode::Corruption,
            Self::MalformedTuple { .. } => ErrorCode::Malformed,
            Self::SlotPoolExhausted { .. } => ErrorCode::SlotPoolFull,
            Self::ShadowMemoryExhausted { .. } => ErrorCode::ShadowMemory,
            Self::UndoLogFull { .. } => ErrorCode::UndoLogFull,
            Self::DiskSlotExhausted { .. } => ErrorCode::DiskFull,
            Self::VarAreaExhausted { .. } => ErrorCode::VarAreaFull,
            Self::PageNotResident { .. } => ErrorCode::PageNotResident,
            Self::OutputOverflow { .. } => ErrorCode::Overflow,
            Self::NullConstraintViolated { .. } => ErrorCode::NullConstraint,
            Self::PrimaryKeyImmutable { .. } => ErrorCode::PrimaryKeyImmutable,
            Self::MissingNotNullAttribute { .. } => ErrorCode::MissingNotNull,
            Self::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            Self::NoSuchAttribute { .. } => ErrorCode::NoSuchAttribute,
            Self::WrongAttributeSize { .. } => ErrorCode::WrongSize,
            Self::AttributeTooLong { .. } => ErrorCode::TooLong,
            Self::DuplicateInsert { .. } => ErrorCode::DuplicateInsert,
            Self::RowAlreadyDeleted { .. } => ErrorCode::RowDeleted,
            Self::RowNotFound { .. } => ErrorCode::NotFound,
            Self::RowLocked { .. } => ErrorCode::Locked,
            Self::InterpreterFault { .. } => ErrorCode::InterpreterFault,
            Self::InterpreterRefused { .. } => ErrorCode::Refused,
            Self::IndexMaintenance { .. } => ErrorCode::IndexMaintenance,
            Self::NoSuchOperation { .. } => ErrorCode::NoSuchOperation,
            Self::WrongPartition { .. } => ErrorCode::WrongPartition,
            Self::InvalidSchema(_) => ErrorCode::InvalidSchema,
            Self::Config(_) => ErrorCode::Config,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the caller may retry the same request after backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Resource) || matches!(self, Self::RowLocked { .. })
    }

    /// Whether this error means stored data can no longer be trusted.
    pub const fn is_corruption(&self) -> bool {
        matches!(self.class(), ErrorClass::Corruption)
    }

    /// Human-friendly suggestion for operators.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::CorruptionDetected { .. } | Self::MalformedTuple { .. } => {
                Some("Take the partition offline and restore it from a replica")
            }
            Self::UndoLogFull { .. } => Some("Retry after the undo log has been trimmed"),
            Self::DiskSlotExhausted { .. } => Some("Add a data file to the tablespace"),
            Self::SlotPoolExhausted { .. } | Self::VarAreaExhausted { .. } => {
                Some("Raise the partition memory limits or delete rows")
            }
            Self::ShadowMemoryExhausted { .. } | Self::PageNotResident { .. } => {
                Some("Retry the operation after a short delay")
            }
            Self::RowLocked { .. } => Some("Wait for the lock holder to commit or abort"),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an interpreter fault at program word `pc`.
    pub fn fault(pc: usize, detail: impl Into<String>) -> Self {
        Self::InterpreterFault {
            pc,
            detail: detail.into(),
        }
    }

    /// Create a malformed-tuple error.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedTuple {
            detail: detail.into(),
        }
    }

    /// Create a schema rejection.
    pub fn schema(detail: impl Into<String>) -> Self {
        Self::InvalidSchema(detail.into())
    }
}

/// Result type alias using `TuplError`.
pub type Result<T> = std::result::Result<T, TuplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_corruption() {
        let err = TuplError::CorruptionDetected {
            location: "row 3:7".to_owned(),
            stored: 0xdead_beef,
            computed: 0x0000_0001,
        };
        assert_eq!(
            err.to_string(),
            "tuple checksum mismatch at row 3:7: stored 0xdeadbeef, computed 0x00000001"
        );
    }

    #[test]
    fn error_display_constraint() {
        let err = TuplError::NullConstraintViolated { attr: 4 };
        assert_eq!(err.to_string(), "NOT NULL constraint failed: attribute 4");
        let err = TuplError::InterpreterRefused { code: 899 };
        assert_eq!(
            err.to_string(),
            "interpreted program refused the row with code 899"
        );
    }

    #[test]
    fn class_mapping() {
        assert_eq!(
            TuplError::malformed("short").class(),
            ErrorClass::Corruption
        );
        assert_eq!(
            TuplError::UndoLogFull {
                group: 1,
                requested: 8
            }
            .class(),
            ErrorClass::Resource
        );
        assert_eq!(
            TuplError::OutputOverflow {
                needed: 9,
                budget: 8
            }
            .class(),
            ErrorClass::Attribute
        );
        assert_eq!(
            TuplError::DuplicateInsert {
                row: "0:0".to_owned()
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(TuplError::fault(3, "bad").class(), ErrorClass::Interpreter);
        assert_eq!(TuplError::internal("x").class(), ErrorClass::Internal);
    }

    #[test]
    fn transient_errors() {
        assert!(
            TuplError::DiskSlotExhausted { words: 4 }.is_transient()
        );
        assert!(
            TuplError::RowLocked {
                row: "1:2".to_owned(),
                holder: "txn#4".to_owned()
            }
            .is_transient()
        );
        assert!(
            !TuplError::RowAlreadyDeleted {
                row: "1:2".to_owned()
            }
            .is_transient()
        );
        assert!(!TuplError::fault(0, "x").is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Corruption as u16, 100);
        assert_eq!(ErrorCode::UndoLogFull as u16, 202);
        assert_eq!(ErrorCode::DuplicateInsert as u16, 400);
        assert_eq!(
            TuplError::PrimaryKeyImmutable { attr: 0 }.code(),
            ErrorCode::PrimaryKeyImmutable
        );
        assert_eq!(
            TuplError::InterpreterRefused { code: 1 }.code(),
            ErrorCode::Refused
        );
    }

    #[test]
    fn suggestions() {
        assert!(TuplError::malformed("x").suggestion().is_some());
        assert!(
            TuplError::ShadowMemoryExhausted {
                in_use: 1,
                limit: 1
            }
            .suggestion()
            .is_some()
        );
        assert!(TuplError::NoSuchAttribute { attr: 1 }.suggestion().is_none());
        assert!(TuplError::malformed("x").is_corruption());
    }
}
