//! Row-operation requests and responses.

use tupl_interp::InterpretedProgram;
use tupl_layout::ReadMode;
use tupl_mvcc::OpHandle;
use tupl_types::{AttrId, AttrValue, OpKind, PartitionId, RowLocator, Savepoint, TxnId};

use crate::collab::FetchTicket;

/// Which slot a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RowTarget {
    /// Allocate a fresh slot (insert only).
    New,
    Existing(RowLocator),
}

/// What the request does to attributes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RowPayload {
    /// Explicit lists: `writes` are applied, then `reads` are returned.
    /// A delete reads its before-image.
    Attributes {
        reads: Vec<AttrId>,
        writes: Vec<AttrValue>,
    },
    Program(InterpretedProgram),
}

impl RowPayload {
    pub fn reads(ids: impl IntoIterator<Item = AttrId>) -> Self {
        Self::Attributes {
            reads: ids.into_iter().collect(),
            writes: Vec::new(),
        }
    }

    pub fn writes(values: impl IntoIterator<Item = AttrValue>) -> Self {
        Self::Attributes {
            reads: Vec::new(),
            writes: values.into_iter().collect(),
        }
    }
}

/// One row-level request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RowRequest {
    pub partition: PartitionId,
    pub target: RowTarget,
    pub kind: OpKind,
    pub savepoint: Savepoint,
    pub txn: TxnId,
    pub dirty_read: bool,
    pub payload: RowPayload,
    pub read_mode: ReadMode,
    /// The caller believes the disk page is already resident.
    pub disk_page_ready_hint: bool,
    /// Output budget in words; the partition default when `None`.
    pub output_budget: Option<usize>,
}

impl RowRequest {
    fn base(kind: OpKind, partition: PartitionId, txn: TxnId, target: RowTarget, payload: RowPayload) -> Self {
        Self {
            partition,
            target,
            kind,
            savepoint: Savepoint::LATEST,
            txn,
            dirty_read: false,
            payload,
            read_mode: ReadMode::Raw,
            disk_page_ready_hint: false,
            output_budget: None,
        }
    }

    pub fn insert(partition: PartitionId, txn: TxnId, values: Vec<AttrValue>) -> Self {
        Self::base(OpKind::Insert, partition, txn, RowTarget::New, RowPayload::writes(values))
    }

    pub fn update(partition: PartitionId, txn: TxnId, row: RowLocator, values: Vec<AttrValue>) -> Self {
        Self::base(
            OpKind::Update,
            partition,
            txn,
            RowTarget::Existing(row),
            RowPayload::writes(values),
        )
    }

    pub fn delete(partition: PartitionId, txn: TxnId, row: RowLocator) -> Self {
        Self::base(
            OpKind::Delete,
            partition,
            txn,
            RowTarget::Existing(row),
            RowPayload::reads([]),
        )
    }

    pub fn read(partition: PartitionId, txn: TxnId, row: RowLocator, ids: Vec<AttrId>) -> Self {
        Self::base(
            OpKind::Read,
            partition,
            txn,
            RowTarget::Existing(row),
            RowPayload::reads(ids),
        )
    }

    #[must_use]
    pub fn at_savepoint(mut self, savepoint: Savepoint) -> Self {
        self.savepoint = savepoint;
        self
    }

    #[must_use]
    pub fn dirty(mut self) -> Self {
        self.dirty_read = true;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: RowTarget) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: RowPayload) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    #[must_use]
    pub fn with_budget(mut self, words: usize) -> Self {
        self.output_budget = Some(words);
        self
    }
}

/// Answer to a completed request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowResponse {
    pub values: Vec<AttrValue>,
    /// Attributes written by a mutating request.
    pub written_len: Option<usize>,
    /// Index hooks invoked plus one if a trigger event was delivered.
    pub triggered: usize,
    pub locator: Option<RowLocator>,
    /// The linked operation, if one was created.
    pub op: Option<OpHandle>,
    /// The program finished with `exit-ok-last-row`.
    pub last_row: bool,
}

/// Outcome of driving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Complete(RowResponse),
    /// Waiting on a disk page; resumed by
    /// [`Partition::drive_ready`](crate::Partition::drive_ready).
    Suspended(FetchTicket),
}

impl Step {
    /// The response of a completed step.
    pub fn into_response(self) -> Option<RowResponse> {
        match self {
            Self::Complete(r) => Some(r),
            Self::Suspended(_) => None,
        }
    }
}
