//! Partitioned row store: slots, variable area, row mutation engine and
//! transaction finalization.
//!
//! A [`Partition`] serves [`RowRequest`]s against one table shard. Node
//! services it needs (disk page cache, undo log, tablespace, trigger
//! delivery) are passed in per call through an [`OpContext`].

pub mod collab;
pub mod config;
pub mod context;
mod finalize;
mod mutation;
pub mod partition;
pub mod request;
pub mod router;
pub mod stats;
pub mod store;
pub mod var_area;

pub use collab::{
    AccessIntent, DiskPageCache, FetchTicket, IndexCall, IndexHook, MemoryPageCache,
    MemoryTablespace, MemoryUndoLog, NullTriggerSink, PageFetch, RecordingIndexHook,
    RecordingTriggerSink, Tablespace, TriggerEvent, TriggerSink, UndoLog,
};
pub use config::EngineConfig;
pub use context::OpContext;
pub use partition::{Partition, Resumed};
pub use request::{RowPayload, RowRequest, RowResponse, RowTarget, Step};
pub use router::PartitionRouter;
pub use stats::PartitionStats;
pub use store::{Slot, TupleStore};
pub use var_area::{SizeChange, VarArea, VarSlot};
