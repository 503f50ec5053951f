//! Version chain controller.
//!
//! Each physical row slot anchors a chain of the in-flight operations
//! against it. The chain decides which kind transitions are legal, which
//! version a reader sees, and what happens to the slot when an operation
//! commits or aborts. Descriptors live in a generational arena so that
//! unlinking never leaves a dangling link.

pub mod arena;
pub mod chain;

pub use arena::{OpArena, OpHandle};
pub use chain::{
    ChainIter, Disposition, OpDescriptor, Requester, UnlinkOutcome, Unlinked, VersionChains,
    Visibility,
};
