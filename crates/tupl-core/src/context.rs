//! Explicit per-call context carrying the node-level collaborators.

use crate::collab::{DiskPageCache, Tablespace, TriggerSink, UndoLog};

/// Collaborators a row request may touch. Built by the caller for each
/// batch of requests and passed down by reference; nothing here is global.
pub struct OpContext<'a> {
    pub pages: &'a mut dyn DiskPageCache,
    pub undo: &'a dyn UndoLog,
    pub tablespace: &'a mut dyn Tablespace,
    pub triggers: &'a mut dyn TriggerSink,
}

impl<'a> OpContext<'a> {
    pub fn new(
        pages: &'a mut dyn DiskPageCache,
        undo: &'a dyn UndoLog,
        tablespace: &'a mut dyn Tablespace,
        triggers: &'a mut dyn TriggerSink,
    ) -> Self {
        Self {
            pages,
            undo,
            tablespace,
            triggers,
        }
    }
}

impl std::fmt::Debug for OpContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext").finish_non_exhaustive()
    }
}
