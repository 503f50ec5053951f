//! Commit and abort of a transaction's operations on one partition.
//!
//! Commit walks the transaction's operations in admission order and makes
//! each shadow image the physical row. Abort walks them newest first and
//! throws the shadows away. Both are idempotent: a transaction with nothing
//! open here finalizes to zero operations.

use std::sync::Arc;

use tupl_error::{Result, TuplError};
use tupl_layout::{ExpandedTuple, HEADER_WORD, TupleFlags, TupleHeader, VarSection, seal_checksum};
use tupl_mvcc::{Disposition, OpHandle, Unlinked};
use tupl_types::{OpKind, RowLocator, TxnId};

use crate::context::OpContext;
use crate::partition::Partition;

impl Partition {
    /// Commit every operation `txn` holds on this partition, oldest first.
    /// Returns the number of operations committed.
    pub fn commit_transaction(&mut self, ctx: &mut OpContext<'_>, txn: TxnId) -> Result<usize> {
        let cancelled = self.cancel_suspended(txn);
        if cancelled > 0 {
            tracing::warn!(partition = %self.id, %txn, cancelled, "commit dropped suspended requests");
        }
        let Some(ops) = self.txn_ops.remove(&txn) else {
            return Ok(0);
        };
        let mut committed = 0;
        for (i, &h) in ops.iter().enumerate() {
            if !self.chains.contains(h) {
                continue;
            }
            if let Err(e) = self.commit_op(ctx, h) {
                tracing::error!(partition = %self.id, %txn, op = %h, error = %e, "commit failed");
                self.txn_ops.insert(txn, ops[i..].to_vec());
                return Err(e);
            }
            committed += 1;
        }
        self.stats.commits += 1;
        tracing::debug!(partition = %self.id, %txn, committed, "transaction committed");
        Ok(committed)
    }

    /// Roll back every operation `txn` holds on this partition, newest
    /// first. Every operation is attempted; the first failure is returned.
    pub fn abort_transaction(&mut self, ctx: &mut OpContext<'_>, txn: TxnId) -> Result<usize> {
        let cancelled = self.cancel_suspended(txn);
        let Some(ops) = self.txn_ops.remove(&txn) else {
            if cancelled > 0 {
                self.stats.aborts += 1;
            }
            return Ok(0);
        };
        let mut aborted = 0;
        let mut first_err = None;
        for &h in ops.iter().rev() {
            if !self.chains.contains(h) {
                continue;
            }
            match self.abort_op(ctx, h, true) {
                Ok(()) => aborted += 1,
                Err(e) => {
                    tracing::error!(partition = %self.id, %txn, op = %h, error = %e, "abort step failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        self.stats.aborts += 1;
        tracing::debug!(partition = %self.id, %txn, aborted, cancelled, "transaction aborted");
        match first_err {
            Some(e) => Err(e),
            None => Ok(aborted),
        }
    }

    fn commit_op(&mut self, ctx: &mut OpContext<'_>, h: OpHandle) -> Result<()> {
        let loc = self.chains.get(h)?.locator;
        let physical_version = self.store.get(loc)?.header().version;
        let slot = self.store.slot_mut(loc)?;
        let Unlinked {
            descriptor: d,
            outcome,
        } = self.chains.unlink(&mut slot.anchor, h, Disposition::Commit)?;
        if d.shadow.is_some() {
            self.release_shadow();
        }
        if d.undo_words > 0 {
            ctx.undo.consume(self.config.undo_group(), d.undo_words);
        }

        match d.kind {
            OpKind::Read => {}
            OpKind::Insert | OpKind::Update => {
                let image = d.shadow.ok_or_else(|| no_image(h))?;
                if d.kind == OpKind::Update {
                    self.remove_index_entries(loc, physical_version);
                }
                self.write_physical(ctx, loc, &image, outcome.chain_empty)?;
            }
            OpKind::Delete => {
                self.remove_index_entries(loc, d.version);
                if !outcome.has_successor {
                    let image = d.shadow.ok_or_else(|| no_image(h))?;
                    let var_ref = image.var_ref(&self.desc);
                    let disk_ref = image.disk_ref(&self.desc);
                    self.release_row(ctx, loc, var_ref, disk_ref);
                }
            }
        }
        tracing::trace!(row = %loc, op = %h, kind = %d.kind, version = %d.version, "operation committed");
        Ok(())
    }

    /// Roll back one linked operation. `unindex` is false when the index
    /// entries of the operation were never added.
    pub(crate) fn abort_op(&mut self, ctx: &mut OpContext<'_>, h: OpHandle, unindex: bool) -> Result<()> {
        let loc = self.chains.get(h)?.locator;
        let slot = self.store.slot_mut(loc)?;
        let Unlinked {
            descriptor: d,
            outcome,
        } = self.chains.unlink(&mut slot.anchor, h, Disposition::Abort)?;
        if d.shadow.is_some() {
            self.release_shadow();
        }
        if d.undo_words > 0 {
            ctx.undo.release(self.config.undo_group(), d.undo_words);
        }
        if unindex && matches!(d.kind, OpKind::Insert | OpKind::Update) {
            self.remove_index_entries(loc, d.version);
        }

        if outcome.free_slot {
            let image = d.shadow.as_ref().ok_or_else(|| no_image(h))?;
            let var_ref = image.var_ref(&self.desc);
            let disk_ref = image.disk_ref(&self.desc);
            self.release_row(ctx, loc, var_ref, disk_ref);
        } else if outcome.chain_empty {
            self.sync_relocated(loc)?;
        }
        tracing::trace!(row = %loc, op = %h, kind = %d.kind, freed = outcome.free_slot, "operation aborted");
        Ok(())
    }

    /// Make `image` the committed row: variable part into the variable
    /// area, disk part into its record, fixed part into the slot.
    /// `settle` is set when no later operation on the row is still open,
    /// so spare variable capacity can be given back.
    fn write_physical(
        &mut self,
        ctx: &mut OpContext<'_>,
        loc: RowLocator,
        image: &ExpandedTuple,
        settle: bool,
    ) -> Result<()> {
        let desc = Arc::clone(&self.desc);
        let mut relocated = false;
        if let Some(home) = image.var_ref(&desc) {
            let words = image.var.as_ref().map(VarSection::pack).unwrap_or_default();
            self.var_area.ensure_capacity(home, words.len())?;
            self.var_area.write(home, &words)?;
            if settle && image.flags().contains(TupleFlags::MM_SHRINK) {
                let freed = self.var_area.shrink_to_fit(home)?;
                tracing::trace!(row = %loc, freed, "variable part shrunk");
            }
            relocated = self.var_area.resolve(home)? != home;
        }
        if let Some(disk) = image.disk_ref(&desc) {
            let section = image
                .disk
                .as_ref()
                .ok_or_else(|| TuplError::internal(format!("row {loc} committed without its disk part")))?;
            ctx.pages.write_record(disk, &section.pack())?;
        }

        let mut fixed = image.fixed.clone();
        let mut header = TupleHeader::from_word(fixed[HEADER_WORD]);
        header.flags.remove(TupleFlags::MM_GROWN | TupleFlags::MM_SHRINK);
        header.flags.set(TupleFlags::VAR_RELOCATED, relocated);
        fixed[HEADER_WORD] = header.to_word();
        seal_checksum(&desc, &mut fixed);
        self.store.slot_mut(loc)?.fixed = fixed;
        Ok(())
    }
}

fn no_image(h: OpHandle) -> TuplError {
    TuplError::internal(format!("{h} holds no row image"))
}
