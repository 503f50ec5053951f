//! Row mutation engine: read, insert, update and delete against one slot.
//!
//! Every write works on a shadow copy of the row held by its operation
//! descriptor. The physical slot keeps the committed image until the
//! transaction commits. Resources are taken in a fixed order (undo space,
//! slot, disk slot, variable space) and given back in reverse when a later
//! step fails, so a failed request leaves no trace.

use std::sync::Arc;

use tupl_error::{Result, TuplError};
use tupl_interp::{InterpOutcome, InterpretedProgram, RunOptions};
use tupl_layout::{
    ExpandedTuple, TupleFlags, VarSection, WriteKind, check_not_null, primary_key_image, read_all,
    read_attrs, seal_checksum, update_attrs,
};
use tupl_mvcc::{OpDescriptor, OpHandle, Requester, Visibility};
use tupl_types::{AttrValue, DiskRef, OpKind, RowLocator};

use crate::collab::{AccessIntent, TriggerEvent};
use crate::context::OpContext;
use crate::partition::{Loaded, Partition, words_u32};
use crate::request::{RowPayload, RowRequest, RowResponse, RowTarget, Step};
use crate::var_area::SizeChange;

/// Where a mutation takes its before-image from.
#[derive(Debug, Clone, Copy)]
enum Source {
    Committed,
    Shadow(OpHandle),
}

impl Partition {
    // ── Read ────────────────────────────────────────────────────────────

    pub(crate) fn do_read(&mut self, ctx: &mut OpContext<'_>, req: &RowRequest) -> Result<Step> {
        let loc = existing(req)?;
        let anchor = self.store.get(loc)?.anchor;
        let requester = Requester {
            txn: req.txn,
            savepoint: req.savepoint,
            dirty_read: req.dirty_read,
        };
        let (mut image, foreign) = match self.chains.select_visible(anchor, &requester)? {
            Visibility::Locked { holder } => {
                return Err(TuplError::RowLocked {
                    row: loc.to_string(),
                    holder: holder.to_string(),
                });
            }
            Visibility::Deleted | Visibility::InsertedNotVisible => return Err(not_found(loc)),
            // Checksums guard the physical slot; a shadow never leaves engine memory.
            Visibility::Pending(h) => (self.shadow_of(h)?, false),
            Visibility::Committed => {
                let foreign = match anchor {
                    Some(newest) => self.chains.get(newest)?.txn != req.txn,
                    None => false,
                };
                let need_disk = self.payload_needs_disk(&req.payload);
                match self.load_committed(ctx, loc, need_disk, AccessIntent::Read, req.disk_page_ready_hint)? {
                    Loaded::Ready(t) => (t, foreign),
                    Loaded::Pending(ticket) => return Ok(Step::Suspended(ticket)),
                }
            }
        };

        let (values, last_row) = match &req.payload {
            RowPayload::Attributes { reads, writes } => {
                if !writes.is_empty() {
                    return Err(TuplError::Unsupported("a read cannot write attributes".to_owned()));
                }
                let values = read_attrs(
                    &self.desc,
                    &self.collations,
                    &image,
                    reads,
                    self.budget(req),
                    req.read_mode,
                )?;
                (values, false)
            }
            RowPayload::Program(p) => {
                let out = self.run_program(req, &mut image, p, false)?;
                (out.values, out.last_row)
            }
        };

        // A savepoint read of a row this transaction has since deleted sees
        // the older image but cannot follow the delete on the chain.
        let after_own_delete = self
            .chains
            .last_write(anchor)
            .is_some_and(|h| self.chains.get(h).is_ok_and(|d| d.kind == OpKind::Delete));
        let op = if foreign || after_own_delete {
            None
        } else {
            let mut d = OpDescriptor::new(OpKind::Read, req.txn, req.savepoint, loc);
            d.version = image.version();
            Some(self.link(loc, d)?)
        };
        tracing::trace!(row = %loc, txn = %req.txn, version = %image.version(), linked = op.is_some(), "row read");
        Ok(Step::Complete(RowResponse {
            values,
            locator: Some(loc),
            op,
            last_row,
            ..RowResponse::default()
        }))
    }

    // ── Insert ──────────────────────────────────────────────────────────

    pub(crate) fn do_insert(&mut self, ctx: &mut OpContext<'_>, req: &RowRequest) -> Result<Step> {
        let RowPayload::Attributes { reads, writes } = &req.payload else {
            return Err(TuplError::Unsupported(
                "interpreted programs cannot insert rows".to_owned(),
            ));
        };
        let desc = Arc::clone(&self.desc);
        let mut shadow = ExpandedTuple::blank(&desc);
        let written = update_attrs(&desc, &self.collations, &mut shadow, writes, WriteKind::Insert)?;
        check_not_null(&desc, &shadow)?;
        let values = read_attrs(&desc, &self.collations, &shadow, reads, self.budget(req), req.read_mode)?;

        let (loc, h, indexed) = match req.target {
            RowTarget::New => self.insert_fresh(ctx, req, shadow)?,
            RowTarget::Existing(loc) => self.insert_over_delete(ctx, req, loc, shadow)?,
        };
        let triggered = indexed + self.fire(ctx, h, None);
        Ok(Step::Complete(RowResponse {
            values,
            written_len: Some(written.count()),
            triggered,
            locator: Some(loc),
            op: Some(h),
            last_row: false,
        }))
    }

    /// Insert into a newly allocated slot.
    fn insert_fresh(
        &mut self,
        ctx: &mut OpContext<'_>,
        req: &RowRequest,
        mut shadow: ExpandedTuple,
    ) -> Result<(RowLocator, OpHandle, usize)> {
        let desc = Arc::clone(&self.desc);
        let group = self.config.undo_group();
        self.reserve_shadow()?;

        let undo_words = words_u32(shadow.disk_packed_words());
        if undo_words > 0 {
            if let Err(e) = ctx.undo.reserve(group, undo_words) {
                self.release_shadow();
                return Err(e);
            }
        }
        let loc = match self.allocate_row(ctx, &mut shadow) {
            Ok(loc) => loc,
            Err(e) => {
                if undo_words > 0 {
                    ctx.undo.release(group, undo_words);
                }
                self.release_shadow();
                return Err(e);
            }
        };

        seal_checksum(&desc, &mut shadow.fixed);
        let version = shadow.version();
        let var_ref = shadow.var_ref(&desc);
        let disk_ref = shadow.disk_ref(&desc);
        let mut d = OpDescriptor::new(OpKind::Insert, req.txn, req.savepoint, loc);
        d.version = version;
        d.undo_reserved = undo_words > 0;
        d.undo_words = undo_words;
        d.shadow = Some(shadow);
        let h = match self.link(loc, d) {
            Ok(h) => h,
            Err(e) => {
                self.release_row(ctx, loc, var_ref, disk_ref);
                if undo_words > 0 {
                    ctx.undo.release(group, undo_words);
                }
                self.release_shadow();
                return Err(e);
            }
        };
        let indexed = self.index_or_rollback(ctx, h, loc, version)?;
        tracing::debug!(partition = %self.id, row = %loc, txn = %req.txn, %version, "row inserted");
        Ok((loc, h, indexed))
    }

    /// Slot, disk slot and variable space for a fresh row, taken in that
    /// order and released in reverse on failure.
    fn allocate_row(&mut self, ctx: &mut OpContext<'_>, shadow: &mut ExpandedTuple) -> Result<RowLocator> {
        let desc = Arc::clone(&self.desc);
        let loc = self.store.alloc()?;
        let disk = if desc.has_disk() {
            match ctx
                .tablespace
                .preallocate_disk_slot(words_u32(desc.disk_max_words()))
            {
                Ok(d) => Some(d),
                Err(e) => {
                    self.unwind_slot(loc);
                    return Err(e);
                }
            }
        } else {
            None
        };
        if desc.has_mm_var() {
            let words = shadow.var.as_ref().map(VarSection::pack).unwrap_or_default();
            match self.var_area.alloc(&words, words.len()) {
                Ok(r) => shadow.set_var_ref(&desc, Some(r)),
                Err(e) => {
                    if let Some(d) = disk {
                        ctx.tablespace
                            .free_disk_slot(d, words_u32(desc.disk_max_words()));
                    }
                    self.unwind_slot(loc);
                    return Err(e);
                }
            }
        }
        if let Some(d) = disk {
            shadow.set_disk_ref(&desc, d);
        }
        Ok(loc)
    }

    fn unwind_slot(&mut self, loc: RowLocator) {
        if let Err(e) = self.store.free(loc) {
            tracing::warn!(row = %loc, error = %e, "slot release failed");
        }
    }

    /// Give back everything [`Self::allocate_row`] took.
    pub(crate) fn release_row(
        &mut self,
        ctx: &mut OpContext<'_>,
        loc: RowLocator,
        var_ref: Option<tupl_layout::VarRef>,
        disk_ref: Option<DiskRef>,
    ) {
        if let Some(r) = var_ref {
            if let Err(e) = self.var_area.free(r) {
                tracing::warn!(row = %loc, error = %e, "variable part release failed");
            }
        }
        if let Some(d) = disk_ref {
            ctx.tablespace
                .free_disk_slot(d, words_u32(self.desc.disk_max_words()));
            ctx.pages.remove_record(d);
        }
        if let Err(e) = self.store.free(loc) {
            tracing::warn!(row = %loc, error = %e, "slot release failed");
        }
    }

    /// Insert over a row the same transaction deleted. The row keeps its
    /// slot and storage; the new image follows the deleted version.
    fn insert_over_delete(
        &mut self,
        ctx: &mut OpContext<'_>,
        req: &RowRequest,
        loc: RowLocator,
        mut shadow: ExpandedTuple,
    ) -> Result<(RowLocator, OpHandle, usize)> {
        let desc = Arc::clone(&self.desc);
        let anchor = self.store.get(loc)?.anchor;
        self.check_owner(loc, anchor, req)?;
        let Some(del_h) = self.chains.last_write(anchor) else {
            return Err(TuplError::DuplicateInsert {
                row: loc.to_string(),
            });
        };
        self.chains.check_append(anchor, OpKind::Insert, loc)?;

        let deleted = self
            .chains
            .get(del_h)?
            .shadow
            .as_ref()
            .ok_or_else(|| TuplError::internal(format!("delete on {loc} kept no image")))?;
        let base_disk_words = deleted.disk_packed_words();
        let base_var_words = deleted.var_packed_words();
        shadow.set_version(deleted.version().next());
        shadow.set_var_ref(&desc, deleted.var_ref(&desc));
        if let Some(d) = deleted.disk_ref(&desc) {
            shadow.set_disk_ref(&desc, d);
        }

        let group = self.config.undo_group();
        self.reserve_shadow()?;
        let undo_words = words_u32(shadow.disk_packed_words().saturating_sub(base_disk_words));
        if undo_words > 0 {
            if let Err(e) = ctx.undo.reserve(group, undo_words) {
                self.release_shadow();
                return Err(e);
            }
        }
        if let Err(e) = self.fit_var_part(&mut shadow, base_var_words) {
            if undo_words > 0 {
                ctx.undo.release(group, undo_words);
            }
            self.release_shadow();
            return Err(e);
        }

        seal_checksum(&desc, &mut shadow.fixed);
        let version = shadow.version();
        let mut d = OpDescriptor::new(OpKind::Insert, req.txn, req.savepoint, loc);
        d.version = version;
        d.undo_reserved = undo_words > 0;
        d.undo_words = undo_words;
        d.shadow = Some(shadow);
        let h = match self.link(loc, d) {
            Ok(h) => h,
            Err(e) => {
                if undo_words > 0 {
                    ctx.undo.release(group, undo_words);
                }
                self.release_shadow();
                return Err(e);
            }
        };
        let indexed = self.index_or_rollback(ctx, h, loc, version)?;
        tracing::debug!(partition = %self.id, row = %loc, txn = %req.txn, %version, "row re-inserted over delete");
        Ok((loc, h, indexed))
    }

    // ── Update ──────────────────────────────────────────────────────────

    pub(crate) fn do_update(&mut self, ctx: &mut OpContext<'_>, req: &RowRequest) -> Result<Step> {
        let loc = existing(req)?;
        let anchor = self.store.get(loc)?.anchor;
        let source = self.mutation_source(loc, anchor, req)?;
        let carried_undo = match anchor {
            Some(h) => self.chains.get(h)?.undo_reserved,
            None => false,
        };
        let base = match source {
            Source::Shadow(h) => self.shadow_of(h)?,
            Source::Committed => {
                match self.load_committed(ctx, loc, true, AccessIntent::Write, req.disk_page_ready_hint)? {
                    Loaded::Ready(t) => t,
                    Loaded::Pending(ticket) => return Ok(Step::Suspended(ticket)),
                }
            }
        };

        let desc = Arc::clone(&self.desc);
        let mut shadow = base.clone();
        let (values, written, last_row) = match &req.payload {
            RowPayload::Attributes { reads, writes } => {
                let mask = update_attrs(&desc, &self.collations, &mut shadow, writes, WriteKind::Update)?;
                let values = read_attrs(&desc, &self.collations, &shadow, reads, self.budget(req), req.read_mode)?;
                (values, mask.count(), false)
            }
            RowPayload::Program(p) => {
                let out = self.run_program(req, &mut shadow, p, true)?;
                (out.values, out.written.count(), out.last_row)
            }
        };
        shadow.set_version(base.version().next());
        shadow.set_flags(TupleFlags::MM_GROWN | TupleFlags::MM_SHRINK, false);

        let group = self.config.undo_group();
        self.reserve_shadow()?;
        let before_disk = base.disk_packed_words();
        let after_disk = shadow.disk_packed_words();
        let undo_words =
            words_u32(if carried_undo { 0 } else { before_disk } + after_disk.saturating_sub(before_disk));
        if undo_words > 0 {
            if let Err(e) = ctx.undo.reserve(group, undo_words) {
                self.release_shadow();
                return Err(e);
            }
        }
        if let Err(e) = self.fit_var_part(&mut shadow, base.var_packed_words()) {
            if undo_words > 0 {
                ctx.undo.release(group, undo_words);
            }
            self.release_shadow();
            return Err(e);
        }

        seal_checksum(&desc, &mut shadow.fixed);
        let version = shadow.version();
        let mut d = OpDescriptor::new(OpKind::Update, req.txn, req.savepoint, loc);
        d.version = version;
        d.undo_reserved = undo_words > 0;
        d.undo_words = undo_words;
        d.shadow = Some(shadow);
        let h = match self.link(loc, d) {
            Ok(h) => h,
            Err(e) => {
                if undo_words > 0 {
                    ctx.undo.release(group, undo_words);
                }
                self.release_shadow();
                return Err(e);
            }
        };
        let indexed = self.index_or_rollback(ctx, h, loc, version)?;
        let triggered = indexed + self.fire(ctx, h, Some(&base));
        tracing::debug!(partition = %self.id, row = %loc, txn = %req.txn, %version, written, "row updated");
        Ok(Step::Complete(RowResponse {
            values,
            written_len: Some(written),
            triggered,
            locator: Some(loc),
            op: Some(h),
            last_row,
        }))
    }

    /// Make room in the variable area for the shadow's variable part and
    /// record the size change in its flags.
    fn fit_var_part(&mut self, shadow: &mut ExpandedTuple, had_words: usize) -> Result<()> {
        let Some(home) = shadow.var_ref(&self.desc) else {
            return Ok(());
        };
        let need = shadow.var_packed_words();
        match self.var_area.ensure_capacity(home, need)? {
            SizeChange::Fits => {}
            SizeChange::GrewInPlace => shadow.set_flags(TupleFlags::MM_GROWN, true),
            SizeChange::Migrated { to } => {
                shadow.set_flags(TupleFlags::MM_GROWN | TupleFlags::VAR_RELOCATED, true);
                self.stats.var_migrations += 1;
                tracing::debug!(partition = %self.id, %home, %to, words = need, "variable part relocated");
            }
        }
        if need < had_words {
            shadow.set_flags(TupleFlags::MM_SHRINK, true);
        }
        Ok(())
    }

    // ── Delete ──────────────────────────────────────────────────────────

    pub(crate) fn do_delete(&mut self, ctx: &mut OpContext<'_>, req: &RowRequest) -> Result<Step> {
        let loc = existing(req)?;
        let anchor = self.store.get(loc)?.anchor;
        let source = self.mutation_source(loc, anchor, req)?;
        let carried_undo = match anchor {
            Some(h) => self.chains.get(h)?.undo_reserved,
            None => false,
        };
        let mut base = match source {
            Source::Shadow(h) => self.shadow_of(h)?,
            Source::Committed => {
                match self.load_committed(ctx, loc, true, AccessIntent::Write, req.disk_page_ready_hint)? {
                    Loaded::Ready(t) => t,
                    Loaded::Pending(ticket) => return Ok(Step::Suspended(ticket)),
                }
            }
        };

        let (values, last_row) = match &req.payload {
            RowPayload::Attributes { reads, writes } => {
                if !writes.is_empty() {
                    return Err(TuplError::Unsupported("a delete cannot write attributes".to_owned()));
                }
                let values = read_attrs(&self.desc, &self.collations, &base, reads, self.budget(req), req.read_mode)?;
                (values, false)
            }
            RowPayload::Program(p) => {
                let mut scratch = base.clone();
                let out = self.run_program(req, &mut scratch, p, false)?;
                (out.values, out.last_row)
            }
        };

        let group = self.config.undo_group();
        self.reserve_shadow()?;
        let undo_words = if carried_undo {
            0
        } else {
            words_u32(base.disk_packed_words())
        };
        if undo_words > 0 {
            if let Err(e) = ctx.undo.reserve(group, undo_words) {
                self.release_shadow();
                return Err(e);
            }
        }

        let version = base.version();
        base.set_flags(TupleFlags::MM_GROWN | TupleFlags::MM_SHRINK, false);
        let mut d = OpDescriptor::new(OpKind::Delete, req.txn, req.savepoint, loc);
        d.version = version;
        d.undo_reserved = undo_words > 0;
        d.undo_words = undo_words;
        d.shadow = Some(base);
        let h = match self.link(loc, d) {
            Ok(h) => h,
            Err(e) => {
                if undo_words > 0 {
                    ctx.undo.release(group, undo_words);
                }
                self.release_shadow();
                return Err(e);
            }
        };
        let triggered = self.fire(ctx, h, None);
        tracing::debug!(partition = %self.id, row = %loc, txn = %req.txn, %version, "row deleted");
        Ok(Step::Complete(RowResponse {
            values,
            written_len: Some(0),
            triggered,
            locator: Some(loc),
            op: Some(h),
            last_row,
        }))
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Newest image this transaction wrote, or the committed row.
    fn mutation_source(
        &self,
        loc: RowLocator,
        anchor: Option<OpHandle>,
        req: &RowRequest,
    ) -> Result<Source> {
        self.check_owner(loc, anchor, req)?;
        match self.chains.last_write(anchor) {
            Some(h) if self.chains.get(h)?.kind == OpKind::Delete => Err(TuplError::RowAlreadyDeleted {
                row: loc.to_string(),
            }),
            Some(h) => Ok(Source::Shadow(h)),
            None => Ok(Source::Committed),
        }
    }

    /// Only the transaction holding the row's chain may touch it.
    fn check_owner(&self, loc: RowLocator, anchor: Option<OpHandle>, req: &RowRequest) -> Result<()> {
        if let Some(newest) = anchor {
            let holder = self.chains.get(newest)?.txn;
            if holder != req.txn {
                return Err(TuplError::RowLocked {
                    row: loc.to_string(),
                    holder: holder.to_string(),
                });
            }
        }
        Ok(())
    }

    fn shadow_of(&self, h: OpHandle) -> Result<ExpandedTuple> {
        self.chains
            .get(h)?
            .shadow
            .clone()
            .ok_or_else(|| TuplError::internal(format!("{h} holds no row image")))
    }

    fn run_program(
        &self,
        req: &RowRequest,
        tuple: &mut ExpandedTuple,
        program: &InterpretedProgram,
        allow_writes: bool,
    ) -> Result<InterpOutcome> {
        let out = self.interp.run(
            &self.desc,
            &self.collations,
            tuple,
            program,
            RunOptions {
                allow_writes,
                budget_words: self.budget(req),
                read_mode: req.read_mode,
            },
        )?;
        tracing::trace!(txn = %req.txn, instructions = out.instructions, last_row = out.last_row, "program finished");
        Ok(out)
    }

    /// Add index entries for a just-linked write, undoing the operation if
    /// an index rejects it.
    fn index_or_rollback(
        &mut self,
        ctx: &mut OpContext<'_>,
        h: OpHandle,
        loc: RowLocator,
        version: tupl_types::TupleVersion,
    ) -> Result<usize> {
        match self.add_index_entries(loc, version) {
            Ok(n) => Ok(n),
            Err(e) => {
                let txn = self.chains.get(h)?.txn;
                if let Some(ops) = self.txn_ops.get_mut(&txn) {
                    ops.retain(|o| *o != h);
                    if ops.is_empty() {
                        self.txn_ops.remove(&txn);
                    }
                }
                self.abort_op(ctx, h, false)?;
                tracing::debug!(row = %loc, %version, error = %e, "write rolled back after index failure");
                Err(e)
            }
        }
    }

    /// Deliver the trigger event of the write `h`. `before` is the image
    /// an update started from. Returns the deliveries made.
    fn fire(&mut self, ctx: &mut OpContext<'_>, h: OpHandle, before: Option<&ExpandedTuple>) -> usize {
        if !self.config.primary_replica {
            return 0;
        }
        match self.trigger_event(h, before) {
            Ok(event) => self.deliver(ctx, event),
            Err(e) => {
                self.stats.trigger_failures += 1;
                tracing::warn!(partition = %self.id, op = %h, error = %e, "trigger event not built");
                0
            }
        }
    }

    fn trigger_event(&self, h: OpHandle, before: Option<&ExpandedTuple>) -> Result<TriggerEvent> {
        let desc = &self.desc;
        let d = self.chains.get(h)?;
        let image = d
            .shadow
            .as_ref()
            .ok_or_else(|| TuplError::internal(format!("{h} holds no row image")))?;
        let (before, after) = match (d.kind, before) {
            (OpKind::Delete, _) => (Some(read_all(desc, image)?), None),
            (OpKind::Update, Some(base)) => {
                let (b, a) = changed_images(desc, read_all(desc, base)?, read_all(desc, image)?);
                (Some(b), Some(a))
            }
            _ => (None, Some(read_all(desc, image)?)),
        };
        Ok(TriggerEvent {
            kind: d.kind,
            row: d.locator,
            txn: d.txn,
            version: d.version,
            primary_key: primary_key_image(desc, image)?,
            before,
            after,
        })
    }
}

/// Drop disk attributes whose value did not change from both images.
fn changed_images(
    desc: &tupl_layout::TableDescriptor,
    before: Vec<AttrValue>,
    after: Vec<AttrValue>,
) -> (Vec<AttrValue>, Vec<AttrValue>) {
    before
        .into_iter()
        .zip(after)
        .filter(|(b, a)| {
            let on_disk = desc.attr(a.id).is_ok_and(|attr| attr.codec.is_disk());
            !on_disk || b != a
        })
        .unzip()
}

fn existing(req: &RowRequest) -> Result<RowLocator> {
    match req.target {
        RowTarget::Existing(loc) => Ok(loc),
        RowTarget::New => Err(TuplError::Unsupported(format!(
            "{} needs an existing row",
            req.kind
        ))),
    }
}

fn not_found(loc: RowLocator) -> TuplError {
    TuplError::RowNotFound {
        row: loc.to_string(),
    }
}
