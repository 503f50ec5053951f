//! One partition: its slots, variable area, version chains and the request
//! entry point.
//!
//! A partition is owned by a single execution context. Nothing in it is
//! locked; concurrency across partitions comes from running independent
//! contexts, and within a partition from cooperative suspension on disk
//! page fetches.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;
use tupl_error::{Result, TuplError};
use tupl_interp::Interpreter;
use tupl_layout::{
    CollationRegistry, DiskSection, ExpandedTuple, HEADER_WORD, PackedTuple, TableDescriptor,
    TupleFlags, TupleHeader, VarRef, expand, read_all, seal_checksum, verify_checksum,
};
use tupl_mvcc::{OpDescriptor, OpHandle, VersionChains};
use tupl_types::{AttrValue, DiskRef, OpKind, PartitionId, RowLocator, TupleVersion, TxnId};

use crate::collab::{AccessIntent, FetchTicket, IndexHook, PageFetch, TriggerEvent};
use crate::config::EngineConfig;
use crate::context::OpContext;
use crate::request::{RowPayload, RowRequest, RowTarget, Step};
use crate::stats::PartitionStats;
use crate::store::TupleStore;
use crate::var_area::VarArea;

/// A request parked on a page fetch.
#[derive(Debug)]
pub(crate) struct Suspended {
    pub(crate) request: RowRequest,
    /// Unlinked descriptor holding the fetch-pending state.
    pub(crate) op: OpHandle,
}

/// A suspended request that ran again after its page arrived.
#[derive(Debug)]
pub struct Resumed {
    pub ticket: FetchTicket,
    pub txn: TxnId,
    pub result: Result<Step>,
}

/// Either a value or the fetch it is waiting on.
pub(crate) enum Loaded<T> {
    Ready(T),
    Pending(FetchTicket),
}

/// Single-threaded owner of one table partition.
pub struct Partition {
    pub(crate) id: PartitionId,
    pub(crate) desc: Arc<TableDescriptor>,
    pub(crate) collations: Arc<CollationRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) interp: Interpreter,
    pub(crate) store: TupleStore,
    pub(crate) var_area: VarArea,
    pub(crate) chains: VersionChains<ExpandedTuple>,
    /// Operations of each open transaction in admission order.
    pub(crate) txn_ops: HashMap<TxnId, Vec<OpHandle>>,
    pub(crate) suspended: HashMap<FetchTicket, SmallVec<[Suspended; 1]>>,
    pub(crate) indexes: Vec<Box<dyn IndexHook>>,
    pub(crate) shadows: usize,
    pub(crate) stats: PartitionStats,
}

impl Partition {
    pub fn new(
        id: PartitionId,
        desc: Arc<TableDescriptor>,
        collations: Arc<CollationRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        let config = config.validated();
        for attr in desc.attrs() {
            if let Some(c) = attr.collation {
                if !collations.contains(c) {
                    return Err(TuplError::schema(format!(
                        "{} uses unregistered {c}",
                        attr.id
                    )));
                }
            }
        }
        tracing::info!(
            partition = %id,
            table = desc.name(),
            attrs = desc.attrs().len(),
            fixed_words = desc.fixed_words(),
            disk = desc.has_disk(),
            "partition created"
        );
        Ok(Self {
            id,
            store: TupleStore::new(
                desc.fixed_words(),
                config.slots_per_page,
                config.slot_pool_capacity,
            ),
            var_area: VarArea::new(config.var_page_words, config.var_page_limit),
            interp: Interpreter::new(config.interp_limits()),
            desc,
            collations,
            config,
            chains: VersionChains::new(),
            txn_ops: HashMap::new(),
            suspended: HashMap::new(),
            indexes: Vec::new(),
            shadows: 0,
            stats: PartitionStats::default(),
        })
    }

    /// Register a secondary index to maintain.
    pub fn add_index(&mut self, hook: Box<dyn IndexHook>) {
        tracing::debug!(partition = %self.id, index = hook.name(), "index hook added");
        self.indexes.push(hook);
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.desc
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &PartitionStats {
        &self.stats
    }

    /// Open operation descriptors, suspended ones included.
    pub fn open_ops(&self) -> usize {
        self.chains.open_ops()
    }

    pub fn allocated_rows(&self) -> usize {
        self.store.allocated()
    }

    pub fn shadow_copies(&self) -> usize {
        self.shadows
    }

    pub fn suspended_requests(&self) -> usize {
        self.suspended.values().map(SmallVec::len).sum()
    }

    pub fn chain_len(&self, loc: RowLocator) -> Result<usize> {
        Ok(self.chains.chain_len(self.store.get(loc)?.anchor))
    }

    pub fn var_area(&self) -> &VarArea {
        &self.var_area
    }

    pub fn store(&self) -> &TupleStore {
        &self.store
    }

    /// Raw slot access for repair tooling.
    pub fn store_mut(&mut self) -> &mut TupleStore {
        &mut self.store
    }

    /// Every attribute of the committed row, disk part included.
    pub fn read_committed(&mut self, ctx: &mut OpContext<'_>, loc: RowLocator) -> Result<Vec<AttrValue>> {
        match self.load_committed(ctx, loc, true, AccessIntent::Read, true)? {
            Loaded::Ready(t) => read_all(&self.desc, &t),
            Loaded::Pending(_) => Err(TuplError::PageNotResident {
                page: loc.to_string(),
            }),
        }
    }

    /// Verify link symmetry of every chain and the shadow accounting.
    pub fn check_consistency(&self) -> Result<()> {
        let mut linked = 0usize;
        for loc in self.store.rows() {
            let anchor = self.store.get(loc)?.anchor;
            self.chains.check_chain(anchor)?;
            for h in self.chains.iter_chain(anchor) {
                if self.chains.get(h)?.locator != loc {
                    return Err(TuplError::internal(format!("{h} linked on foreign row {loc}")));
                }
                linked += 1;
            }
        }
        let parked = self.suspended_requests();
        if linked + parked != self.chains.open_ops() {
            return Err(TuplError::internal(format!(
                "{} open operations but {linked} linked and {parked} suspended",
                self.chains.open_ops()
            )));
        }
        Ok(())
    }

    // ── Request entry point ─────────────────────────────────────────────

    /// Run one row request to completion or suspension.
    pub fn execute(&mut self, ctx: &mut OpContext<'_>, req: RowRequest) -> Result<Step> {
        if req.partition != self.id {
            return Err(TuplError::WrongPartition {
                requested: req.partition.get(),
                owned: self.id.get(),
            });
        }
        tracing::debug!(
            partition = %self.id,
            kind = %req.kind,
            txn = %req.txn,
            savepoint = %req.savepoint,
            target = ?req.target,
            "row request"
        );
        let result = match req.kind {
            OpKind::Read => self.do_read(ctx, &req),
            OpKind::Insert => self.do_insert(ctx, &req),
            OpKind::Update => self.do_update(ctx, &req),
            OpKind::Delete => self.do_delete(ctx, &req),
        };
        match &result {
            Ok(Step::Complete(_)) => match req.kind {
                OpKind::Read => self.stats.reads += 1,
                OpKind::Insert => self.stats.inserts += 1,
                OpKind::Update => self.stats.updates += 1,
                OpKind::Delete => self.stats.deletes += 1,
            },
            Ok(Step::Suspended(ticket)) => {
                let ticket = *ticket;
                self.park(req, ticket)?;
            }
            Err(e) => {
                self.stats.failed_requests += 1;
                if matches!(e, TuplError::InterpreterRefused { .. }) {
                    self.stats.refused += 1;
                }
                tracing::debug!(partition = %self.id, error = %e, "row request failed");
            }
        }
        result
    }

    fn park(&mut self, request: RowRequest, ticket: FetchTicket) -> Result<()> {
        let RowTarget::Existing(loc) = request.target else {
            return Err(TuplError::internal("request for a new row waited on a page"));
        };
        let mut d = OpDescriptor::new(request.kind, request.txn, request.savepoint, loc);
        d.disk_fetch_pending = true;
        let op = self.chains.prepare(d);
        self.stats.suspensions += 1;
        tracing::debug!(partition = %self.id, row = %loc, %ticket, %op, "request suspended on page fetch");
        self.suspended
            .entry(ticket)
            .or_default()
            .push(Suspended { request, op });
        Ok(())
    }

    /// Resume every request whose page fetch completed.
    pub fn drive_ready(&mut self, ctx: &mut OpContext<'_>) -> Vec<Resumed> {
        let ready = ctx.pages.poll_ready();
        self.resume_tickets(ctx, &ready)
    }

    /// Resume the requests parked on any of `tickets`.
    pub fn resume_tickets(&mut self, ctx: &mut OpContext<'_>, tickets: &[FetchTicket]) -> Vec<Resumed> {
        let mut out = Vec::new();
        for &ticket in tickets {
            let Some(waiters) = self.suspended.remove(&ticket) else {
                continue;
            };
            for w in waiters {
                let _ = self.chains.discard(w.op);
                let mut request = w.request;
                request.disk_page_ready_hint = true;
                let txn = request.txn;
                self.stats.resumptions += 1;
                let result = self.execute(ctx, request);
                out.push(Resumed {
                    ticket,
                    txn,
                    result,
                });
            }
        }
        out
    }

    /// Drop suspended requests of `txn`.
    pub(crate) fn cancel_suspended(&mut self, txn: TxnId) -> usize {
        let mut cancelled = Vec::new();
        for waiters in self.suspended.values_mut() {
            let mut i = 0;
            while i < waiters.len() {
                if waiters[i].request.txn == txn {
                    cancelled.push(waiters.remove(i).op);
                } else {
                    i += 1;
                }
            }
        }
        self.suspended.retain(|_, w| !w.is_empty());
        for op in &cancelled {
            let _ = self.chains.discard(*op);
        }
        cancelled.len()
    }

    // ── Shared helpers ──────────────────────────────────────────────────

    pub(crate) fn budget(&self, req: &RowRequest) -> usize {
        req.output_budget
            .unwrap_or(self.config.default_output_budget_words)
    }

    /// Whether serving `payload` needs the disk mirror in memory.
    pub(crate) fn payload_needs_disk(&self, payload: &RowPayload) -> bool {
        if !self.desc.has_disk() {
            return false;
        }
        match payload {
            RowPayload::Attributes { reads, .. } => reads
                .iter()
                .any(|id| self.desc.attr(*id).is_ok_and(|a| a.codec.is_disk())),
            RowPayload::Program(_) => true,
        }
    }

    pub(crate) fn reserve_shadow(&mut self) -> Result<()> {
        if self.shadows >= self.config.max_shadow_copies {
            return Err(TuplError::ShadowMemoryExhausted {
                in_use: self.shadows,
                limit: self.config.max_shadow_copies,
            });
        }
        self.shadows += 1;
        Ok(())
    }

    pub(crate) fn release_shadow(&mut self) {
        self.shadows = self.shadows.saturating_sub(1);
    }

    /// Expand the committed tuple of `loc`, verifying its checksum and
    /// loading the disk mirror when `need_disk` is set.
    pub(crate) fn load_committed(
        &mut self,
        ctx: &mut OpContext<'_>,
        loc: RowLocator,
        need_disk: bool,
        intent: AccessIntent,
        hint: bool,
    ) -> Result<Loaded<ExpandedTuple>> {
        let slot = self.store.get(loc)?;
        if let Err(e) = verify_checksum(&self.desc, &slot.fixed, loc) {
            self.stats.checksum_failures += 1;
            return Err(e);
        }
        let fixed = slot.fixed.clone();
        let var = match self.desc.var_ref_offset() {
            Some(at) => {
                let r = VarRef::from_word(fixed[at])
                    .ok_or_else(|| TuplError::malformed(format!("row {loc} has no variable part")))?;
                Some(self.var_area.read(r)?)
            }
            None => None,
        };
        let mut tuple = expand(
            &self.desc,
            &PackedTuple {
                fixed,
                var,
                disk: None,
            },
        )?;
        if need_disk {
            if let Some(disk) = tuple.disk_ref(&self.desc) {
                match self.fetch_disk(ctx, disk, intent, hint)? {
                    Loaded::Ready(section) => tuple.disk = Some(section),
                    Loaded::Pending(t) => return Ok(Loaded::Pending(t)),
                }
            }
        }
        Ok(Loaded::Ready(tuple))
    }

    fn fetch_disk(
        &self,
        ctx: &mut OpContext<'_>,
        disk: DiskRef,
        intent: AccessIntent,
        hint: bool,
    ) -> Result<Loaded<DiskSection>> {
        if hint {
            match ctx.pages.read_record(disk) {
                Ok(Some(words)) => return DiskSection::unpack(&self.desc, &words).map(Loaded::Ready),
                Ok(None) => return Err(missing_record(disk)),
                Err(TuplError::PageNotResident { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if let PageFetch::Pending(ticket) = ctx.pages.get_page(disk.page_ref(), intent)? {
            return Ok(Loaded::Pending(ticket));
        }
        let words = ctx.pages.read_record(disk)?.ok_or_else(|| missing_record(disk))?;
        DiskSection::unpack(&self.desc, &words).map(Loaded::Ready)
    }

    /// Prepare and link a descriptor on `loc`'s chain and record it under
    /// its transaction.
    pub(crate) fn link(
        &mut self,
        loc: RowLocator,
        desc: OpDescriptor<ExpandedTuple>,
    ) -> Result<OpHandle> {
        let txn = desc.txn;
        let h = self.chains.prepare(desc);
        let slot = match self.store.slot_mut(loc) {
            Ok(s) => s,
            Err(e) => {
                let _ = self.chains.discard(h);
                return Err(e);
            }
        };
        if let Err(e) = self.chains.append(&mut slot.anchor, h) {
            let _ = self.chains.discard(h);
            return Err(e);
        }
        self.txn_ops.entry(txn).or_default().push(h);
        Ok(h)
    }

    /// Add `(loc, version)` to every index, undoing the ones already done
    /// if any hook fails.
    pub(crate) fn add_index_entries(&mut self, loc: RowLocator, version: TupleVersion) -> Result<usize> {
        for i in 0..self.indexes.len() {
            if let Err(e) = self.indexes[i].add_entry(loc, version) {
                self.stats.index_failures += 1;
                let e = match e {
                    TuplError::IndexMaintenance { .. } => e,
                    other => TuplError::IndexMaintenance {
                        index: self.indexes[i].name().to_owned(),
                        detail: other.to_string(),
                    },
                };
                for hook in &mut self.indexes[..i] {
                    if let Err(undo) = hook.remove_entry(loc, version) {
                        tracing::warn!(index = hook.name(), row = %loc, error = %undo, "index rollback failed");
                    }
                }
                return Err(e);
            }
        }
        Ok(self.indexes.len())
    }

    pub(crate) fn remove_index_entries(&mut self, loc: RowLocator, version: TupleVersion) {
        for hook in &mut self.indexes {
            if let Err(e) = hook.remove_entry(loc, version) {
                self.stats.index_failures += 1;
                tracing::warn!(index = hook.name(), row = %loc, %version, error = %e, "index entry removal failed");
            }
        }
    }

    /// Hand `event` to the trigger sink on the primary replica. Returns the
    /// number of deliveries made.
    pub(crate) fn deliver(&mut self, ctx: &mut OpContext<'_>, event: TriggerEvent) -> usize {
        if !self.config.primary_replica {
            return 0;
        }
        let row = event.row;
        match ctx.triggers.deliver(event) {
            Ok(()) => 1,
            Err(e) => {
                self.stats.trigger_failures += 1;
                tracing::warn!(partition = %self.id, %row, error = %e, "trigger delivery failed");
                0
            }
        }
    }

    /// Bring the committed header's relocation flag in line with the
    /// variable area.
    pub(crate) fn sync_relocated(&mut self, loc: RowLocator) -> Result<()> {
        let Some(at) = self.desc.var_ref_offset() else {
            return Ok(());
        };
        let desc = Arc::clone(&self.desc);
        let slot = self.store.slot_mut(loc)?;
        if verify_checksum(&desc, &slot.fixed, loc).is_err() {
            return Ok(());
        }
        let Some(home) = VarRef::from_word(slot.fixed[at]) else {
            return Ok(());
        };
        let relocated = self.var_area.resolve(home)? != home;
        let mut header = TupleHeader::from_word(slot.fixed[HEADER_WORD]);
        if header.flags.contains(TupleFlags::VAR_RELOCATED) != relocated {
            header.flags.set(TupleFlags::VAR_RELOCATED, relocated);
            slot.fixed[HEADER_WORD] = header.to_word();
            seal_checksum(&desc, &mut slot.fixed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("table", &self.desc.name())
            .field("rows", &self.store.allocated())
            .field("open_ops", &self.chains.open_ops())
            .field("shadows", &self.shadows)
            .field("indexes", &self.indexes.len())
            .finish_non_exhaustive()
    }
}

fn missing_record(disk: DiskRef) -> TuplError {
    TuplError::malformed(format!("disk record {disk} was never written"))
}

/// Saturating word count for collaborator calls.
pub(crate) fn words_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
