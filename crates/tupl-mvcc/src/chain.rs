//! Per-slot version chains.
//!
//! The physical tuple holds an anchor: the handle of the most recently
//! appended operation. Following `prev` from the anchor visits every open
//! operation newest to oldest and ends at the operation that sits directly
//! on the committed state.

use tupl_error::{Result, TuplError};
use tupl_types::{OpKind, RowLocator, Savepoint, TupleVersion, TxnId};

use crate::arena::{OpArena, OpHandle};

// ---------------------------------------------------------------------------
// OpDescriptor
// ---------------------------------------------------------------------------

/// One row-level operation of a transaction.
///
/// `S` is the shadow post-image type owned by the mutation engine.
#[derive(Debug, Clone)]
pub struct OpDescriptor<S> {
    pub kind: OpKind,
    pub txn: TxnId,
    pub savepoint: Savepoint,
    pub locator: RowLocator,
    pub shadow: Option<S>,
    pub version: TupleVersion,
    /// Delete followed by insert within one transaction.
    pub collapsed: bool,
    pub disk_fetch_pending: bool,
    pub undo_reserved: bool,
    /// Undo words this operation reserved itself.
    pub undo_words: u32,
    /// Undo words reserved by earlier operations on the chain.
    pub inherited_undo_words: u32,
    prev: Option<OpHandle>,
    next: Option<OpHandle>,
    linked: bool,
}

impl<S> OpDescriptor<S> {
    pub fn new(kind: OpKind, txn: TxnId, savepoint: Savepoint, locator: RowLocator) -> Self {
        Self {
            kind,
            txn,
            savepoint,
            locator,
            shadow: None,
            version: TupleVersion::default(),
            collapsed: false,
            disk_fetch_pending: false,
            undo_reserved: false,
            undo_words: 0,
            inherited_undo_words: 0,
            prev: None,
            next: None,
            linked: false,
        }
    }

    #[inline]
    pub fn prev(&self) -> Option<OpHandle> {
        self.prev
    }

    #[inline]
    pub fn next(&self) -> Option<OpHandle> {
        self.next
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub txn: TxnId,
    pub savepoint: Savepoint,
    pub dirty_read: bool,
}

/// Which version a requester observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// The committed physical tuple.
    Committed,
    /// The shadow image of this open operation.
    Pending(OpHandle),
    /// The requester's own transaction deleted the row.
    Deleted,
    /// The row was inserted by an operation the requester cannot see yet.
    InsertedNotVisible,
    /// Another transaction holds an open operation on the row.
    Locked { holder: TxnId },
}

/// How an operation leaves its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    Abort,
}

/// What the chain looked like around an operation when it left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnlinkOutcome {
    pub has_successor: bool,
    pub has_predecessor: bool,
    /// Aborted insert with nothing else on the chain: the slot can go.
    pub free_slot: bool,
    pub chain_empty: bool,
}

/// Descriptor released by [`VersionChains::unlink`].
#[derive(Debug)]
pub struct Unlinked<S> {
    pub descriptor: OpDescriptor<S>,
    pub outcome: UnlinkOutcome,
}

// ---------------------------------------------------------------------------
// VersionChains
// ---------------------------------------------------------------------------

/// Owner of every operation descriptor of a partition.
#[derive(Debug)]
pub struct VersionChains<S> {
    arena: OpArena<OpDescriptor<S>>,
}

impl<S> Default for VersionChains<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> VersionChains<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: OpArena::new(),
        }
    }

    /// Admit an operation without linking it.
    pub fn prepare(&mut self, desc: OpDescriptor<S>) -> OpHandle {
        self.arena.alloc(desc)
    }

    /// Drop an operation that never got linked.
    pub fn discard(&mut self, h: OpHandle) -> Result<OpDescriptor<S>> {
        if self.get(h)?.linked {
            return Err(TuplError::internal(format!("{h} is linked, unlink it instead")));
        }
        self.arena.free(h).ok_or_else(|| no_such(h))
    }

    pub fn get(&self, h: OpHandle) -> Result<&OpDescriptor<S>> {
        self.arena.get(h).ok_or_else(|| no_such(h))
    }

    pub fn get_mut(&mut self, h: OpHandle) -> Result<&mut OpDescriptor<S>> {
        self.arena.get_mut(h).ok_or_else(|| no_such(h))
    }

    #[inline]
    pub fn contains(&self, h: OpHandle) -> bool {
        self.arena.contains(h)
    }

    /// Open operations across every chain (linked or only prepared).
    #[inline]
    pub fn open_ops(&self) -> usize {
        self.arena.len()
    }

    /// Handles from newest to oldest.
    pub fn iter_chain(&self, anchor: Option<OpHandle>) -> ChainIter<'_, S> {
        ChainIter {
            chains: self,
            cursor: anchor,
        }
    }

    pub fn chain_len(&self, anchor: Option<OpHandle>) -> usize {
        self.iter_chain(anchor).count()
    }

    /// Newest operation on the chain that is not a read.
    pub fn last_write(&self, anchor: Option<OpHandle>) -> Option<OpHandle> {
        self.iter_chain(anchor)
            .find(|h| self.arena.get(*h).is_some_and(|d| d.kind.is_write()))
    }

    /// Oldest operation on the chain that is not a read.
    pub fn first_write(&self, anchor: Option<OpHandle>) -> Option<OpHandle> {
        self.iter_chain(anchor)
            .filter(|h| self.arena.get(*h).is_some_and(|d| d.kind.is_write()))
            .last()
    }

    /// Whether `kind` may follow the current chain.
    pub fn check_append(
        &self,
        anchor: Option<OpHandle>,
        kind: OpKind,
        locator: RowLocator,
    ) -> Result<()> {
        let Some(last) = self.last_write(anchor) else {
            return Ok(());
        };
        match (self.get(last)?.kind, kind) {
            (OpKind::Delete, OpKind::Insert) => Ok(()),
            (OpKind::Delete, _) => Err(TuplError::RowAlreadyDeleted {
                row: locator.to_string(),
            }),
            (OpKind::Insert | OpKind::Update, OpKind::Insert) => Err(TuplError::DuplicateInsert {
                row: locator.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Link a prepared operation as the newest entry of the chain.
    pub fn append(&mut self, anchor: &mut Option<OpHandle>, h: OpHandle) -> Result<()> {
        let (kind, locator) = {
            let d = self.get(h)?;
            if d.linked {
                return Err(TuplError::internal(format!("{h} already linked")));
            }
            (d.kind, d.locator)
        };
        self.check_append(*anchor, kind, locator)?;

        let collapse_with = match self.last_write(*anchor) {
            Some(last) if kind == OpKind::Insert && self.get(last)?.kind == OpKind::Delete => {
                Some(last)
            }
            _ => None,
        };
        if let Some(del) = collapse_with {
            self.get_mut(del)?.collapsed = true;
        }

        let (fetch, reserved, carried) = match *anchor {
            Some(prev) => {
                let p = self.get_mut(prev)?;
                p.next = Some(h);
                (
                    p.disk_fetch_pending,
                    p.undo_reserved,
                    p.undo_words + p.inherited_undo_words,
                )
            }
            None => (false, false, 0),
        };
        let d = self.get_mut(h)?;
        d.prev = *anchor;
        d.next = None;
        d.linked = true;
        d.collapsed |= collapse_with.is_some();
        d.disk_fetch_pending |= fetch;
        d.undo_reserved |= reserved;
        d.inherited_undo_words = carried;
        *anchor = Some(h);

        tracing::debug!(
            op = %h,
            kind = %kind,
            row = %locator,
            collapsed = collapse_with.is_some(),
            "appended operation to version chain"
        );
        Ok(())
    }

    /// Decide which version `req` observes.
    pub fn select_visible(&self, anchor: Option<OpHandle>, req: &Requester) -> Result<Visibility> {
        let Some(newest) = anchor else {
            return Ok(Visibility::Committed);
        };
        let owner = self.get(newest)?.txn;

        if owner != req.txn {
            if !req.dirty_read {
                return Ok(Visibility::Locked { holder: owner });
            }
            return Ok(match self.first_write(anchor) {
                Some(first) if self.get(first)?.kind == OpKind::Insert => {
                    Visibility::InsertedNotVisible
                }
                _ => Visibility::Committed,
            });
        }

        for h in self.iter_chain(anchor) {
            let d = self.get(h)?;
            if !d.kind.is_write() || d.savepoint > req.savepoint {
                continue;
            }
            return Ok(if d.kind == OpKind::Delete {
                Visibility::Deleted
            } else {
                Visibility::Pending(h)
            });
        }
        Ok(match self.first_write(anchor) {
            Some(first) if self.get(first)?.kind == OpKind::Insert => {
                Visibility::InsertedNotVisible
            }
            _ => Visibility::Committed,
        })
    }

    /// Remove an operation from its chain and release its descriptor.
    pub fn unlink(
        &mut self,
        anchor: &mut Option<OpHandle>,
        h: OpHandle,
        disposition: Disposition,
    ) -> Result<Unlinked<S>> {
        let (prev, next, kind) = {
            let d = self.get(h)?;
            if !d.linked {
                return Err(TuplError::internal(format!("{h} is not linked")));
            }
            (d.prev, d.next, d.kind)
        };

        if let Some(p) = prev {
            self.get_mut(p)?.next = next;
        }
        match next {
            Some(n) => self.get_mut(n)?.prev = prev,
            None => {
                if *anchor != Some(h) {
                    return Err(TuplError::internal(format!(
                        "{h} is the chain tail but the anchor points elsewhere"
                    )));
                }
                *anchor = prev;
            }
        }

        let mut descriptor = self.arena.free(h).ok_or_else(|| no_such(h))?;
        descriptor.linked = false;

        if disposition == Disposition::Abort && kind == OpKind::Insert && descriptor.collapsed {
            if let Some(p) = prev {
                self.get_mut(p)?.collapsed = false;
            }
        }

        let outcome = UnlinkOutcome {
            has_successor: next.is_some(),
            has_predecessor: prev.is_some(),
            free_slot: disposition == Disposition::Abort
                && kind == OpKind::Insert
                && prev.is_none()
                && next.is_none(),
            chain_empty: anchor.is_none(),
        };
        tracing::debug!(
            op = %h,
            kind = %kind,
            row = %descriptor.locator,
            ?disposition,
            free_slot = outcome.free_slot,
            "unlinked operation"
        );
        Ok(Unlinked {
            descriptor,
            outcome,
        })
    }

    /// Verify link symmetry of one chain.
    pub fn check_chain(&self, anchor: Option<OpHandle>) -> Result<()> {
        let mut expected_next = None;
        let mut cursor = anchor;
        let mut steps = 0usize;
        while let Some(h) = cursor {
            let d = self.get(h)?;
            if !d.linked {
                return Err(TuplError::internal(format!("{h} on chain but not linked")));
            }
            if d.next != expected_next {
                return Err(TuplError::internal(format!("{h} has a broken next link")));
            }
            steps += 1;
            if steps > self.arena.len() {
                return Err(TuplError::internal("version chain has a cycle"));
            }
            expected_next = Some(h);
            cursor = d.prev;
        }
        Ok(())
    }
}

fn no_such(h: OpHandle) -> TuplError {
    TuplError::NoSuchOperation { op: h.to_string() }
}

/// Iterator over a chain, newest first.
pub struct ChainIter<'a, S> {
    chains: &'a VersionChains<S>,
    cursor: Option<OpHandle>,
}

impl<S> Iterator for ChainIter<'_, S> {
    type Item = OpHandle;

    fn next(&mut self) -> Option<OpHandle> {
        let h = self.cursor?;
        self.cursor = self.chains.arena.get(h).and_then(|d| d.prev);
        Some(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Chains = VersionChains<u32>;

    const ROW: RowLocator = RowLocator::new(0, 1);

    fn txn(n: u64) -> TxnId {
        TxnId::new(n).unwrap()
    }

    fn push(c: &mut Chains, anchor: &mut Option<OpHandle>, kind: OpKind, sp: u32) -> Result<OpHandle> {
        let h = c.prepare(OpDescriptor::new(kind, txn(1), Savepoint::new(sp), ROW));
        match c.append(anchor, h) {
            Ok(()) => Ok(h),
            Err(e) => {
                c.discard(h).unwrap();
                Err(e)
            }
        }
    }

    fn me(sp: u32) -> Requester {
        Requester {
            txn: txn(1),
            savepoint: Savepoint::new(sp),
            dirty_read: false,
        }
    }

    #[test]
    fn test_transitions() {
        let mut c = Chains::new();
        let mut anchor = None;
        push(&mut c, &mut anchor, OpKind::Insert, 1).unwrap();
        assert!(matches!(
            push(&mut c, &mut anchor, OpKind::Insert, 2),
            Err(TuplError::DuplicateInsert { .. })
        ));
        push(&mut c, &mut anchor, OpKind::Update, 2).unwrap();
        assert!(matches!(
            push(&mut c, &mut anchor, OpKind::Insert, 3),
            Err(TuplError::DuplicateInsert { .. })
        ));
        push(&mut c, &mut anchor, OpKind::Read, 3).unwrap();
        push(&mut c, &mut anchor, OpKind::Delete, 4).unwrap();
        for kind in [OpKind::Read, OpKind::Update, OpKind::Delete] {
            assert!(matches!(
                push(&mut c, &mut anchor, kind, 5),
                Err(TuplError::RowAlreadyDeleted { .. })
            ));
        }
        assert_eq!(c.chain_len(anchor), 4);
        c.check_chain(anchor).unwrap();
    }

    #[test]
    fn test_read_after_delete_is_rejected_even_past_reads() {
        let mut c = Chains::new();
        let mut anchor = None;
        push(&mut c, &mut anchor, OpKind::Delete, 1).unwrap();
        assert!(push(&mut c, &mut anchor, OpKind::Read, 2).is_err());
    }

    #[test]
    fn test_collapse_marks_both() {
        let mut c = Chains::new();
        let mut anchor = None;
        let del = push(&mut c, &mut anchor, OpKind::Delete, 1).unwrap();
        let ins = push(&mut c, &mut anchor, OpKind::Insert, 2).unwrap();
        assert!(c.get(del).unwrap().collapsed);
        assert!(c.get(ins).unwrap().collapsed);
        assert_eq!(c.select_visible(anchor, &me(2)).unwrap(), Visibility::Pending(ins));
        assert_eq!(c.select_visible(anchor, &me(1)).unwrap(), Visibility::Deleted);
        assert_eq!(c.select_visible(anchor, &me(0)).unwrap(), Visibility::Committed);
    }

    #[test]
    fn test_abort_collapse_insert_clears_flag() {
        let mut c = Chains::new();
        let mut anchor = None;
        let del = push(&mut c, &mut anchor, OpKind::Delete, 1).unwrap();
        let ins = push(&mut c, &mut anchor, OpKind::Insert, 2).unwrap();
        let out = c.unlink(&mut anchor, ins, Disposition::Abort).unwrap();
        assert!(!out.outcome.free_slot);
        assert!(out.outcome.has_predecessor);
        assert_eq!(anchor, Some(del));
        assert!(!c.get(del).unwrap().collapsed);
    }

    #[test]
    fn test_inherit_carry_over_state() {
        let mut c = Chains::new();
        let mut anchor = None;
        let a = push(&mut c, &mut anchor, OpKind::Update, 1).unwrap();
        {
            let d = c.get_mut(a).unwrap();
            d.undo_reserved = true;
            d.undo_words = 6;
            d.disk_fetch_pending = true;
        }
        let b = push(&mut c, &mut anchor, OpKind::Update, 2).unwrap();
        let d = c.get(b).unwrap();
        assert!(d.undo_reserved);
        assert!(d.disk_fetch_pending);
        assert_eq!(d.inherited_undo_words, 6);
        assert_eq!(d.undo_words, 0);
    }

    #[test]
    fn test_inserted_not_visible_to_earlier_savepoint() {
        let mut c = Chains::new();
        let mut anchor = None;
        push(&mut c, &mut anchor, OpKind::Insert, 5).unwrap();
        assert_eq!(
            c.select_visible(anchor, &me(4)).unwrap(),
            Visibility::InsertedNotVisible
        );
    }

    #[test]
    fn test_other_transaction_visibility() {
        let mut c = Chains::new();
        let mut anchor = None;
        assert_eq!(
            c.select_visible(anchor, &me(0)).unwrap(),
            Visibility::Committed
        );
        push(&mut c, &mut anchor, OpKind::Update, 1).unwrap();
        let other = Requester {
            txn: txn(2),
            savepoint: Savepoint::LATEST,
            dirty_read: false,
        };
        assert_eq!(
            c.select_visible(anchor, &other).unwrap(),
            Visibility::Locked { holder: txn(1) }
        );
        let dirty = Requester {
            dirty_read: true,
            ..other
        };
        assert_eq!(c.select_visible(anchor, &dirty).unwrap(), Visibility::Committed);

        let mut fresh = None;
        push(&mut c, &mut fresh, OpKind::Insert, 1).unwrap();
        assert_eq!(
            c.select_visible(fresh, &dirty).unwrap(),
            Visibility::InsertedNotVisible
        );
    }

    #[test]
    fn test_abort_lone_insert_frees_slot() {
        let mut c = Chains::new();
        let mut anchor = None;
        let ins = push(&mut c, &mut anchor, OpKind::Insert, 1).unwrap();
        let out = c.unlink(&mut anchor, ins, Disposition::Abort).unwrap();
        assert!(out.outcome.free_slot);
        assert!(out.outcome.chain_empty);
        assert!(anchor.is_none());
        assert!(!c.contains(ins));
        assert!(matches!(
            c.unlink(&mut anchor, ins, Disposition::Abort),
            Err(TuplError::NoSuchOperation { .. })
        ));
    }

    #[test]
    fn test_commit_oldest_keeps_rest() {
        let mut c = Chains::new();
        let mut anchor = None;
        let a = push(&mut c, &mut anchor, OpKind::Insert, 1).unwrap();
        let b = push(&mut c, &mut anchor, OpKind::Update, 2).unwrap();
        let out = c.unlink(&mut anchor, a, Disposition::Commit).unwrap();
        assert!(out.outcome.has_successor);
        assert!(!out.outcome.chain_empty);
        assert!(!out.outcome.free_slot);
        assert_eq!(anchor, Some(b));
        assert_eq!(c.get(b).unwrap().prev(), None);
        c.check_chain(anchor).unwrap();
        let out = c.unlink(&mut anchor, b, Disposition::Commit).unwrap();
        assert!(out.outcome.chain_empty);
        assert_eq!(c.open_ops(), 0);
    }

    #[test]
    fn test_unlink_middle_patches_neighbours() {
        let mut c = Chains::new();
        let mut anchor = None;
        let a = push(&mut c, &mut anchor, OpKind::Update, 1).unwrap();
        let b = push(&mut c, &mut anchor, OpKind::Update, 2).unwrap();
        let d = push(&mut c, &mut anchor, OpKind::Update, 3).unwrap();
        c.unlink(&mut anchor, b, Disposition::Abort).unwrap();
        assert_eq!(c.get(d).unwrap().prev(), Some(a));
        assert_eq!(c.get(a).unwrap().next(), Some(d));
        c.check_chain(anchor).unwrap();
    }

    #[test]
    fn test_discard_refuses_linked() {
        let mut c = Chains::new();
        let mut anchor = None;
        let a = push(&mut c, &mut anchor, OpKind::Update, 1).unwrap();
        assert!(c.discard(a).is_err());
        let p = c.prepare(OpDescriptor::new(OpKind::Read, txn(1), Savepoint::new(0), ROW));
        assert!(c.discard(p).is_ok());
    }

    proptest! {
        #[test]
        fn prop_same_txn_sees_newest_at_or_below_savepoint(
            steps in proptest::collection::vec(0u32..4, 1..12),
            probe in 0u32..64,
        ) {
            let mut c = Chains::new();
            let mut anchor = None;
            let mut sp = 1u32;
            let mut written: Vec<(u32, OpHandle)> = Vec::new();
            for gap in steps {
                sp += gap;
                let h = push(&mut c, &mut anchor, OpKind::Update, sp).unwrap();
                written.push((sp, h));
            }
            let want = written.iter().rev().find(|(s, _)| *s <= probe).map(|(_, h)| *h);
            let got = c.select_visible(anchor, &me(probe)).unwrap();
            match want {
                Some(h) => prop_assert_eq!(got, Visibility::Pending(h)),
                None => prop_assert_eq!(got, Visibility::Committed),
            }
            c.check_chain(anchor).unwrap();
        }
    }
}
