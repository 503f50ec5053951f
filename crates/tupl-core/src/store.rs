//! Physical tuple slots of one partition.
//!
//! Slots are grouped into fixed-size pages that are created on demand. A
//! slot holds the committed fixed words of its row and the anchor of the
//! row's version chain.

use tupl_error::{Result, TuplError};
use tupl_layout::{TupleFlags, TupleHeader};
use tupl_mvcc::OpHandle;
use tupl_types::RowLocator;

/// One physical row slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Committed fixed words; a free header when the slot is unused.
    pub fixed: Vec<u32>,
    /// Newest open operation on the row.
    pub anchor: Option<OpHandle>,
    allocated: bool,
}

impl Slot {
    fn free(fixed_words: usize) -> Self {
        let mut fixed = vec![0; fixed_words];
        fixed[0] = TupleHeader::free().to_word();
        Self {
            fixed,
            anchor: None,
            allocated: false,
        }
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    #[inline]
    pub fn header(&self) -> TupleHeader {
        TupleHeader::from_word(self.fixed[0])
    }
}

/// Page-organised slot pool with a free list.
#[derive(Debug)]
pub struct TupleStore {
    pages: Vec<Vec<Slot>>,
    free_list: Vec<RowLocator>,
    fixed_words: usize,
    slots_per_page: usize,
    capacity: usize,
    allocated: usize,
}

impl TupleStore {
    pub fn new(fixed_words: usize, slots_per_page: usize, capacity: usize) -> Self {
        Self {
            pages: Vec::new(),
            free_list: Vec::new(),
            fixed_words,
            slots_per_page,
            capacity,
            allocated: 0,
        }
    }

    /// Take a free slot and mark it allocated.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&mut self) -> Result<RowLocator> {
        let loc = if let Some(loc) = self.free_list.pop() {
            loc
        } else {
            let total = self.pages.len() * self.slots_per_page;
            if total >= self.capacity {
                return Err(TuplError::SlotPoolExhausted {
                    capacity: self.capacity,
                });
            }
            let page = self.pages.len() as u32;
            let fresh = self.slots_per_page.min(self.capacity - total);
            self.pages
                .push((0..fresh).map(|_| Slot::free(self.fixed_words)).collect());
            // hand out low indices first
            for index in (1..fresh).rev() {
                self.free_list.push(RowLocator::new(page, index as u16));
            }
            RowLocator::new(page, 0)
        };
        let slot = self.slot_mut_any(loc)?;
        slot.allocated = true;
        slot.anchor = None;
        slot.fixed[0] = TupleHeader::new(TupleFlags::ALLOC, tupl_types::TupleVersion::INITIAL)
            .to_word();
        self.allocated += 1;
        tracing::trace!(row = %loc, "slot allocated");
        Ok(loc)
    }

    /// Return a slot to the free list.
    pub fn free(&mut self, loc: RowLocator) -> Result<()> {
        let fixed_words = self.fixed_words;
        let slot = self.slot_mut(loc)?;
        if slot.anchor.is_some() {
            return Err(TuplError::internal(format!(
                "freeing row {loc} with an open version chain"
            )));
        }
        *slot = Slot::free(fixed_words);
        self.free_list.push(loc);
        self.allocated -= 1;
        tracing::trace!(row = %loc, "slot freed");
        Ok(())
    }

    /// An allocated slot.
    pub fn get(&self, loc: RowLocator) -> Result<&Slot> {
        self.pages
            .get(loc.page as usize)
            .and_then(|p| p.get(usize::from(loc.index)))
            .filter(|s| s.allocated)
            .ok_or_else(|| not_found(loc))
    }

    pub fn slot_mut(&mut self, loc: RowLocator) -> Result<&mut Slot> {
        self.pages
            .get_mut(loc.page as usize)
            .and_then(|p| p.get_mut(usize::from(loc.index)))
            .filter(|s| s.allocated)
            .ok_or_else(|| not_found(loc))
    }

    fn slot_mut_any(&mut self, loc: RowLocator) -> Result<&mut Slot> {
        self.pages
            .get_mut(loc.page as usize)
            .and_then(|p| p.get_mut(usize::from(loc.index)))
            .ok_or_else(|| TuplError::internal(format!("slot {loc} outside the pool")))
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Locators of every allocated slot, in page order.
    pub fn rows(&self) -> impl Iterator<Item = RowLocator> + '_ {
        self.pages.iter().enumerate().flat_map(|(p, slots)| {
            slots.iter().enumerate().filter(|(_, s)| s.allocated).map(move |(i, _)| {
                #[allow(clippy::cast_possible_truncation)]
                RowLocator::new(p as u32, i as u16)
            })
        })
    }
}

fn not_found(loc: RowLocator) -> TuplError {
    TuplError::RowNotFound {
        row: loc.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_fills_pages_in_order() {
        let mut store = TupleStore::new(4, 2, 5);
        let locs: Vec<_> = (0..5).map(|_| store.alloc().unwrap()).collect();
        assert_eq!(locs[0], RowLocator::new(0, 0));
        assert_eq!(locs[1], RowLocator::new(0, 1));
        assert_eq!(locs[2], RowLocator::new(1, 0));
        assert_eq!(locs[4], RowLocator::new(2, 0));
        assert!(matches!(
            store.alloc(),
            Err(TuplError::SlotPoolExhausted { capacity: 5 })
        ));
        assert_eq!(store.allocated(), 5);
        assert_eq!(store.rows().count(), 5);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut store = TupleStore::new(3, 4, 4);
        let a = store.alloc().unwrap();
        assert!(store.get(a).unwrap().header().flags.contains(TupleFlags::ALLOC));
        store.free(a).unwrap();
        assert!(matches!(store.get(a), Err(TuplError::RowNotFound { .. })));
        assert!(store.free(a).is_err());
        assert_eq!(store.alloc().unwrap(), a);
        assert_eq!(store.allocated(), 1);
    }

    #[test]
    fn test_free_refuses_open_chain() {
        let mut store = TupleStore::new(3, 4, 4);
        let a = store.alloc().unwrap();
        let mut arena = tupl_mvcc::OpArena::new();
        store.slot_mut(a).unwrap().anchor = Some(arena.alloc(()));
        assert!(store.free(a).is_err());
    }

    #[test]
    fn test_unknown_locator() {
        let store = TupleStore::new(3, 4, 4);
        assert!(matches!(
            store.get(RowLocator::new(9, 9)),
            Err(TuplError::RowNotFound { .. })
        ));
    }
}
