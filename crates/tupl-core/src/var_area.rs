//! Paged store for the memory variable parts of rows.
//!
//! A tuple records the home [`VarRef`] of its variable part and never
//! changes it. When a part outgrows its page it migrates: the data moves to
//! a slot on another page and the home slot becomes a forwarding entry.
//! Every read resolves at most one forward.

use tupl_error::{Result, TuplError};
use tupl_layout::VarRef;

/// Contents of one variable-area slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarSlot {
    /// Data lives here; `capacity` words are charged to the page.
    Inline { words: Vec<u32>, capacity: usize },
    /// Data migrated to another slot.
    Forward(VarRef),
}

/// Result of [`VarArea::ensure_capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    Fits,
    GrewInPlace,
    Migrated { to: VarRef },
}

#[derive(Debug, Default)]
struct VarPage {
    slots: Vec<Option<VarSlot>>,
    free_slots: Vec<u16>,
    used_words: usize,
}

/// Variable-size area of one partition.
#[derive(Debug)]
pub struct VarArea {
    pages: Vec<VarPage>,
    page_words: usize,
    page_limit: usize,
}

impl VarArea {
    pub fn new(page_words: usize, page_limit: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_words,
            page_limit,
        }
    }

    /// Store `words` in a new slot with room for `capacity` words.
    pub fn alloc(&mut self, words: &[u32], capacity: usize) -> Result<VarRef> {
        self.alloc_avoiding(words, capacity, None)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc_avoiding(
        &mut self,
        words: &[u32],
        capacity: usize,
        avoid: Option<u16>,
    ) -> Result<VarRef> {
        let capacity = capacity.max(words.len());
        if capacity > self.page_words {
            return Err(exhausted(capacity));
        }
        let page = match self.pages.iter().enumerate().position(|(i, p)| {
            Some(i as u16) != avoid && p.used_words + capacity <= self.page_words
        }) {
            Some(p) => p,
            None => {
                if self.pages.len() >= self.page_limit {
                    return Err(exhausted(capacity));
                }
                self.pages.push(VarPage::default());
                self.pages.len() - 1
            }
        };
        let p = &mut self.pages[page];
        let entry = VarSlot::Inline {
            words: words.to_vec(),
            capacity,
        };
        let slot = match p.free_slots.pop() {
            Some(s) => {
                p.slots[usize::from(s)] = Some(entry);
                s
            }
            None => {
                if p.slots.len() > usize::from(u16::MAX) {
                    return Err(exhausted(capacity));
                }
                p.slots.push(Some(entry));
                (p.slots.len() - 1) as u16
            }
        };
        p.used_words += capacity;
        Ok(VarRef::new(page as u16, slot))
    }

    fn slot(&self, r: VarRef) -> Result<&VarSlot> {
        self.pages
            .get(usize::from(r.page))
            .and_then(|p| p.slots.get(usize::from(r.slot)))
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(r))
    }

    fn slot_mut(&mut self, r: VarRef) -> Result<&mut VarSlot> {
        self.pages
            .get_mut(usize::from(r.page))
            .and_then(|p| p.slots.get_mut(usize::from(r.slot)))
            .and_then(Option::as_mut)
            .ok_or_else(|| dangling(r))
    }

    /// Where the data of home slot `home` currently lives.
    pub fn resolve(&self, home: VarRef) -> Result<VarRef> {
        match self.slot(home)? {
            VarSlot::Inline { .. } => Ok(home),
            VarSlot::Forward(to) => match self.slot(*to)? {
                VarSlot::Inline { .. } => Ok(*to),
                VarSlot::Forward(_) => Err(TuplError::malformed(format!(
                    "variable part {home} forwards more than once"
                ))),
            },
        }
    }

    pub fn read(&self, home: VarRef) -> Result<Vec<u32>> {
        match self.slot(self.resolve(home)?)? {
            VarSlot::Inline { words, .. } => Ok(words.clone()),
            VarSlot::Forward(_) => Err(TuplError::internal("resolved to a forward")),
        }
    }

    pub fn capacity(&self, home: VarRef) -> Result<usize> {
        match self.slot(self.resolve(home)?)? {
            VarSlot::Inline { capacity, .. } => Ok(*capacity),
            VarSlot::Forward(_) => Err(TuplError::internal("resolved to a forward")),
        }
    }

    /// Make room for `words` words, growing in place or migrating. Current
    /// contents are preserved either way.
    pub fn ensure_capacity(&mut self, home: VarRef, words: usize) -> Result<SizeChange> {
        let at = self.resolve(home)?;
        let cap = self.capacity(home)?;
        if words <= cap {
            return Ok(SizeChange::Fits);
        }
        let page_words = self.page_words;
        let page = &mut self.pages[usize::from(at.page)];
        if page.used_words - cap + words <= page_words {
            page.used_words = page.used_words - cap + words;
            if let VarSlot::Inline { capacity, .. } = self.slot_mut(at)? {
                *capacity = words;
            }
            tracing::trace!(home = %home, words, "variable part grew in place");
            return Ok(SizeChange::GrewInPlace);
        }

        let data = self.read(home)?;
        let to = self.alloc_avoiding(&data, words, Some(at.page))?;
        if at != home {
            self.release(at)?;
        }
        *self.slot_mut(home)? = VarSlot::Forward(to);
        if at == home {
            self.pages[usize::from(home.page)].used_words -= cap;
        }
        tracing::warn!(home = %home, to = %to, words, "variable part migrated");
        Ok(SizeChange::Migrated { to })
    }

    /// Overwrite the data; it must fit the current capacity.
    pub fn write(&mut self, home: VarRef, data: &[u32]) -> Result<()> {
        let at = self.resolve(home)?;
        match self.slot_mut(at)? {
            VarSlot::Inline { words, capacity } => {
                if data.len() > *capacity {
                    return Err(TuplError::internal(format!(
                        "{} words written into variable slot {at} of capacity {capacity}",
                        data.len()
                    )));
                }
                words.clear();
                words.extend_from_slice(data);
                Ok(())
            }
            VarSlot::Forward(_) => Err(TuplError::internal("resolved to a forward")),
        }
    }

    /// Trim the capacity down to the stored length. Returns the words given
    /// back to the page.
    pub fn shrink_to_fit(&mut self, home: VarRef) -> Result<usize> {
        let at = self.resolve(home)?;
        let freed = match self.slot_mut(at)? {
            VarSlot::Inline { words, capacity } => {
                let freed = *capacity - words.len();
                *capacity = words.len();
                freed
            }
            VarSlot::Forward(_) => return Err(TuplError::internal("resolved to a forward")),
        };
        self.pages[usize::from(at.page)].used_words -= freed;
        Ok(freed)
    }

    /// Release the home slot and any slot it forwards to.
    pub fn free(&mut self, home: VarRef) -> Result<()> {
        if let VarSlot::Forward(to) = self.slot(home)? {
            let to = *to;
            self.release(to)?;
        }
        self.release(home)
    }

    fn release(&mut self, r: VarRef) -> Result<()> {
        let page = self
            .pages
            .get_mut(usize::from(r.page))
            .ok_or_else(|| dangling(r))?;
        let entry = page
            .slots
            .get_mut(usize::from(r.slot))
            .and_then(Option::take)
            .ok_or_else(|| dangling(r))?;
        if let VarSlot::Inline { capacity, .. } = entry {
            page.used_words -= capacity;
        }
        page.free_slots.push(r.slot);
        Ok(())
    }

    /// Words charged across all pages.
    pub fn used_words(&self) -> usize {
        self.pages.iter().map(|p| p.used_words).sum()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

fn dangling(r: VarRef) -> TuplError {
    TuplError::malformed(format!("dangling variable part reference {r}"))
}

#[allow(clippy::cast_possible_truncation)]
fn exhausted(words: usize) -> TuplError {
    TuplError::VarAreaExhausted {
        words: words as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_read_write() {
        let mut area = VarArea::new(32, 4);
        let r = area.alloc(&[1, 2, 3], 4).unwrap();
        assert_eq!(area.read(r).unwrap(), vec![1, 2, 3]);
        assert_eq!(area.capacity(r).unwrap(), 4);
        area.write(r, &[9, 9, 9, 9]).unwrap();
        assert!(area.write(r, &[0; 5]).is_err());
        assert_eq!(area.used_words(), 4);
    }

    #[test]
    fn test_grow_in_place_when_page_has_room() {
        let mut area = VarArea::new(32, 4);
        let r = area.alloc(&[1], 1).unwrap();
        assert_eq!(area.ensure_capacity(r, 1).unwrap(), SizeChange::Fits);
        assert_eq!(area.ensure_capacity(r, 10).unwrap(), SizeChange::GrewInPlace);
        assert_eq!(area.capacity(r).unwrap(), 10);
        assert_eq!(area.resolve(r).unwrap(), r);
        assert_eq!(area.used_words(), 10);
    }

    #[test]
    fn test_migrate_leaves_forward_and_keeps_data() {
        let mut area = VarArea::new(16, 4);
        let r = area.alloc(&[7, 7], 2).unwrap();
        let _filler = area.alloc(&[0; 12], 12).unwrap();
        let SizeChange::Migrated { to } = area.ensure_capacity(r, 8).unwrap() else {
            panic!("expected migration");
        };
        assert_ne!(to.page, r.page);
        assert_eq!(area.resolve(r).unwrap(), to);
        assert_eq!(area.read(r).unwrap(), vec![7, 7]);
        area.write(r, &[1; 8]).unwrap();
        assert_eq!(area.used_words(), 12 + 8);

        // fill page 0, then put a neighbour next to the migrated data
        area.alloc(&[0; 4], 4).unwrap();
        area.alloc(&[0; 4], 4).unwrap();
        assert_eq!(area.used_words(), 16 + 12);

        // a second migration replaces the target rather than chaining
        let SizeChange::Migrated { to: again } = area.ensure_capacity(r, 16).unwrap() else {
            panic!("expected migration");
        };
        assert_ne!(again, to);
        assert_eq!(area.resolve(r).unwrap(), again);
        assert_eq!(area.read(r).unwrap(), vec![1; 8]);
        assert_eq!(area.used_words(), 16 + 4 + 16);

        area.free(r).unwrap();
        assert_eq!(area.used_words(), 20);
        assert!(area.read(r).is_err());
    }

    #[test]
    fn test_shrink_to_fit_returns_words() {
        let mut area = VarArea::new(32, 1);
        let r = area.alloc(&[1, 2], 8).unwrap();
        assert_eq!(area.shrink_to_fit(r).unwrap(), 6);
        assert_eq!(area.used_words(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut area = VarArea::new(16, 1);
        area.alloc(&[0; 10], 10).unwrap();
        assert!(matches!(
            area.alloc(&[0; 10], 10),
            Err(TuplError::VarAreaExhausted { words: 10 })
        ));
        assert!(area.alloc(&[0; 17], 17).is_err());
    }
}
