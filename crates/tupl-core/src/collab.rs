//! Collaborator interfaces consumed by the mutation engine, plus in-memory
//! implementations.
//!
//! The engine never owns these subsystems. It reaches them through an
//! [`OpContext`](crate::OpContext) supplied with every call, except index
//! hooks, which belong to the partition that maintains them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tupl_error::{Result, TuplError};
use tupl_types::{AttrValue, DiskRef, LogGroupId, OpKind, PageRef, RowLocator, TupleVersion, TxnId};

// ---------------------------------------------------------------------------
// Disk page cache
// ---------------------------------------------------------------------------

/// Why a page is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    Read,
    Write,
}

/// Identifies one outstanding page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTicket(pub u64);

impl std::fmt::Display for FetchTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fetch#{}", self.0)
    }
}

/// Answer to [`DiskPageCache::get_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFetch {
    Resident,
    /// The page is being read; the ticket shows up in
    /// [`DiskPageCache::poll_ready`] once it is resident.
    Pending(FetchTicket),
}

/// Block cache in front of the tablespace data files.
pub trait DiskPageCache {
    fn get_page(&mut self, page: PageRef, intent: AccessIntent) -> Result<PageFetch>;

    /// Words of the record at `disk`; the page must be resident.
    /// `None` if the record was never written.
    fn read_record(&self, disk: DiskRef) -> Result<Option<Vec<u32>>>;

    /// Store a record. Pages touched by an open operation stay pinned, so
    /// writes never wait.
    fn write_record(&mut self, disk: DiskRef, words: &[u32]) -> Result<()>;

    /// Drop a record whose disk slot was released.
    fn remove_record(&mut self, disk: DiskRef);

    /// Fetches completed since the previous poll.
    fn poll_ready(&mut self) -> Vec<FetchTicket>;
}

/// Page cache over a map of records, with test-controlled residency.
#[derive(Debug, Default)]
pub struct MemoryPageCache {
    records: HashMap<DiskRef, Vec<u32>>,
    evicted: HashSet<PageRef>,
    pending: Vec<(FetchTicket, PageRef)>,
    ready: Vec<FetchTicket>,
    next_ticket: u64,
}

impl MemoryPageCache {
    /// Every page starts resident.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `page` non-resident; the next `get_page` on it goes pending.
    pub fn evict(&mut self, page: PageRef) {
        self.evicted.insert(page);
    }

    /// Finish every outstanding fetch.
    pub fn complete_fetches(&mut self) -> usize {
        let done = std::mem::take(&mut self.pending);
        for (ticket, page) in &done {
            self.evicted.remove(page);
            self.ready.push(*ticket);
        }
        done.len()
    }

    pub fn pending_fetches(&self) -> usize {
        self.pending.len()
    }

    pub fn record(&self, disk: DiskRef) -> Option<&[u32]> {
        self.records.get(&disk).map(Vec::as_slice)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl DiskPageCache for MemoryPageCache {
    fn get_page(&mut self, page: PageRef, intent: AccessIntent) -> Result<PageFetch> {
        if !self.evicted.contains(&page) {
            return Ok(PageFetch::Resident);
        }
        if let Some((ticket, _)) = self.pending.iter().find(|(_, p)| *p == page) {
            return Ok(PageFetch::Pending(*ticket));
        }
        self.next_ticket += 1;
        let ticket = FetchTicket(self.next_ticket);
        self.pending.push((ticket, page));
        tracing::debug!(%page, ?intent, %ticket, "page fetch started");
        Ok(PageFetch::Pending(ticket))
    }

    fn read_record(&self, disk: DiskRef) -> Result<Option<Vec<u32>>> {
        if self.evicted.contains(&disk.page_ref()) {
            return Err(TuplError::PageNotResident {
                page: disk.page_ref().to_string(),
            });
        }
        Ok(self.records.get(&disk).cloned())
    }

    fn write_record(&mut self, disk: DiskRef, words: &[u32]) -> Result<()> {
        self.records.insert(disk, words.to_vec());
        Ok(())
    }

    fn remove_record(&mut self, disk: DiskRef) {
        self.records.remove(&disk);
    }

    fn poll_ready(&mut self) -> Vec<FetchTicket> {
        std::mem::take(&mut self.ready)
    }
}

// ---------------------------------------------------------------------------
// Undo log
// ---------------------------------------------------------------------------

/// Undo log space manager. Shared by every partition of a node, so it is
/// reached through `&self`.
pub trait UndoLog: Send + Sync {
    /// Reserve `words`; [`TuplError::UndoLogFull`] if the group lacks room.
    fn reserve(&self, group: LogGroupId, words: u32) -> Result<()>;

    /// Return an unused reservation (operation aborted).
    fn release(&self, group: LogGroupId, words: u32);

    /// Turn a reservation into written log (operation committed).
    fn consume(&self, group: LogGroupId, words: u32);
}

#[derive(Debug, Default)]
struct UndoState {
    reserved: u64,
    written: u64,
}

/// Capacity-limited undo log shared through an `Arc`.
#[derive(Debug, Clone)]
pub struct MemoryUndoLog {
    capacity: u64,
    state: Arc<Mutex<UndoState>>,
}

impl MemoryUndoLog {
    pub fn new(capacity_words: u64) -> Self {
        Self {
            capacity: capacity_words,
            state: Arc::new(Mutex::new(UndoState::default())),
        }
    }

    pub fn reserved(&self) -> u64 {
        self.state.lock().reserved
    }

    pub fn written(&self) -> u64 {
        self.state.lock().written
    }

    /// Discard written log, as a checkpoint would.
    pub fn trim(&self) {
        self.state.lock().written = 0;
    }
}

impl UndoLog for MemoryUndoLog {
    fn reserve(&self, group: LogGroupId, words: u32) -> Result<()> {
        let mut s = self.state.lock();
        if s.reserved + s.written + u64::from(words) > self.capacity {
            return Err(TuplError::UndoLogFull {
                group: group.get(),
                requested: words,
            });
        }
        s.reserved += u64::from(words);
        Ok(())
    }

    fn release(&self, _group: LogGroupId, words: u32) {
        let mut s = self.state.lock();
        s.reserved = s.reserved.saturating_sub(u64::from(words));
    }

    fn consume(&self, _group: LogGroupId, words: u32) {
        let mut s = self.state.lock();
        s.reserved = s.reserved.saturating_sub(u64::from(words));
        s.written += u64::from(words);
    }
}

// ---------------------------------------------------------------------------
// Tablespace
// ---------------------------------------------------------------------------

/// Disk slot allocator.
pub trait Tablespace {
    fn preallocate_disk_slot(&mut self, words: u32) -> Result<DiskRef>;

    fn free_disk_slot(&mut self, disk: DiskRef, words: u32);
}

/// Tablespace with a fixed word capacity in one data file.
#[derive(Debug)]
pub struct MemoryTablespace {
    file: u16,
    records_per_page: u16,
    capacity_words: u64,
    used_words: u64,
    next: u64,
    free: Vec<DiskRef>,
}

impl MemoryTablespace {
    pub fn new(file: u16, capacity_words: u64) -> Self {
        Self {
            file,
            records_per_page: 64,
            capacity_words,
            used_words: 0,
            next: 0,
            free: Vec::new(),
        }
    }

    pub fn used_words(&self) -> u64 {
        self.used_words
    }
}

impl Tablespace for MemoryTablespace {
    #[allow(clippy::cast_possible_truncation)]
    fn preallocate_disk_slot(&mut self, words: u32) -> Result<DiskRef> {
        if self.used_words + u64::from(words) > self.capacity_words {
            return Err(TuplError::DiskSlotExhausted { words });
        }
        self.used_words += u64::from(words);
        if let Some(disk) = self.free.pop() {
            return Ok(disk);
        }
        let per_page = u64::from(self.records_per_page);
        let disk = DiskRef::new(
            self.file,
            (self.next / per_page) as u32,
            (self.next % per_page) as u16,
        );
        self.next += 1;
        Ok(disk)
    }

    fn free_disk_slot(&mut self, disk: DiskRef, words: u32) {
        self.used_words = self.used_words.saturating_sub(u64::from(words));
        self.free.push(disk);
    }
}

// ---------------------------------------------------------------------------
// Index hooks
// ---------------------------------------------------------------------------

/// Ordered-index maintenance for one secondary structure.
pub trait IndexHook: Send {
    fn name(&self) -> &str;

    fn add_entry(&mut self, row: RowLocator, version: TupleVersion) -> Result<()>;

    fn remove_entry(&mut self, row: RowLocator, version: TupleVersion) -> Result<()>;
}

/// One call seen by a [`RecordingIndexHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCall {
    Add(RowLocator, TupleVersion),
    Remove(RowLocator, TupleVersion),
}

#[derive(Debug, Default)]
struct IndexLog {
    calls: Vec<IndexCall>,
    live: HashSet<(RowLocator, TupleVersion)>,
    fail_next_add: bool,
}

/// Index hook that records calls and tracks its live entries. Clones share
/// state, so a test keeps one clone and hands the other to the partition.
#[derive(Debug, Clone)]
pub struct RecordingIndexHook {
    name: String,
    log: Arc<Mutex<IndexLog>>,
}

impl RecordingIndexHook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: Arc::new(Mutex::new(IndexLog::default())),
        }
    }

    pub fn calls(&self) -> Vec<IndexCall> {
        self.log.lock().calls.clone()
    }

    /// Entries added and not yet removed.
    pub fn live_entries(&self) -> usize {
        self.log.lock().live.len()
    }

    pub fn contains(&self, row: RowLocator, version: TupleVersion) -> bool {
        self.log.lock().live.contains(&(row, version))
    }

    /// Make the next `add_entry` fail.
    pub fn fail_next_add(&self) {
        self.log.lock().fail_next_add = true;
    }
}

impl IndexHook for RecordingIndexHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_entry(&mut self, row: RowLocator, version: TupleVersion) -> Result<()> {
        let mut log = self.log.lock();
        if std::mem::take(&mut log.fail_next_add) {
            return Err(TuplError::IndexMaintenance {
                index: self.name.clone(),
                detail: format!("injected failure adding {row} {version}"),
            });
        }
        log.calls.push(IndexCall::Add(row, version));
        log.live.insert((row, version));
        Ok(())
    }

    fn remove_entry(&mut self, row: RowLocator, version: TupleVersion) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(IndexCall::Remove(row, version));
        log.live.remove(&(row, version));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger delivery
// ---------------------------------------------------------------------------

/// Images of one completed row operation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TriggerEvent {
    pub kind: OpKind,
    pub row: RowLocator,
    pub txn: TxnId,
    pub version: TupleVersion,
    pub primary_key: Vec<AttrValue>,
    pub before: Option<Vec<AttrValue>>,
    pub after: Option<Vec<AttrValue>>,
}

/// Downstream trigger/subscription delivery.
pub trait TriggerSink {
    fn deliver(&mut self, event: TriggerEvent) -> Result<()>;
}

/// Sink that keeps every event, with optional failure injection.
#[derive(Debug, Default)]
pub struct RecordingTriggerSink {
    pub events: Vec<TriggerEvent>,
    fail: bool,
}

impl RecordingTriggerSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every delivery while `fail` is set.
    pub fn set_failing(&mut self, fail: bool) {
        self.fail = fail;
    }
}

impl TriggerSink for RecordingTriggerSink {
    fn deliver(&mut self, event: TriggerEvent) -> Result<()> {
        if self.fail {
            return Err(TuplError::Unsupported("trigger subscriber unavailable".to_owned()));
        }
        self.events.push(event);
        Ok(())
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTriggerSink;

impl TriggerSink for NullTriggerSink {
    fn deliver(&mut self, _event: TriggerEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_cache_residency() {
        let mut cache = MemoryPageCache::new();
        let disk = DiskRef::new(1, 3, 0);
        cache.write_record(disk, &[1, 2]).unwrap();
        assert_eq!(
            cache.get_page(disk.page_ref(), AccessIntent::Read).unwrap(),
            PageFetch::Resident
        );

        cache.evict(disk.page_ref());
        assert!(matches!(
            cache.read_record(disk),
            Err(TuplError::PageNotResident { .. })
        ));
        let PageFetch::Pending(t1) = cache.get_page(disk.page_ref(), AccessIntent::Read).unwrap()
        else {
            panic!("expected pending fetch");
        };
        let again = cache.get_page(disk.page_ref(), AccessIntent::Write).unwrap();
        assert_eq!(again, PageFetch::Pending(t1));
        assert!(cache.poll_ready().is_empty());

        assert_eq!(cache.complete_fetches(), 1);
        assert_eq!(cache.poll_ready(), vec![t1]);
        assert_eq!(cache.read_record(disk).unwrap(), Some(vec![1, 2]));
    }

    #[test]
    fn test_undo_log_capacity() {
        let log = MemoryUndoLog::new(10);
        let g = LogGroupId::new(1);
        log.reserve(g, 6).unwrap();
        assert!(matches!(
            log.reserve(g, 5),
            Err(TuplError::UndoLogFull {
                group: 1,
                requested: 5
            })
        ));
        log.consume(g, 6);
        assert_eq!(log.reserved(), 0);
        assert_eq!(log.written(), 6);
        assert!(log.reserve(g, 5).is_err());
        log.trim();
        log.reserve(g, 5).unwrap();
        log.release(g, 5);
        assert_eq!(log.reserved(), 0);
    }

    #[test]
    fn test_tablespace_reuses_freed_slots() {
        let mut ts = MemoryTablespace::new(2, 20);
        let a = ts.preallocate_disk_slot(8).unwrap();
        let b = ts.preallocate_disk_slot(8).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            ts.preallocate_disk_slot(8),
            Err(TuplError::DiskSlotExhausted { words: 8 })
        ));
        ts.free_disk_slot(a, 8);
        assert_eq!(ts.preallocate_disk_slot(8).unwrap(), a);
        assert_eq!(ts.used_words(), 16);
    }

    #[test]
    fn test_recording_index_hook_shares_state() {
        let hook = RecordingIndexHook::new("by_name");
        let mut handle = hook.clone();
        let row = RowLocator::new(0, 1);
        handle.add_entry(row, TupleVersion::INITIAL).unwrap();
        assert!(hook.contains(row, TupleVersion::INITIAL));
        hook.fail_next_add();
        assert!(handle.add_entry(row, TupleVersion::new(2)).is_err());
        handle.add_entry(row, TupleVersion::new(2)).unwrap();
        handle.remove_entry(row, TupleVersion::INITIAL).unwrap();
        assert_eq!(hook.live_entries(), 1);
        assert_eq!(hook.calls().len(), 3);
    }
}
