#![allow(dead_code)]

use std::sync::Arc;

use tupl_core::{
    EngineConfig, MemoryPageCache, MemoryTablespace, MemoryUndoLog, OpContext, Partition,
    RecordingTriggerSink, RowRequest, RowResponse, Step,
};
use tupl_error::Result;
use tupl_layout::{AttrSpec, CollationId, CollationRegistry, TableDescriptor};
use tupl_types::{AttrId, AttrValue, PartitionId, TxnId};

pub const PART: PartitionId = PartitionId::new(7);
pub const DISK_FILE: u16 = 3;

/// Node-level collaborators owned by a test.
pub struct Node {
    pub pages: MemoryPageCache,
    pub undo: MemoryUndoLog,
    pub space: MemoryTablespace,
    pub triggers: RecordingTriggerSink,
}

impl Node {
    pub fn new() -> Self {
        Self::with_undo_capacity(1 << 20)
    }

    pub fn with_undo_capacity(words: u64) -> Self {
        Self {
            pages: MemoryPageCache::new(),
            undo: MemoryUndoLog::new(words),
            space: MemoryTablespace::new(DISK_FILE, 1 << 20),
            triggers: RecordingTriggerSink::new(),
        }
    }

    pub fn ctx(&mut self) -> OpContext<'_> {
        OpContext::new(
            &mut self.pages,
            &self.undo,
            &mut self.space,
            &mut self.triggers,
        )
    }
}

pub fn txn(n: u64) -> TxnId {
    TxnId::new(n).unwrap()
}

pub fn a(i: u16) -> AttrId {
    AttrId::new(i)
}

// accounts: id, balance, owner, stamp
pub const ID: u16 = 0;
pub const BALANCE: u16 = 1;
pub const OWNER: u16 = 2;
pub const STAMP: u16 = 3;

pub fn accounts() -> TableDescriptor {
    TableDescriptor::builder("accounts")
        .attr(AttrSpec::fixed("id", 4).primary_key())
        .attr(AttrSpec::fixed("balance", 4).nullable())
        .attr(AttrSpec::var("owner", 32).collation(CollationId::UTF8_CI))
        .attr(AttrSpec::fixed("stamp", 8))
        .build()
        .unwrap()
}

pub fn account(id: u32, balance: u32, owner: &str) -> Vec<AttrValue> {
    vec![
        AttrValue::u32(a(ID), id),
        AttrValue::u32(a(BALANCE), balance),
        AttrValue::text(a(OWNER), owner),
        AttrValue::u64(a(STAMP), u64::from(id) * 1000),
    ]
}

// documents: id, title, body (disk), rating (disk)
pub const TITLE: u16 = 1;
pub const BODY: u16 = 2;
pub const RATING: u16 = 3;

pub fn documents() -> TableDescriptor {
    TableDescriptor::builder("documents")
        .attr(AttrSpec::fixed("id", 4).primary_key())
        .attr(AttrSpec::var("title", 16))
        .attr(AttrSpec::var("body", 64).on_disk().nullable())
        .attr(AttrSpec::fixed("rating", 4).on_disk())
        .build()
        .unwrap()
}

pub fn document(id: u32, title: &str, body: &str, rating: u32) -> Vec<AttrValue> {
    vec![
        AttrValue::u32(a(ID), id),
        AttrValue::text(a(TITLE), title),
        AttrValue::text(a(BODY), body),
        AttrValue::u32(a(RATING), rating),
    ]
}

pub fn partition(desc: TableDescriptor) -> Partition {
    partition_with(desc, EngineConfig::default())
}

pub fn partition_with(desc: TableDescriptor, config: EngineConfig) -> Partition {
    Partition::new(
        PART,
        Arc::new(desc),
        Arc::new(CollationRegistry::with_builtins()),
        config,
    )
    .unwrap()
}

pub fn complete(step: Result<Step>) -> RowResponse {
    match step.unwrap() {
        Step::Complete(r) => r,
        Step::Suspended(t) => panic!("unexpected suspension on {t}"),
    }
}

/// Insert and commit one row under `t`, returning its locator.
pub fn seed(p: &mut Partition, node: &mut Node, t: TxnId, values: Vec<AttrValue>) -> tupl_types::RowLocator {
    let resp = complete(p.execute(&mut node.ctx(), RowRequest::insert(PART, t, values)));
    p.commit_transaction(&mut node.ctx(), t).unwrap();
    resp.locator.unwrap()
}

pub fn values_u32(values: &[AttrValue]) -> Vec<Option<u32>> {
    values.iter().map(AttrValue::as_u32).collect()
}
