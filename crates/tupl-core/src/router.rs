//! Routes requests to the partitions hosted by one node.

use std::collections::BTreeMap;

use tupl_error::{Result, TuplError};
use tupl_types::{PartitionId, TxnId};

use crate::context::OpContext;
use crate::partition::{Partition, Resumed};
use crate::request::{RowRequest, Step};
use crate::stats::PartitionStats;

/// Partitions of a node keyed by id.
#[derive(Debug, Default)]
pub struct PartitionRouter {
    partitions: BTreeMap<PartitionId, Partition>,
}

impl PartitionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, partition: Partition) -> Result<()> {
        let id = partition.id();
        if self.partitions.contains_key(&id) {
            return Err(TuplError::Config(format!("{id} is already hosted")));
        }
        self.partitions.insert(id, partition);
        Ok(())
    }

    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn get_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        self.partitions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn execute(&mut self, ctx: &mut OpContext<'_>, req: RowRequest) -> Result<Step> {
        let id = req.partition;
        self.partitions
            .get_mut(&id)
            .ok_or_else(|| TuplError::Unsupported(format!("{id} is not hosted on this node")))?
            .execute(ctx, req)
    }

    /// Commit `txn` on every partition. Returns the total operations
    /// committed; stops at the first partition that fails.
    pub fn commit_transaction(&mut self, ctx: &mut OpContext<'_>, txn: TxnId) -> Result<usize> {
        let mut total = 0;
        for p in self.partitions.values_mut() {
            total += p.commit_transaction(ctx, txn)?;
        }
        Ok(total)
    }

    /// Abort `txn` on every partition, continuing past failures.
    pub fn abort_transaction(&mut self, ctx: &mut OpContext<'_>, txn: TxnId) -> Result<usize> {
        let mut total = 0;
        let mut first_err = None;
        for p in self.partitions.values_mut() {
            match p.abort_transaction(ctx, txn) {
                Ok(n) => total += n,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Resume suspended requests on every partition.
    ///
    /// Completed fetches are polled once per partition, so a ticket is
    /// only seen by the first partition to poll. Tickets are handed to
    /// the partition that parked on them.
    pub fn drive_ready(&mut self, ctx: &mut OpContext<'_>) -> Vec<Resumed> {
        let ready = ctx.pages.poll_ready();
        if ready.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for p in self.partitions.values_mut() {
            out.extend(p.resume_tickets(ctx, &ready));
        }
        out
    }

    pub fn stats(&self) -> impl Iterator<Item = (PartitionId, &PartitionStats)> + '_ {
        self.partitions.iter().map(|(id, p)| (*id, p.stats()))
    }
}
