//! Per-partition counters.

/// Monotonic counters of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionStats {
    pub reads: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub commits: u64,
    pub aborts: u64,
    /// Requests that failed and rolled back their own state.
    pub failed_requests: u64,
    pub refused: u64,
    pub suspensions: u64,
    pub resumptions: u64,
    pub checksum_failures: u64,
    pub var_migrations: u64,
    pub trigger_failures: u64,
    pub index_failures: u64,
}

impl PartitionStats {
    /// Compact JSON form for diagnostics.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
