// Metric names for the listener container

pub const RECORDS_PROCESSED: &str = "listener_records_processed_total";
pub const RECORDS_RECOVERED: &str = "listener_records_recovered_total";
pub const LISTENER_RETRIES: &str = "listener_invocation_retries_total";
pub const OFFSET_COMMITS: &str = "listener_offset_commits_total";
pub const OFFSET_COMMIT_FAILURES: &str = "listener_offset_commit_failures_total";
pub const PENDING_OFFSETS_DISCARDED: &str = "listener_pending_offsets_discarded_total";
pub const ASSIGNED_PARTITIONS: &str = "listener_assigned_partitions";
pub const REBALANCE_REVOCATIONS: &str = "listener_rebalance_revocations_total";
pub const REBALANCE_ASSIGNMENTS: &str = "listener_rebalance_assignments_total";
