// ==== Consumer loop metrics ====
/// Counter for records successfully decoded and enqueued downstream
pub const RECORDS_CONSUMED: &str = "kafka_ingest_records_consumed_total";

/// Counter for records covered by offsets handed to the transport commit
pub const RECORDS_COMMITTED: &str = "kafka_ingest_records_committed_total";

/// Counter for iteration-level errors that sent the loop into backoff
pub const CONSUME_ERRORS: &str = "kafka_ingest_consume_errors_total";

/// Counter for authentication failures during poll
pub const POLL_AUTH_ERRORS: &str = "kafka_ingest_poll_auth_errors_total";

/// Counter for payload decode failures, labelled by reason
pub const DECODE_ERRORS: &str = "kafka_ingest_decode_errors_total";

// ==== Acknowledgement metrics ====
/// Counter for acknowledgement outcomes, labelled by status
pub const ACKNOWLEDGEMENTS: &str = "kafka_ingest_acknowledgements_total";

/// Counter for completions dropped because their ownership epoch was stale
pub const STALE_ACKS_DROPPED: &str = "kafka_ingest_stale_acks_dropped_total";

/// Gauge for acknowledgement groups awaiting a downstream outcome
pub const ACKS_PENDING: &str = "kafka_ingest_acks_pending";

// ==== Offset maintenance metrics ====
/// Counter for failed transport commit calls
pub const COMMIT_FAILURES: &str = "kafka_ingest_commit_failures_total";

/// Counter for failed seeks while resetting a partition
pub const SEEK_FAILURES: &str = "kafka_ingest_seek_failures_total";

// ==== Backpressure metrics ====
/// Counter for downstream buffer overflows (one per rejected attempt)
pub const BUFFER_OVERFLOWS: &str = "kafka_ingest_buffer_overflows_total";
