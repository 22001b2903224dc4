use std::time::Duration;

use rdkafka::ClientConfig;

/// Tuning for one consumer instance. Defaults mirror the source pipeline this
/// replaces; tests shrink the backoffs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topics: Vec<String>,
    /// Upper bound for one blocking poll.
    pub poll_timeout: Duration,
    /// Max records gathered into one poll batch.
    pub max_batch_size: usize,
    /// Minimum spacing between non-forced commit flushes.
    pub commit_interval: Duration,
    /// Transport-managed commits; disables all manual commit maintenance.
    pub auto_commit: bool,
    /// Delay before retrying after an iteration-level error.
    pub error_backoff: Duration,
    /// Longer delay after transport authentication failures.
    pub auth_backoff: Duration,
    /// Longest delay, applied when the schema registry is unreachable.
    pub schema_backoff: Duration,
    /// Sleep between overflow retries when the downstream buffer is full.
    pub overflow_retry_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics,
            poll_timeout: Duration::from_secs(1),
            max_batch_size: 500,
            commit_interval: Duration::from_secs(5),
            auto_commit: false,
            error_backoff: Duration::from_secs(10),
            auth_backoff: Duration::from_secs(30),
            schema_backoff: Duration::from_secs(30),
            overflow_retry_delay: Duration::from_millis(100),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_auth_backoff(mut self, backoff: Duration) -> Self {
        self.auth_backoff = backoff;
        self
    }

    pub fn with_schema_backoff(mut self, backoff: Duration) -> Self {
        self.schema_backoff = backoff;
        self
    }

    pub fn with_overflow_retry_delay(mut self, delay: Duration) -> Self {
        self.overflow_retry_delay = delay;
        self
    }
}

/// rdkafka client configuration with defaults for a group consumer that
/// commits manually: offsets are only advanced once downstream confirmed
/// them, so auto commit/store stay off unless explicitly re-enabled.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS for the broker connection.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Offset reset policy applied when no committed offset exists.
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Re-enable transport-managed commits (auto-commit mode).
    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("enable.auto.commit", "true")
                .set("enable.auto.offset.store", "true");
        }
        self
    }

    /// Any additional raw setting.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
