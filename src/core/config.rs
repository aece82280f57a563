//! Raft configuration parameters

use std::time::Duration;

/// Timing and resource limits of a Raft server. Protocol timeouts are
/// counted in ticks so the FSM stays independent of wall-clock time.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Period of the driver's logical clock (default: 100ms)
    pub tick_interval: Duration,
    /// Base election timeout in ticks (default: 10). The effective timeout
    /// is drawn from `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: u64,
    /// Ticks between leader heartbeats (default: 1)
    pub heartbeat_interval: u64,
    /// Maximum number of entries in one append request (default: 64)
    pub max_entries_per_append: usize,
    /// Unacknowledged appends allowed per follower in pipeline mode (default: 4)
    pub max_in_flight_appends: usize,
    /// Number of applied log entries before triggering automatic snapshot (default: 1000)
    /// Set to 0 to disable automatic snapshots
    pub snapshot_threshold: u64,
    /// Entries kept in the log below a freshly taken snapshot (default: 10)
    pub snapshot_trailing: usize,
    /// Committed batches buffered between the I/O loop and the applier (default: 10)
    pub apply_queue_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_timeout: 10,
            heartbeat_interval: 1,
            max_entries_per_append: 64,
            max_in_flight_appends: 4,
            snapshot_threshold: 1000,
            snapshot_trailing: 10,
            apply_queue_capacity: 10,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Create a new config with custom election timeout, in ticks
    pub fn with_election_timeout(mut self, ticks: u64) -> Self {
        assert!(ticks > 0, "election timeout must be at least one tick");
        self.election_timeout = ticks;
        self
    }

    /// Create a new config with custom heartbeat interval, in ticks
    pub fn with_heartbeat_interval(mut self, ticks: u64) -> Self {
        assert!(ticks > 0, "heartbeat interval must be at least one tick");
        self.heartbeat_interval = ticks;
        self
    }

    pub fn with_max_entries_per_append(mut self, max: usize) -> Self {
        self.max_entries_per_append = max.max(1);
        self
    }

    pub fn with_max_in_flight_appends(mut self, max: usize) -> Self {
        self.max_in_flight_appends = max.max(1);
        self
    }

    /// Create a new config with custom snapshot threshold
    /// Set to 0 to disable automatic snapshots
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_snapshot_trailing(mut self, trailing: usize) -> Self {
        self.snapshot_trailing = trailing;
        self
    }

    pub fn with_apply_queue_capacity(mut self, capacity: usize) -> Self {
        self.apply_queue_capacity = capacity.max(1);
        self
    }
}
