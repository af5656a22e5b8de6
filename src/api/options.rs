use tokio::time::Duration;

/// How client submissions report their outcome.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReturnMethod {
    /// `replicate()` resolves once the entry is applied (or fails).
    Blocking,
    /// `replicate()` resolves at append time with a handle that resolves on
    /// apply.
    Async,
}

/// Escalation ceilings. Each limit drives one explicit path: reconnect,
/// quorum auto-adjustment, reconnect-to-leader request, or process exit.
#[derive(Debug, Clone)]
pub struct RaftLimits {
    /// A peer inactive for `heartbeat_interval * reconnect_limit` gets its
    /// RPC client rebuilt before the next pre-vote.
    pub reconnect_limit: u64,
    /// Consecutive no-response pre-vote failures tolerated in a 2-node
    /// cluster before quorum auto-adjustment kicks in.
    pub vote_limit: u64,
    /// Consecutive hopeless (too-many-busy-connections) pre-vote cycles
    /// before the server exits with `UnrecoverableIsolation`. Zero disables.
    pub busy_connection_limit: u64,
    /// Quorum-rejected pre-vote rounds before asking the leader to
    /// re-establish its connection to us.
    pub pre_vote_rejection_limit: u64,
    /// A peer is "healthy" for full-consensus purposes if it responded
    /// within `heartbeat_interval * response_limit`.
    pub response_limit: u64,
    /// Snapshot chunk read attempts per peer per replication cycle.
    pub snapshot_read_retry_limit: u32,
}

impl Default for RaftLimits {
    fn default() -> Self {
        RaftLimits {
            reconnect_limit: 50,
            vote_limit: 5,
            busy_connection_limit: 30,
            pre_vote_rejection_limit: 20,
            response_limit: 20,
            snapshot_read_retry_limit: 3,
        }
    }
}

/// Tunables of a single replica. Defaults are safe for tests and small
/// deployments; validation happens once at wiring time.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub heartbeat_interval: Duration,
    pub election_timeout_lower: Duration,
    pub election_timeout_upper: Duration,

    /// Max entries shipped in one append-entries batch.
    pub max_append_entries: usize,
    /// A catching-up server is considered caught up once its matched index
    /// is within this many entries of the leader's last index.
    pub log_sync_stop_gap: u64,
    /// Entries kept behind a snapshot when the log is compacted.
    pub reserved_log_items: u64,
    /// Take a state-machine snapshot every this many applied entries.
    /// Zero disables automatic snapshotting.
    pub snapshot_distance: u64,
    /// Abandon a per-peer snapshot read context idle for this long.
    pub snapshot_ctx_idle_timeout: Duration,

    /// Let a zero-priority member become leader if the target priority has
    /// decayed to 1 and nothing changed for 20 heartbeat intervals.
    pub allow_temporary_zero_priority_leader: bool,
    /// 2-node clusters: shrink both quorums to 1 after repeated pre-vote
    /// failures so the surviving node can make progress.
    pub auto_adjust_quorum_for_small_cluster: bool,
    /// Defer vote initiation while the local state machine lags, giving it
    /// this long to catch up per term. Zero disables.
    pub grace_period_of_lagging_state_machine: Duration,

    /// Followers relay client writes to the leader instead of redirecting.
    pub auto_forwarding: bool,
    /// Zero means no timeout on forwarded requests.
    pub auto_forwarding_req_timeout: Duration,
    pub auto_forwarding_max_connections: usize,

    pub return_method: ReturnMethod,
    /// Client completion promises fail with a timeout after this long.
    pub with_client_req_timeout: Duration,

    /// Mark freshly added servers with the new-joiner flag so they are
    /// excluded from quorum until the finalizing configuration entry.
    pub use_new_joiner_type: bool,
    pub leadership_transfer_min_wait_time: Duration,

    /// Replicate to peers before the local disk write completes. Commit
    /// still counts only durable copies, including the leader's own.
    pub parallel_log_appending: bool,
    /// Wait for every currently-healthy voter before committing, not just a
    /// majority.
    pub use_full_consensus_among_healthy_members: bool,
    /// Zero means "derive from membership"; positive overrides.
    pub custom_commit_quorum_size: usize,
    pub custom_election_quorum_size: usize,

    pub limits: RaftLimits,
}

impl Default for RaftOptions {
    fn default() -> Self {
        RaftOptions {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_lower: Duration::from_millis(300),
            election_timeout_upper: Duration::from_millis(600),
            max_append_entries: 100,
            log_sync_stop_gap: 99,
            reserved_log_items: 10_000,
            snapshot_distance: 0,
            snapshot_ctx_idle_timeout: Duration::from_secs(10),
            allow_temporary_zero_priority_leader: true,
            auto_adjust_quorum_for_small_cluster: false,
            grace_period_of_lagging_state_machine: Duration::ZERO,
            auto_forwarding: false,
            auto_forwarding_req_timeout: Duration::ZERO,
            auto_forwarding_max_connections: 10,
            return_method: ReturnMethod::Blocking,
            with_client_req_timeout: Duration::from_secs(3),
            use_new_joiner_type: false,
            leadership_transfer_min_wait_time: Duration::ZERO,
            parallel_log_appending: false,
            use_full_consensus_among_healthy_members: false,
            custom_commit_quorum_size: 0,
            custom_election_quorum_size: 0,
            limits: RaftLimits::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidOptions {
    #[error("election timeout lower bound must exceed the heartbeat interval")]
    ElectionTimeoutTooShort,
    #[error("election timeout lower bound must not exceed the upper bound")]
    ElectionTimeoutRangeInverted,
    #[error("max_append_entries must be at least 1")]
    EmptyBatch,
    #[error("auto_forwarding_max_connections must be at least 1 when auto_forwarding is on")]
    NoForwardingConnections,
}

impl RaftOptions {
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        if self.election_timeout_lower <= self.heartbeat_interval {
            return Err(InvalidOptions::ElectionTimeoutTooShort);
        }
        if self.election_timeout_lower > self.election_timeout_upper {
            return Err(InvalidOptions::ElectionTimeoutRangeInverted);
        }
        if self.max_append_entries == 0 {
            return Err(InvalidOptions::EmptyBatch);
        }
        if self.auto_forwarding && self.auto_forwarding_max_connections == 0 {
            return Err(InvalidOptions::NoForwardingConnections);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RaftOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_heartbeat_slower_than_election_timeout() {
        let options = RaftOptions {
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_lower: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(InvalidOptions::ElectionTimeoutTooShort)
        ));
    }

    #[test]
    fn rejects_inverted_election_range() {
        let options = RaftOptions {
            election_timeout_lower: Duration::from_millis(700),
            election_timeout_upper: Duration::from_millis(600),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(InvalidOptions::ElectionTimeoutRangeInverted)
        ));
    }
}
