//! Configuration for cluster components.

use lexlog_protocol::NodeId;
use rand::Rng;
use std::time::Duration;

/// How many ACKs a commit round needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumPolicy {
    /// A strict majority of the current members.
    Majority,
    /// A fixed number of ACKs.
    Fixed(usize),
}

impl QuorumPolicy {
    /// ACKs required from a quorum of `members` nodes, or `None` if the
    /// quorum cannot reach the threshold at all.
    pub fn threshold(&self, members: usize) -> Option<usize> {
        if members == 0 {
            return None;
        }
        match *self {
            QuorumPolicy::Majority => Some(members / 2 + 1),
            QuorumPolicy::Fixed(required) => {
                let required = required.max(1);
                (required <= members).then_some(required)
            }
        }
    }
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self::Majority
    }
}

/// Configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Identity of the local node.
    pub node_id: NodeId,
    /// Commit threshold policy.
    pub quorum: QuorumPolicy,
    /// How long a commit round waits for votes.
    pub commit_timeout: Duration,
    /// How long a single request waits for its reply.
    pub request_timeout: Duration,
    /// Interval between outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which a node becomes suspect.
    pub suspect_after: Duration,
    /// Silence after which a node is declared down.
    pub down_after: Duration,
    /// Interval between periodic reconciliation passes.
    pub reconcile_interval: Duration,
    /// Maximum entries per `Replay` message.
    pub replay_batch_size: usize,
    /// Maximum entries per consume or enumerate page.
    pub page_size: usize,
    /// Decided transactions retained per segment.
    pub decision_history: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl ClusterConfig {
    /// Creates a configuration with default timings.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            quorum: QuorumPolicy::Majority,
            commit_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            suspect_after: Duration::from_secs(3),
            down_after: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
            replay_batch_size: 500,
            page_size: 100,
            decision_history: 1024,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the quorum policy.
    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    /// Sets the commit round timeout.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Sets the single request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the suspect and down thresholds.
    pub fn with_failure_detection(mut self, suspect_after: Duration, down_after: Duration) -> Self {
        self.suspect_after = suspect_after;
        self.down_after = down_after.max(suspect_after);
        self
    }

    /// Sets the periodic reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Sets the replay batch size.
    pub fn with_replay_batch_size(mut self, size: usize) -> Self {
        self.replay_batch_size = size.max(1);
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets how many decided transactions are retained per segment.
    pub fn with_decision_history(mut self, size: usize) -> Self {
        self.decision_history = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_config_builder() {
        let node = NodeId::random();
        let config = ClusterConfig::new(node)
            .with_quorum(QuorumPolicy::Fixed(2))
            .with_commit_timeout(Duration::from_millis(500))
            .with_failure_detection(Duration::from_secs(2), Duration::from_secs(1))
            .with_replay_batch_size(0);

        assert_eq!(config.node_id, node);
        assert_eq!(config.quorum, QuorumPolicy::Fixed(2));
        assert_eq!(config.commit_timeout, Duration::from_millis(500));
        assert_eq!(config.down_after, Duration::from_secs(2));
        assert_eq!(config.replay_batch_size, 1);
    }

    #[test]
    fn majority_threshold() {
        let policy = QuorumPolicy::Majority;
        assert_eq!(policy.threshold(0), None);
        assert_eq!(policy.threshold(1), Some(1));
        assert_eq!(policy.threshold(2), Some(2));
        assert_eq!(policy.threshold(3), Some(2));
        assert_eq!(policy.threshold(5), Some(3));
    }

    #[test]
    fn fixed_threshold_requires_enough_members() {
        assert_eq!(QuorumPolicy::Fixed(2).threshold(3), Some(2));
        assert_eq!(QuorumPolicy::Fixed(3).threshold(2), None);
        assert_eq!(QuorumPolicy::Fixed(0).threshold(2), Some(1));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
