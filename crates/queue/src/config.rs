//! Lane configuration.

use std::time::Duration;

use crate::Backoff;

pub const WORKFLOW_EXECUTION: &str = "workflow-execution";
pub const NODE_EXECUTION: &str = "node-execution";
pub const LLM_PROCESSING: &str = "llm-processing";
pub const CONNECTOR_CALLS: &str = "connector-calls";

/// One named lane: its own concurrency limit and retry defaults.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub name: String,
    /// Maximum jobs of this lane running at once.
    pub concurrency: usize,
    /// Default total attempts (first try included).
    pub attempts: u32,
    pub backoff: Backoff,
    /// Default whole-attempt timeout.
    pub timeout: Option<Duration>,
}

impl LaneConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            attempts: 3,
            backoff: Backoff::default(),
            timeout: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lanes: Vec<LaneConfig>,
    /// Capacity of the job event channel.
    pub event_capacity: usize,
    /// Finished jobs kept for lookup; older ones are forgotten.
    pub retain_finished: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lanes: vec![
                LaneConfig::new(WORKFLOW_EXECUTION, 5),
                LaneConfig::new(NODE_EXECUTION, 10),
                LaneConfig::new(LLM_PROCESSING, 2),
                LaneConfig::new(CONNECTOR_CALLS, 5),
            ],
            event_capacity: 1024,
            retain_finished: 1000,
        }
    }
}

impl QueueConfig {
    /// A config with no lanes.
    pub fn empty() -> Self {
        Self {
            lanes: Vec::new(),
            ..Self::default()
        }
    }

    /// Add a lane, replacing any lane of the same name.
    pub fn with_lane(mut self, lane: LaneConfig) -> Self {
        self.lanes.retain(|l| l.name != lane.name);
        self.lanes.push(lane);
        self
    }

    pub fn with_retain_finished(mut self, retain: usize) -> Self {
        self.retain_finished = retain;
        self
    }

    /// Override the concurrency of an existing lane.  Unknown names are ignored.
    pub fn with_concurrency(mut self, name: &str, concurrency: usize) -> Self {
        if let Some(lane) = self.lanes.iter_mut().find(|l| l.name == name) {
            lane.concurrency = concurrency.max(1);
        }
        self
    }

    pub fn lane(&self, name: &str) -> Option<&LaneConfig> {
        self.lanes.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lanes() {
        let config = QueueConfig::default();
        let lanes: Vec<(&str, usize)> = config
            .lanes
            .iter()
            .map(|l| (l.name.as_str(), l.concurrency))
            .collect();
        assert_eq!(
            lanes,
            vec![
                (WORKFLOW_EXECUTION, 5),
                (NODE_EXECUTION, 10),
                (LLM_PROCESSING, 2),
                (CONNECTOR_CALLS, 5),
            ]
        );
    }

    #[test]
    fn overrides() {
        let config = QueueConfig::default()
            .with_concurrency(LLM_PROCESSING, 4)
            .with_concurrency("missing", 9)
            .with_lane(LaneConfig::new(NODE_EXECUTION, 1).with_attempts(0));

        assert_eq!(config.lane(LLM_PROCESSING).map(|l| l.concurrency), Some(4));
        assert!(config.lane("missing").is_none());
        let node = config.lane(NODE_EXECUTION).unwrap();
        assert_eq!((node.concurrency, node.attempts), (1, 1));
        assert_eq!(config.lanes.len(), 4);
    }
}
