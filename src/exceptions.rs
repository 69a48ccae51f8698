use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use tracing::debug;

/// One deduplicated exception reported by worker nodes.
///
/// Field names (`count`, `msg`, `traceback`, `nodes`) are the contract toward
/// the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub count: u64,
    pub msg: String,
    pub traceback: String,
    /// Distinct node ids that reported this exception; sorted for stable
    /// output.
    pub nodes: BTreeSet<String>,
}

/// Deduplicates exception reports by (message, traceback).
///
/// Occurrence count grows on every report; the node set has set semantics, so
/// a node reporting the same exception twice appears once in the node list.
/// Grows monotonically during a run, cleared only by reset.
#[derive(Default)]
pub struct ExceptionAggregator {
    records: Mutex<HashMap<u64, ExceptionRecord>>,
}

impl ExceptionAggregator {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record one exception occurrence from a node.
    pub fn record(&self, msg: &str, traceback: &str, node_id: &str) {
        let key = exception_key(msg, traceback);
        let mut records = self.records.lock();
        let record = records.entry(key).or_insert_with(|| {
            debug!("New exception recorded: {}", msg);
            ExceptionRecord {
                count: 0,
                msg: msg.to_string(),
                traceback: traceback.to_string(),
                nodes: BTreeSet::new(),
            }
        });
        record.count += 1;
        record.nodes.insert(node_id.to_string());
    }

    /// All current records, in no particular order.
    pub fn list(&self) -> Vec<ExceptionRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Clear all records.
    pub fn reset(&self) {
        self.records.lock().clear();
    }
}

/// Stable within-process key over (message, traceback).
fn exception_key(msg: &str, traceback: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    traceback.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_node_twice_counts_once_in_node_list() {
        let aggregator = ExceptionAggregator::new();
        aggregator.record("boom", "trace", "worker-1");
        aggregator.record("boom", "trace", "worker-1");

        let records = aggregator.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        assert_eq!(records[0].nodes.len(), 1);
    }

    #[test]
    fn test_distinct_nodes_both_listed() {
        let aggregator = ExceptionAggregator::new();
        aggregator.record("boom", "trace", "worker-1");
        aggregator.record("boom", "trace", "worker-2");

        let records = aggregator.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        assert_eq!(records[0].nodes.len(), 2);
    }

    #[test]
    fn test_different_traceback_is_a_different_record() {
        let aggregator = ExceptionAggregator::new();
        aggregator.record("boom", "trace-a", "worker-1");
        aggregator.record("boom", "trace-b", "worker-1");
        assert_eq!(aggregator.len(), 2);
    }

    #[test]
    fn test_reset_clears_records() {
        let aggregator = ExceptionAggregator::new();
        aggregator.record("boom", "trace", "worker-1");
        aggregator.reset();
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_record_field_names() {
        let aggregator = ExceptionAggregator::new();
        aggregator.record("boom", "trace", "worker-1");
        let json = serde_json::to_value(&aggregator.list()[0]).unwrap();
        for field in ["count", "msg", "traceback", "nodes"] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
