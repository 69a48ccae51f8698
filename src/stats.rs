use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::runner::RunState;

/// Percentiles reported in the response time distribution of every row.
pub const PERCENTILES_TO_REPORT: [f64; 9] =
    [50.0, 66.0, 75.0, 80.0, 90.0, 95.0, 98.0, 99.0, 100.0];

/// Length of the rolling window (in seconds) used for current requests/s.
///
/// The most recent two seconds are excluded because they are still being
/// filled and would bias the rate downward.
const RPS_WINDOW_SECS: u64 = 10;
const RPS_WINDOW_SKEW_SECS: u64 = 2;

/// Identifies one logical request type: (HTTP method, logical name).
///
/// This is the grouping key for all statistics aggregation. `Ord` is derived
/// so report rows come out in a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub method: String,
    pub name: String,
}

impl EndpointKey {
    pub fn new(method: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.name)
    }
}

/// Per-endpoint request counters maintained by a worker node.
///
/// Response times are kept as a rounded frequency map rather than raw samples
/// so that a snapshot stays small no matter how many requests were issued.
/// The per-second counters feed the rolling current-rps window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStats {
    pub num_requests: u64,
    pub num_failures: u64,
    pub total_response_time: u64,
    /// `None` until the first request is observed; never coerced to zero.
    pub min_response_time: Option<u64>,
    pub max_response_time: u64,
    pub total_content_length: u64,
    /// Rounded response time (ms) -> observation count.
    pub response_times: BTreeMap<u64, u64>,
    /// Epoch second -> requests observed in that second.
    pub num_reqs_per_sec: HashMap<u64, u64>,
    pub start_time: u64,
    pub last_request_timestamp: u64,
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointStats {
    pub fn new() -> Self {
        let now = unix_now();
        Self {
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: None,
            max_response_time: 0,
            total_content_length: 0,
            response_times: BTreeMap::new(),
            num_reqs_per_sec: HashMap::new(),
            start_time: now,
            last_request_timestamp: now,
        }
    }

    /// Record one successful request observation.
    pub fn log(&mut self, response_time: u64, content_length: u64) {
        self.log_at(unix_now(), response_time, content_length);
    }

    /// Record one request observation at an explicit epoch second.
    pub fn log_at(&mut self, now: u64, response_time: u64, content_length: u64) {
        self.num_requests += 1;
        self.total_response_time += response_time;
        self.total_content_length += content_length;
        self.last_request_timestamp = self.last_request_timestamp.max(now);

        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(response_time),
            None => response_time,
        });
        self.max_response_time = self.max_response_time.max(response_time);

        *self
            .response_times
            .entry(round_response_time(response_time))
            .or_insert(0) += 1;
        *self.num_reqs_per_sec.entry(now).or_insert(0) += 1;
    }

    /// Record one failed request observation.
    pub fn log_error(&mut self) {
        self.num_failures += 1;
    }

    /// Exact merge of another stats entry for the same endpoint key.
    ///
    /// This is the node-local merge; the cross-node merge in the aggregator
    /// deliberately uses only the summary values (see [`StatsAggregator`]).
    pub fn extend(&mut self, other: &EndpointStats) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.total_content_length += other.total_content_length;
        self.min_response_time = merge_min(self.min_response_time, other.min_response_time);
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        for (&rt, &count) in &other.response_times {
            *self.response_times.entry(rt).or_insert(0) += count;
        }
        for (&sec, &count) in &other.num_reqs_per_sec {
            *self.num_reqs_per_sec.entry(sec).or_insert(0) += count;
        }
        self.start_time = self.start_time.min(other.start_time);
        self.last_request_timestamp = self.last_request_timestamp.max(other.last_request_timestamp);
    }

    pub fn median_response_time(&self) -> Option<u64> {
        median_from_counts(self.num_requests, &self.response_times)
    }

    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_response_time as f64 / self.num_requests as f64
        }
    }

    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_content_length as f64 / self.num_requests as f64
        }
    }

    /// Requests/s averaged over the rolling window ending two seconds ago.
    pub fn current_rps(&self, now: u64) -> f64 {
        window_rps(&self.num_reqs_per_sec, self.num_requests, now)
    }

    /// Requests/s over the whole observation period.
    pub fn total_rps(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        let elapsed = self
            .last_request_timestamp
            .saturating_sub(self.start_time)
            .max(1);
        self.num_requests as f64 / elapsed as f64
    }

    /// Response time below which `percent` of the observations fall.
    ///
    /// Returns `None` when no requests have been recorded; callers must
    /// report "N/A", never zero.
    pub fn percentile(&self, percent: f64) -> Option<u64> {
        value_at_ratio(&self.response_times, self.num_requests, percent)
    }

    /// Re-initialize all counters; used by the explicit reset operation.
    pub fn reset(&mut self) {
        *self = EndpointStats::new();
    }
}

fn merge_min(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (v, None) | (None, v) => v,
    }
}

/// Current time as epoch seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Round a response time so that the frequency map stays compact: exact below
/// 100ms, nearest 10ms below 1s, nearest 100ms below 10s, else nearest 1s.
pub fn round_response_time(t: u64) -> u64 {
    if t < 100 {
        t
    } else if t < 1000 {
        round_to(t, 10)
    } else if t < 10000 {
        round_to(t, 100)
    } else {
        round_to(t, 1000)
    }
}

fn round_to(t: u64, unit: u64) -> u64 {
    ((t + unit / 2) / unit) * unit
}

/// Value at the 50th-percentile position of a weighted frequency map.
pub fn median_from_counts(total_weight: u64, counts: &BTreeMap<u64, u64>) -> Option<u64> {
    value_at_ratio(counts, total_weight, 50.0)
}

/// Walk a `value -> weight` map in ascending value order, accumulating weight
/// until the `percent` position of `total_weight` is reached.
///
/// The value at which the running weight first reaches the target wins, so an
/// exact tie at the halfway point resolves to the lower value. This is the
/// deterministic tie-break for the weighted median merge.
pub fn value_at_ratio(
    counts: &BTreeMap<u64, u64>,
    total_weight: u64,
    percent: f64,
) -> Option<u64> {
    if total_weight == 0 || counts.is_empty() {
        return None;
    }
    let target = (((percent / 100.0) * total_weight as f64).ceil() as u64).max(1);
    let mut accumulated = 0u64;
    for (&value, &weight) in counts {
        accumulated += weight;
        if accumulated >= target {
            return Some(value);
        }
    }
    // Reachable when per-map weights sum below total_weight (e.g. nodes with
    // requests but no recorded percentile); report the highest value seen.
    counts.keys().next_back().copied()
}

/// One percentile boundary of a report row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    /// `None` when the row has no requests ("N/A" in the distribution view).
    pub value: Option<u64>,
}

/// One merged per-endpoint row of an [`AggregateReport`].
///
/// Field names are the contract toward the presentation layer and must not
/// change without coordinating with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRow {
    pub method: String,
    pub name: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub median_response_time: Option<u64>,
    pub avg_response_time: f64,
    pub min_response_time: Option<u64>,
    pub max_response_time: u64,
    pub avg_content_length: f64,
    pub current_rps: f64,
    pub total_rps: f64,
    pub percentiles: Vec<PercentileValue>,
}

/// The computed cross-node union: one row per endpoint, a synthetic "Total"
/// row, and run-level fields. Immutable once produced; a recomputation fully
/// replaces the previous report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub state: RunState,
    pub worker_count: usize,
    pub user_count: u64,
    pub total_rps: f64,
    pub fail_ratio: f64,
    pub stats: Vec<StatsRow>,
    pub total: StatsRow,
    pub generated_at: chrono::DateTime<Utc>,
}

/// Intermediate accumulator for one endpoint key across nodes.
struct MergedEndpoint {
    num_requests: u64,
    num_failures: u64,
    total_response_time: u64,
    total_content_length: u64,
    min_response_time: Option<u64>,
    max_response_time: u64,
    num_reqs_per_sec: HashMap<u64, u64>,
    start_time: u64,
    last_request_timestamp: u64,
    /// Node median -> that node's request count for this key.
    median_weights: BTreeMap<u64, u64>,
    /// Per report percentile: node boundary -> node request count.
    percentile_weights: Vec<BTreeMap<u64, u64>>,
}

impl MergedEndpoint {
    fn new() -> Self {
        Self {
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            total_content_length: 0,
            min_response_time: None,
            max_response_time: 0,
            num_reqs_per_sec: HashMap::new(),
            start_time: u64::MAX,
            last_request_timestamp: 0,
            median_weights: BTreeMap::new(),
            percentile_weights: vec![BTreeMap::new(); PERCENTILES_TO_REPORT.len()],
        }
    }

    fn absorb(&mut self, stats: &EndpointStats) {
        self.num_requests += stats.num_requests;
        self.num_failures += stats.num_failures;
        self.total_response_time += stats.total_response_time;
        self.total_content_length += stats.total_content_length;
        self.min_response_time = merge_min(self.min_response_time, stats.min_response_time);
        self.max_response_time = self.max_response_time.max(stats.max_response_time);
        for (&sec, &count) in &stats.num_reqs_per_sec {
            *self.num_reqs_per_sec.entry(sec).or_insert(0) += count;
        }
        self.start_time = self.start_time.min(stats.start_time);
        self.last_request_timestamp = self
            .last_request_timestamp
            .max(stats.last_request_timestamp);

        // Each node's median and percentile boundaries count as one
        // representative sample weighted by that node's request count. This
        // trades exactness for bounded memory; it is exact only when every
        // request on a node produced the same rounded response time.
        if let Some(median) = stats.median_response_time() {
            *self.median_weights.entry(median).or_insert(0) += stats.num_requests;
        }
        for (i, &p) in PERCENTILES_TO_REPORT.iter().enumerate() {
            if let Some(boundary) = stats.percentile(p) {
                *self.percentile_weights[i].entry(boundary).or_insert(0) += stats.num_requests;
            }
        }
    }

    fn into_row(self, key: &EndpointKey, now: u64) -> StatsRow {
        let current_rps = window_rps(&self.num_reqs_per_sec, self.num_requests, now);
        let elapsed = self
            .last_request_timestamp
            .saturating_sub(if self.start_time == u64::MAX {
                self.last_request_timestamp
            } else {
                self.start_time
            })
            .max(1);
        let total_rps = if self.num_requests == 0 {
            0.0
        } else {
            self.num_requests as f64 / elapsed as f64
        };
        let percentiles = PERCENTILES_TO_REPORT
            .iter()
            .zip(&self.percentile_weights)
            .map(|(&p, weights)| PercentileValue {
                percentile: p,
                value: value_at_ratio(weights, self.num_requests, p),
            })
            .collect();
        StatsRow {
            method: key.method.clone(),
            name: key.name.clone(),
            num_requests: self.num_requests,
            num_failures: self.num_failures,
            median_response_time: median_from_counts(self.num_requests, &self.median_weights),
            avg_response_time: ratio(self.total_response_time, self.num_requests),
            min_response_time: self.min_response_time,
            max_response_time: self.max_response_time,
            avg_content_length: ratio(self.total_content_length, self.num_requests),
            current_rps,
            total_rps,
            percentiles,
        }
    }
}

fn ratio(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

fn window_rps(per_sec: &HashMap<u64, u64>, num_requests: u64, now: u64) -> f64 {
    if num_requests == 0 {
        return 0.0;
    }
    let end = now.saturating_sub(RPS_WINDOW_SKEW_SECS);
    let start = end.saturating_sub(RPS_WINDOW_SECS);
    let observed: u64 = (start..end)
        .map(|sec| per_sec.get(&sec).copied().unwrap_or(0))
        .sum();
    observed as f64 / RPS_WINDOW_SECS as f64
}

/// Merges per-node, per-endpoint statistics into an [`AggregateReport`].
///
/// Pure over its inputs: no shared state, safe to run concurrently with node
/// report writes (each node's snapshot is read atomically by the registry).
pub struct StatsAggregator;

impl StatsAggregator {
    /// Build a report from one statistics map per connected node.
    pub fn build_report<'a, I>(
        node_stats: I,
        state: RunState,
        worker_count: usize,
        user_count: u64,
    ) -> AggregateReport
    where
        I: IntoIterator<Item = &'a BTreeMap<EndpointKey, EndpointStats>>,
    {
        Self::build_report_at(node_stats, state, worker_count, user_count, unix_now())
    }

    /// As [`Self::build_report`], with an explicit clock for the rps windows.
    pub fn build_report_at<'a, I>(
        node_stats: I,
        state: RunState,
        worker_count: usize,
        user_count: u64,
        now: u64,
    ) -> AggregateReport
    where
        I: IntoIterator<Item = &'a BTreeMap<EndpointKey, EndpointStats>>,
    {
        let mut merged: BTreeMap<&'a EndpointKey, MergedEndpoint> = BTreeMap::new();
        for stats_map in node_stats {
            for (key, stats) in stats_map {
                merged
                    .entry(key)
                    .or_insert_with(MergedEndpoint::new)
                    .absorb(stats);
            }
        }

        let rows: Vec<StatsRow> = merged
            .into_iter()
            .map(|(key, acc)| acc.into_row(key, now))
            .collect();

        let total = Self::total_row(&rows);
        let total_rps = total.current_rps;
        let fail_ratio = if total.num_requests == 0 {
            0.0
        } else {
            total.num_failures as f64 / total.num_requests as f64
        };

        AggregateReport {
            state,
            worker_count,
            user_count,
            total_rps,
            fail_ratio,
            stats: rows,
            total,
            generated_at: Utc::now(),
        }
    }

    /// Synthetic "Total" row: counts are exact sums; the median applies the
    /// same weighted procedure across the per-endpoint medians, weighted by
    /// each endpoint's request count.
    fn total_row(rows: &[StatsRow]) -> StatsRow {
        let mut num_requests = 0u64;
        let mut num_failures = 0u64;
        let mut total_response_time = 0f64;
        let mut total_content_length = 0f64;
        let mut min_response_time: Option<u64> = None;
        let mut max_response_time = 0u64;
        let mut current_rps = 0.0;
        let mut total_rps = 0.0;
        let mut median_weights: BTreeMap<u64, u64> = BTreeMap::new();
        let mut percentile_weights: Vec<BTreeMap<u64, u64>> =
            vec![BTreeMap::new(); PERCENTILES_TO_REPORT.len()];

        for row in rows {
            num_requests += row.num_requests;
            num_failures += row.num_failures;
            total_response_time += row.avg_response_time * row.num_requests as f64;
            total_content_length += row.avg_content_length * row.num_requests as f64;
            min_response_time = merge_min(min_response_time, row.min_response_time);
            max_response_time = max_response_time.max(row.max_response_time);
            current_rps += row.current_rps;
            total_rps += row.total_rps;
            if let Some(median) = row.median_response_time {
                *median_weights.entry(median).or_insert(0) += row.num_requests;
            }
            for (i, pv) in row.percentiles.iter().enumerate() {
                if let Some(value) = pv.value {
                    *percentile_weights[i].entry(value).or_insert(0) += row.num_requests;
                }
            }
        }

        let percentiles = PERCENTILES_TO_REPORT
            .iter()
            .zip(&percentile_weights)
            .map(|(&p, weights)| PercentileValue {
                percentile: p,
                value: value_at_ratio(weights, num_requests, p),
            })
            .collect();

        StatsRow {
            method: String::new(),
            name: "Total".to_string(),
            num_requests,
            num_failures,
            median_response_time: median_from_counts(num_requests, &median_weights),
            avg_response_time: if num_requests == 0 {
                0.0
            } else {
                total_response_time / num_requests as f64
            },
            min_response_time,
            max_response_time,
            avg_content_length: if num_requests == 0 {
                0.0
            } else {
                total_content_length / num_requests as f64
            },
            current_rps,
            total_rps,
            percentiles,
        }
    }
}
