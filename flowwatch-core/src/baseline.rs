//! Baseline anomaly and traffic shift detection over the monitor's window.
//!
//! Each pass groups recent records by a chosen dimension. For every group
//! with enough latency samples, its p50 and p95 are compared against an EWMA
//! baseline learned from earlier passes, and only then folded into that
//! baseline, so a spike is reported before it is learned. Separately, each
//! group's share of the records is compared with the previous pass to detect
//! traffic moving between groups.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use flowwatch_types::{current_timestamp_ms, transport_name, Endpoint, FlowRecord, LatencyMetric};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dedupe::AlertDeduper;
use crate::duration::serde_str;
use crate::error::InvalidSetting;
use crate::monitor::LatencyMonitor;
use crate::stats::{self, Sample};

/// Metrics a baseline is kept for.
const BASELINE_METRICS: [LatencyMetric; 2] = [LatencyMetric::P50, LatencyMetric::P95];

/// Groups listed on each side of a shift event.
const SHIFT_TOP_GROUPS: usize = 5;

/// Below this the baseline is treated as flat.
const FLAT_STD_MS: f64 = 1e-9;

/// Dimension records are grouped by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// Source and destination address.
    #[default]
    Pair,
    Source,
    Destination,
    /// IP protocol.
    Transport,
    /// Capability the record arrived through.
    Capability,
}

impl GroupBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::Pair => "pair",
            GroupBy::Source => "source",
            GroupBy::Destination => "destination",
            GroupBy::Transport => "transport",
            GroupBy::Capability => "capability",
        }
    }

    /// Group key for a record, e.g. `pair:10.0.0.1->10.0.0.2`.
    fn key(&self, record: &FlowRecord) -> String {
        fn address(endpoint: Option<Endpoint>) -> String {
            endpoint.map_or_else(|| "unknown".to_string(), |e| e.address.to_string())
        }

        match self {
            GroupBy::Pair => format!(
                "pair:{}->{}",
                address(record.source_address()),
                address(record.destination_address())
            ),
            GroupBy::Source => format!("src:{}", address(record.source_address())),
            GroupBy::Destination => format!("dst:{}", address(record.destination_address())),
            GroupBy::Transport => format!("proto:{}", transport_name(record.transport())),
            GroupBy::Capability => format!("capability:{}", record.source_capability()),
        }
    }
}

/// Detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// How far back each pass looks, within the monitor's own window.
    #[serde(with = "serde_str")]
    pub lookback: Duration,
    /// Latency samples a group needs in one pass to be scored.
    pub min_samples_per_group: u64,
    /// EWMA smoothing factor in `(0, 1]`.
    pub alpha: f64,
    /// Absolute z-score at which a value is anomalous.
    pub z_threshold: f64,
    /// Baseline updates required before a group is scored.
    pub min_updates: u64,
    pub group_by: GroupBy,
    /// Minimum gap between two events with the same key.
    #[serde(with = "serde_str")]
    pub cooldown: Duration,
    /// L1 distance between consecutive group distributions that counts as a shift.
    pub shift_threshold: f64,
    /// Records a pass needs before its distribution is considered.
    pub shift_min_total: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(60),
            min_samples_per_group: 20,
            alpha: 0.15,
            z_threshold: 4.0,
            min_updates: 10,
            group_by: GroupBy::Pair,
            cooldown: Duration::from_secs(120),
            shift_threshold: 0.7,
            shift_min_total: 200,
        }
    }
}

impl BaselineConfig {
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        if self.lookback.is_zero() {
            return Err(InvalidSetting::new("lookback", "must be greater than zero"));
        }
        if self.min_samples_per_group == 0 {
            return Err(InvalidSetting::new("min_samples_per_group", "must be at least 1"));
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(InvalidSetting::new("alpha", format!("{} is outside (0, 1]", self.alpha)));
        }
        if !self.z_threshold.is_finite() || self.z_threshold <= 0.0 {
            return Err(InvalidSetting::new(
                "z_threshold",
                format!("{} is not a positive number", self.z_threshold),
            ));
        }
        if self.min_updates == 0 {
            return Err(InvalidSetting::new("min_updates", "must be at least 1"));
        }
        // Two distributions are at most 2 apart.
        if !(self.shift_threshold > 0.0 && self.shift_threshold <= 2.0) {
            return Err(InvalidSetting::new(
                "shift_threshold",
                format!("{} is outside (0, 2]", self.shift_threshold),
            ));
        }
        Ok(())
    }
}

/// Partial update to a [`BaselineConfig`]. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineUpdate {
    #[serde(default, with = "serde_str::option", skip_serializing_if = "Option::is_none")]
    pub lookback: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_samples_per_group: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_updates: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupBy>,
    #[serde(default, with = "serde_str::option", skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_min_total: Option<u64>,
}

impl BaselineUpdate {
    fn apply(&self, config: &BaselineConfig) -> BaselineConfig {
        BaselineConfig {
            lookback: self.lookback.unwrap_or(config.lookback),
            min_samples_per_group: self.min_samples_per_group.unwrap_or(config.min_samples_per_group),
            alpha: self.alpha.unwrap_or(config.alpha),
            z_threshold: self.z_threshold.unwrap_or(config.z_threshold),
            min_updates: self.min_updates.unwrap_or(config.min_updates),
            group_by: self.group_by.unwrap_or(config.group_by),
            cooldown: self.cooldown.unwrap_or(config.cooldown),
            shift_threshold: self.shift_threshold.unwrap_or(config.shift_threshold),
            shift_min_total: self.shift_min_total.unwrap_or(config.shift_min_total),
        }
    }
}

/// A group's window statistic deviated from its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub group: String,
    pub metric: LatencyMetric,
    pub current_ms: f64,
    pub baseline_mean_ms: f64,
    pub baseline_std_ms: f64,
    /// `None` when the baseline is flat and any change is anomalous.
    pub zscore: Option<f64>,
    pub samples: u64,
    pub timestamp_ms: u64,
}

/// One group's fraction of the records in a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupShare {
    pub group: String,
    pub share: f64,
}

/// Records moved between groups since the previous pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftEvent {
    /// e.g. `count_by_pair`.
    pub dimension: String,
    /// L1 distance between the two distributions, in `[0, 2]`.
    pub distance: f64,
    pub previous_top: Vec<GroupShare>,
    pub current_top: Vec<GroupShare>,
    pub timestamp_ms: u64,
}

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineReport {
    pub group_by: GroupBy,
    pub lookback_ms: u64,
    /// Groups with at least one latency sample in this pass.
    pub groups_seen: usize,
    pub anomalies: Vec<AnomalyEvent>,
    pub shift: Option<ShiftEvent>,
}

/// Exponentially weighted mean and variance of one metric for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Ewma {
    mean: f64,
    var: f64,
    updates: u64,
}

impl Ewma {
    fn update(&mut self, x: f64, alpha: f64) {
        if self.updates == 0 {
            self.mean = x;
            self.var = 0.0;
        } else {
            let residual = x - self.mean;
            self.mean = alpha * x + (1.0 - alpha) * self.mean;
            self.var = alpha * residual * residual + (1.0 - alpha) * self.var;
        }
        self.updates += 1;
    }

    fn std(&self) -> f64 {
        self.var.max(0.0).sqrt()
    }

    /// `Some(zscore)` when `x` is anomalous; the inner `None` marks a flat baseline.
    fn score(&self, x: f64, z_threshold: f64, min_updates: u64) -> Option<Option<f64>> {
        if self.updates < min_updates {
            return None;
        }
        let std = self.std();
        if std <= FLAT_STD_MS {
            return (x != self.mean).then_some(None);
        }
        let z = (x - self.mean) / std;
        (z.abs() >= z_threshold).then_some(Some(z))
    }
}

#[derive(Debug)]
struct DetectorState {
    config: BaselineConfig,
    baselines: HashMap<(String, LatencyMetric), Ewma>,
    previous_shares: HashMap<GroupBy, BTreeMap<String, f64>>,
    dedupe: AlertDeduper,
}

/// Learns per-group latency baselines across passes.
///
/// Passes are serialized; the monitor is only read.
#[derive(Debug)]
pub struct BaselineDetector {
    state: Mutex<DetectorState>,
}

impl BaselineDetector {
    pub fn new(config: &BaselineConfig) -> Result<Self, InvalidSetting> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(DetectorState {
                dedupe: AlertDeduper::new(config.cooldown),
                config: config.clone(),
                baselines: HashMap::new(),
                previous_shares: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> BaselineConfig {
        self.state.lock().config.clone()
    }

    /// Apply a partial update. Nothing changes if the result is invalid.
    ///
    /// Learned baselines are kept; group keys carry their dimension, so
    /// switching `group_by` starts fresh baselines for the new groups.
    pub fn configure(&self, update: &BaselineUpdate) -> Result<BaselineConfig, InvalidSetting> {
        let mut state = self.state.lock();
        let config = update.apply(&state.config);
        config.validate()?;
        state.dedupe.set_cooldown(config.cooldown);
        state.config = config.clone();
        Ok(config)
    }

    /// Run one pass over the monitor's recent records.
    pub fn analyze_once(&self, monitor: &LatencyMonitor) -> BaselineReport {
        let lookback = self.state.lock().config.lookback;
        let records = monitor.recent_records(None, Some(lookback));
        self.analyze_records(&records, Instant::now())
    }

    fn analyze_records(&self, records: &[FlowRecord], now: Instant) -> BaselineReport {
        let mut state = self.state.lock();
        let config = state.config.clone();
        let timestamp_ms = current_timestamp_ms();
        state.dedupe.prune(now);

        let mut latencies: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for (seq, record) in records.iter().enumerate() {
            let group = config.group_by.key(record);
            if let Some(latency_ms) = record.latency_ms() {
                latencies.entry(group.clone()).or_default().push(Sample {
                    latency_ms,
                    seq: seq as u64,
                });
            }
            *counts.entry(group).or_default() += 1;
        }

        let mut anomalies = Vec::new();
        for (group, samples) in &mut latencies {
            if (samples.len() as u64) < config.min_samples_per_group {
                continue;
            }
            let Some(window) = stats::summarize(samples) else {
                continue;
            };

            for metric in BASELINE_METRICS {
                let current = window.value(metric);
                let baseline = state
                    .baselines
                    .entry((group.clone(), metric))
                    .or_default();
                let score = baseline.score(current, config.z_threshold, config.min_updates);
                let (mean, std) = (baseline.mean, baseline.std());
                // Learn only after scoring so a spike is reported first.
                baseline.update(current, config.alpha);

                if let Some(zscore) = score {
                    let key = format!("anomaly:{group}:{metric}");
                    if state.dedupe.should_send(&key, now) {
                        debug!(group = %group, metric = %metric, current, mean, "latency anomaly");
                        anomalies.push(AnomalyEvent {
                            group: group.clone(),
                            metric,
                            current_ms: current,
                            baseline_mean_ms: mean,
                            baseline_std_ms: std,
                            zscore,
                            samples: window.count,
                            timestamp_ms,
                        });
                    }
                }
            }
        }

        let shift = detect_shift(&mut state, &config, &counts, now, timestamp_ms);

        BaselineReport {
            group_by: config.group_by,
            lookback_ms: config.lookback.as_millis() as u64,
            groups_seen: latencies.len(),
            anomalies,
            shift,
        }
    }
}

impl Default for BaselineDetector {
    fn default() -> Self {
        Self {
            state: Mutex::new(DetectorState {
                dedupe: AlertDeduper::new(BaselineConfig::default().cooldown),
                config: BaselineConfig::default(),
                baselines: HashMap::new(),
                previous_shares: HashMap::new(),
            }),
        }
    }
}

/// Compare this pass's distribution with the last one and remember it.
///
/// Passes with fewer than `shift_min_total` records neither detect nor
/// replace the remembered distribution.
fn detect_shift(
    state: &mut DetectorState,
    config: &BaselineConfig,
    counts: &BTreeMap<String, u64>,
    now: Instant,
    timestamp_ms: u64,
) -> Option<ShiftEvent> {
    let total: u64 = counts.values().sum();
    if total == 0 || total < config.shift_min_total {
        return None;
    }

    let current: BTreeMap<String, f64> = counts
        .iter()
        .map(|(group, &count)| (group.clone(), count as f64 / total as f64))
        .collect();
    let previous = state
        .previous_shares
        .insert(config.group_by, current.clone())?;

    let distance = l1_distance(&previous, &current);
    if distance < config.shift_threshold {
        return None;
    }

    let dimension = format!("count_by_{}", config.group_by.as_str());
    if !state.dedupe.should_send(&format!("shift:{dimension}"), now) {
        return None;
    }
    debug!(dimension = %dimension, distance, "traffic shift");
    Some(ShiftEvent {
        dimension,
        distance,
        previous_top: top_shares(&previous),
        current_top: top_shares(&current),
        timestamp_ms,
    })
}

fn l1_distance(p: &BTreeMap<String, f64>, q: &BTreeMap<String, f64>) -> f64 {
    let only_p: f64 = p
        .iter()
        .map(|(group, share)| (share - q.get(group).copied().unwrap_or(0.0)).abs())
        .sum();
    let only_q: f64 = q
        .iter()
        .filter(|(group, _)| !p.contains_key(*group))
        .map(|(_, share)| share)
        .sum();
    only_p + only_q
}

fn top_shares(shares: &BTreeMap<String, f64>) -> Vec<GroupShare> {
    let mut ranked: Vec<GroupShare> = shares
        .iter()
        .map(|(group, &share)| GroupShare {
            group: group.clone(),
            share,
        })
        .collect();
    ranked.sort_by(|a, b| stats::desc_then((a.share, &a.group), (b.share, &b.group)));
    ranked.truncate(SHIFT_TOP_GROUPS);
    ranked
}
