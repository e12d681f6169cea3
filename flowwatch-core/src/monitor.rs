//! Rolling latency windows, threshold evaluation and alerting.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowwatch_types::{
    current_timestamp_ms, AlertKind, FlowLatency, FlowRecord, LatencyAlert, LatencyMetric,
    LatencyReport, ReportOutcome, SchemaVersion, ThresholdEvaluation,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::capability::FlowSink;
use crate::config::MonitorConfig;
use crate::dedupe::AlertDeduper;
use crate::duration::serde_str;
use crate::error::{InvalidSetting, InvalidThreshold};
use crate::stats::{self, Sample};

/// How `set_thresholds` combines the new mapping with the current one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Overwrite only the metrics named; keep the rest.
    #[default]
    Merge,
    /// Discard every current threshold first.
    Replace,
}

/// Window and alert settings that can change while collection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(with = "serde_str")]
    pub window_max_age: Duration,
    pub min_samples: u64,
    #[serde(with = "serde_str")]
    pub alert_cooldown: Duration,
}

/// Partial update to [`MonitorSettings`]. Absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTuning {
    #[serde(default, with = "serde_str::option", skip_serializing_if = "Option::is_none")]
    pub window_max_age: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_samples: Option<u64>,
    #[serde(default, with = "serde_str::option", skip_serializing_if = "Option::is_none")]
    pub alert_cooldown: Option<Duration>,
}

impl MonitorTuning {
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        if self.min_samples == Some(0) {
            return Err(InvalidSetting::new("min_samples", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct WindowEntry {
    seq: u64,
    record: FlowRecord,
}

/// FIFO of recent records for one capability.
#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<WindowEntry>,
}

impl Window {
    fn evict_expired(&mut self, now: Instant, max_age: Duration) {
        if max_age.is_zero() {
            return;
        }
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.record.timestamp().received) > max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-record data copied out of a window for analysis.
struct Observation {
    seq: u64,
    latency_ms: Option<f64>,
    flow_key: Option<String>,
}

/// Owns the rolling windows and thresholds.
///
/// `ingest` is called concurrently by every running capability loop; it only
/// takes the lock of its own capability's window. `analyze` copies each
/// window under that same lock, so eviction is never observed half-done.
///
/// # Example
///
/// ```rust
/// use flowwatch_core::{LatencyMonitor, MonitorConfig};
/// use flowwatch_types::{FlowRecord, ProtocolTag};
///
/// let monitor = LatencyMonitor::new(&MonitorConfig::default()).unwrap();
/// for latency in [10.0, 20.0, 30.0, 40.0, 100.0] {
///     monitor.ingest(
///         FlowRecord::builder("json_udp", ProtocolTag::Json)
///             .latency_ms(latency)
///             .build(),
///     );
/// }
///
/// let report = monitor.analyze(Some("json_udp"));
/// let stats = report.stats().unwrap();
/// assert_eq!(stats.p50_ms, 30.0);
/// assert_eq!(stats.p95_ms, 100.0);
/// ```
#[derive(Debug)]
pub struct LatencyMonitor {
    windows: RwLock<BTreeMap<String, Arc<Mutex<Window>>>>,
    next_seq: AtomicU64,
    thresholds: RwLock<BTreeMap<LatencyMetric, f64>>,
    dedupe: Mutex<AlertDeduper>,
    max_records: usize,
    /// Age bound and statistics gate; the cooldown lives in `dedupe`.
    limits: RwLock<Limits>,
    top_flows: usize,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_age: Duration,
    min_samples: u64,
}

impl LatencyMonitor {
    /// Build a monitor, validating the configured thresholds.
    pub fn new(config: &MonitorConfig) -> Result<Self, InvalidThreshold> {
        let thresholds = validate_thresholds(&config.thresholds)?;
        Ok(Self {
            windows: RwLock::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            thresholds: RwLock::new(thresholds),
            dedupe: Mutex::new(AlertDeduper::new(config.alert_cooldown)),
            max_records: config.window_max_records.max(1),
            limits: RwLock::new(Limits {
                max_age: config.window_max_age,
                min_samples: config.min_samples.max(1),
            }),
            top_flows: config.top_flows,
        })
    }

    /// Get or create the window for a capability.
    fn window(&self, capability: &str) -> Arc<Mutex<Window>> {
        // Fast path: check if it exists
        {
            let windows = self.windows.read();
            if let Some(window) = windows.get(capability) {
                return window.clone();
            }
        }

        // Slow path: create it
        let mut windows = self.windows.write();
        windows
            .entry(capability.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Window::default())))
            .clone()
    }

    /// Append a record to its capability's window, evicting the oldest
    /// entries beyond the count or age bound.
    pub fn ingest(&self, record: FlowRecord) {
        let window = self.window(record.source_capability());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let max_age = self.limits.read().max_age;
        let now = Instant::now();

        let mut window = window.lock();
        window.entries.push_back(WindowEntry { seq, record });
        while window.entries.len() > self.max_records {
            window.entries.pop_front();
        }
        window.evict_expired(now, max_age);
    }

    /// Validate every entry, then merge or replace the thresholds.
    ///
    /// Nothing changes if any entry is invalid. Returns the resulting set.
    pub fn set_thresholds(
        &self,
        mapping: &BTreeMap<String, f64>,
        mode: ThresholdMode,
    ) -> Result<BTreeMap<LatencyMetric, f64>, InvalidThreshold> {
        let validated = validate_thresholds(mapping)?;

        let mut thresholds = self.thresholds.write();
        if mode == ThresholdMode::Replace {
            thresholds.clear();
        }
        thresholds.extend(validated);
        Ok(thresholds.clone())
    }

    pub fn thresholds(&self) -> BTreeMap<LatencyMetric, f64> {
        self.thresholds.read().clone()
    }

    /// Apply a partial settings update. Nothing changes if it is invalid.
    ///
    /// A shorter age bound takes effect on the next ingest or analyze.
    pub fn tune(&self, tuning: &MonitorTuning) -> Result<MonitorSettings, InvalidSetting> {
        tuning.validate()?;
        {
            let mut limits = self.limits.write();
            if let Some(max_age) = tuning.window_max_age {
                limits.max_age = max_age;
            }
            if let Some(min_samples) = tuning.min_samples {
                limits.min_samples = min_samples;
            }
        }
        if let Some(cooldown) = tuning.alert_cooldown {
            self.dedupe.lock().set_cooldown(cooldown);
        }
        Ok(self.settings())
    }

    pub fn settings(&self) -> MonitorSettings {
        let limits = *self.limits.read();
        MonitorSettings {
            window_max_age: limits.max_age,
            min_samples: limits.min_samples,
            alert_cooldown: self.dedupe.lock().cooldown(),
        }
    }

    /// Statistics over the current window of one capability, or of all
    /// capabilities when `scope` is `None`.
    pub fn analyze(&self, scope: Option<&str>) -> LatencyReport {
        self.build_report(scope, None).0
    }

    /// Like [`analyze`](Self::analyze), restricted to records received within
    /// `lookback`. A lookback wider than the window changes nothing.
    pub fn analyze_within(&self, scope: Option<&str>, lookback: Option<Duration>) -> LatencyReport {
        self.build_report(scope, lookback).0
    }

    /// Copies of the records currently in window, oldest first per capability.
    pub fn recent_records(&self, scope: Option<&str>, lookback: Option<Duration>) -> Vec<FlowRecord> {
        let mut records = Vec::new();
        self.visit_window(scope, lookback, |entry| records.push(entry.record.clone()));
        records
    }

    /// Aggregate analysis plus alerts for breached thresholds and offending
    /// flows, deduplicated per key over the alert cooldown.
    pub fn monitor_once(&self) -> LatencyReport {
        let (mut report, offenders) = self.build_report(None, None);
        let now = Instant::now();
        let timestamp_ms = report.generated_at_ms;

        let mut alerts = Vec::new();
        let mut dedupe = self.dedupe.lock();
        dedupe.prune(now);

        for eval in report.evaluations().iter().filter(|e| !e.passed) {
            let key = format!("all:{}", eval.metric);
            if dedupe.should_send(&key, now) {
                alerts.push(LatencyAlert {
                    kind: AlertKind::Threshold,
                    message: format!(
                        "{} is {:.2}ms, threshold {:.2}ms",
                        eval.metric, eval.observed, eval.bound
                    ),
                    key,
                    metric: eval.metric,
                    observed: eval.observed,
                    bound: eval.bound,
                    samples: report.latency_samples,
                    timestamp_ms,
                });
            }
        }

        if let Some(bound) = self.thresholds.read().get(&LatencyMetric::P95).copied() {
            for flow in offenders {
                if dedupe.should_send(&flow.flow, now) {
                    alerts.push(LatencyAlert {
                        kind: AlertKind::Flow,
                        message: format!(
                            "High latency flow {} p95={:.2}ms (n={})",
                            flow.flow, flow.p95_ms, flow.samples
                        ),
                        key: flow.flow,
                        metric: LatencyMetric::P95,
                        observed: flow.p95_ms,
                        bound,
                        samples: flow.samples,
                        timestamp_ms,
                    });
                }
            }
        }

        report.alerts = alerts;
        report
    }

    /// Clear one capability's window, or all of them. Returns records dropped.
    pub fn reset(&self, scope: Option<&str>) -> usize {
        let windows = self.windows.read();
        let mut dropped = 0;
        for (name, window) in windows.iter() {
            if scope.map_or(true, |s| s == name) {
                let mut window = window.lock();
                dropped += window.entries.len();
                window.entries.clear();
            }
        }
        drop(windows);

        if scope.is_none() {
            self.dedupe.lock().clear();
        }
        dropped
    }

    /// Number of records currently held for a capability.
    pub fn window_len(&self, capability: &str) -> usize {
        self.windows
            .read()
            .get(capability)
            .map_or(0, |w| w.lock().entries.len())
    }

    /// Evict expired entries, then call `visit` for each entry in scope,
    /// holding each window's lock while it is visited.
    fn visit_window<F>(&self, scope: Option<&str>, lookback: Option<Duration>, mut visit: F)
    where
        F: FnMut(&WindowEntry),
    {
        let now = Instant::now();
        let max_age = self.limits.read().max_age;
        let windows: Vec<Arc<Mutex<Window>>> = {
            let map = self.windows.read();
            match scope {
                Some(name) => map.get(name).cloned().into_iter().collect(),
                None => map.values().cloned().collect(),
            }
        };

        for window in windows {
            let mut window = window.lock();
            window.evict_expired(now, max_age);
            for entry in &window.entries {
                let in_lookback = lookback.map_or(true, |lookback| {
                    now.saturating_duration_since(entry.record.timestamp().received) <= lookback
                });
                if in_lookback {
                    visit(entry);
                }
            }
        }
    }

    fn snapshot(&self, scope: Option<&str>, lookback: Option<Duration>) -> Vec<Observation> {
        let mut observations = Vec::new();
        self.visit_window(scope, lookback, |entry| {
            observations.push(Observation {
                seq: entry.seq,
                latency_ms: entry.record.latency_ms(),
                flow_key: entry.record.flow_key(),
            })
        });
        observations
    }

    /// Build a report and the full list of offending flows.
    fn build_report(
        &self,
        scope: Option<&str>,
        lookback: Option<Duration>,
    ) -> (LatencyReport, Vec<FlowLatency>) {
        let observations = self.snapshot(scope, lookback);
        let thresholds = self.thresholds();
        let min_samples = self.limits.read().min_samples;

        let mut samples: Vec<Sample> = observations
            .iter()
            .filter_map(|o| {
                o.latency_ms.map(|latency_ms| Sample {
                    latency_ms,
                    seq: o.seq,
                })
            })
            .collect();
        let latency_samples = samples.len() as u64;

        let outcome = match stats::summarize(&mut samples) {
            Some(stats) if latency_samples >= min_samples => {
                let evaluations: Vec<ThresholdEvaluation> = thresholds
                    .iter()
                    .map(|(&metric, &bound)| ThresholdEvaluation::evaluate(metric, bound, &stats))
                    .collect();
                let healthy = evaluations.iter().all(|e| e.passed);
                ReportOutcome::Evaluated {
                    stats,
                    evaluations,
                    healthy,
                }
            }
            _ => ReportOutcome::InsufficientData {
                latency_samples,
                min_samples,
            },
        };

        let mut flows =
            self.flow_latencies(&observations, thresholds.get(&LatencyMetric::P95), min_samples);
        let offenders: Vec<FlowLatency> = flows.iter().filter(|f| f.offender).cloned().collect();
        flows.truncate(self.top_flows);

        let report = LatencyReport {
            version: SchemaVersion::current(),
            generated_at_ms: current_timestamp_ms(),
            scope: scope.map(str::to_string),
            lookback_ms: lookback.map(|l| l.as_millis() as u64),
            flow_count: observations.len() as u64,
            latency_samples,
            outcome,
            top_flows: flows,
            alerts: Vec::new(),
        };
        (report, offenders)
    }

    /// Per-flow summaries ranked by p95 descending.
    fn flow_latencies(
        &self,
        observations: &[Observation],
        p95_bound: Option<&f64>,
        min_samples: u64,
    ) -> Vec<FlowLatency> {
        let mut groups: HashMap<&str, Vec<Sample>> = HashMap::new();
        for o in observations {
            if let (Some(key), Some(latency_ms)) = (o.flow_key.as_deref(), o.latency_ms) {
                groups.entry(key).or_default().push(Sample {
                    latency_ms,
                    seq: o.seq,
                });
            }
        }

        let mut flows: Vec<FlowLatency> = groups
            .into_iter()
            .filter_map(|(key, mut samples)| {
                let stats = stats::summarize(&mut samples)?;
                let offender = p95_bound
                    .map_or(false, |&bound| stats.count >= min_samples && stats.p95_ms >= bound);
                Some(FlowLatency {
                    flow: key.to_string(),
                    samples: stats.count,
                    mean_ms: stats.mean_ms,
                    p95_ms: stats.p95_ms,
                    max_ms: stats.max_ms,
                    offender,
                })
            })
            .collect();

        flows.sort_by(|a, b| stats::desc_then((a.p95_ms, &a.flow), (b.p95_ms, &b.flow)));
        flows
    }
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self {
            windows: RwLock::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            thresholds: RwLock::new(BTreeMap::new()),
            dedupe: Mutex::new(AlertDeduper::new(Duration::from_secs(120))),
            max_records: 10_000,
            limits: RwLock::new(Limits {
                max_age: Duration::from_secs(300),
                min_samples: 1,
            }),
            top_flows: 10,
        }
    }
}

impl FlowSink for LatencyMonitor {
    fn ingest(&self, record: FlowRecord) {
        LatencyMonitor::ingest(self, record);
    }
}

/// Check each bound is a known metric with a finite, non-negative value.
pub fn validate_thresholds(
    mapping: &BTreeMap<String, f64>,
) -> Result<BTreeMap<LatencyMetric, f64>, InvalidThreshold> {
    mapping
        .iter()
        .map(|(name, &value)| {
            let metric: LatencyMetric = name
                .parse()
                .map_err(|_| InvalidThreshold::UnknownMetric(name.clone()))?;
            if !value.is_finite() {
                return Err(InvalidThreshold::NotFinite {
                    metric: name.clone(),
                });
            }
            if value < 0.0 {
                return Err(InvalidThreshold::Negative {
                    metric: name.clone(),
                    value,
                });
            }
            Ok((metric, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowwatch_types::{Endpoint, FlowTimestamp, ProtocolTag};
    use std::net::{IpAddr, Ipv4Addr};

    fn record(capability: &str, latency: Option<f64>) -> FlowRecord {
        let builder = FlowRecord::builder(capability, ProtocolTag::Json).byte_count(100);
        match latency {
            Some(l) => builder.latency_ms(l).build(),
            None => builder.build(),
        }
    }

    fn flow_record(capability: &str, src_port: u16, latency: f64) -> FlowRecord {
        FlowRecord::builder(capability, ProtocolTag::Json)
            .source(Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), Some(src_port)))
            .destination(Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), Some(443)))
            .transport(6)
            .latency_ms(latency)
            .build()
    }

    fn thresholds(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn monitor_with(config: MonitorConfig) -> LatencyMonitor {
        LatencyMonitor::new(&config).unwrap()
    }

    #[test]
    fn empty_window_is_insufficient_data() {
        let monitor = LatencyMonitor::default();
        let report = monitor.analyze(None);

        assert!(report.is_insufficient());
        assert!(report.stats().is_none());
        assert_eq!(report.flow_count, 0);
    }

    #[test]
    fn records_without_latency_count_as_flows_only() {
        let monitor = LatencyMonitor::default();
        monitor.ingest(record("sflow_udp", None));
        monitor.ingest(record("sflow_udp", None));

        let report = monitor.analyze(Some("sflow_udp"));
        assert_eq!(report.flow_count, 2);
        assert_eq!(report.latency_samples, 0);
        assert!(report.is_insufficient());
    }

    #[test]
    fn percentiles_follow_nearest_rank() {
        let monitor = LatencyMonitor::default();
        for l in [10.0, 20.0, 30.0, 40.0, 100.0] {
            monitor.ingest(record("json_udp", Some(l)));
        }

        let stats = *monitor.analyze(Some("json_udp")).stats().unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.p50_ms, 30.0);
        assert_eq!(stats.p95_ms, 100.0);
        assert_eq!(stats.max_ms, 100.0);
    }

    #[test]
    fn count_bound_keeps_most_recent_records() {
        let monitor = monitor_with(MonitorConfig {
            window_max_records: 3,
            ..MonitorConfig::default()
        });
        for l in [1.0, 2.0, 3.0, 4.0, 5.0] {
            monitor.ingest(record("json_udp", Some(l)));
        }

        let report = monitor.analyze(Some("json_udp"));
        let stats = report.stats().unwrap();
        assert_eq!(monitor.window_len("json_udp"), 3);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 3.0);
        assert_eq!(stats.mean_ms, 4.0);
    }

    #[test]
    fn windows_are_bounded_per_capability() {
        let monitor = monitor_with(MonitorConfig {
            window_max_records: 2,
            ..MonitorConfig::default()
        });
        for l in [1.0, 2.0, 3.0] {
            monitor.ingest(record("a", Some(l)));
        }
        monitor.ingest(record("b", Some(50.0)));

        assert_eq!(monitor.window_len("a"), 2);
        assert_eq!(monitor.window_len("b"), 1);
        assert_eq!(monitor.analyze(None).latency_samples, 3);
    }

    #[test]
    fn aged_records_are_evicted() {
        let monitor = monitor_with(MonitorConfig {
            window_max_age: Duration::from_secs(60),
            ..MonitorConfig::default()
        });
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) else {
            return;
        };
        let stale = FlowRecord::builder("json_udp", ProtocolTag::Json)
            .timestamp(FlowTimestamp::new(0, old))
            .latency_ms(999.0)
            .build();
        monitor.ingest(stale);
        monitor.ingest(record("json_udp", Some(5.0)));

        let stats = *monitor.analyze(Some("json_udp")).stats().unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max_ms, 5.0);
    }

    #[test]
    fn thresholds_drive_pass_and_fail() {
        let monitor = LatencyMonitor::default();
        for l in [10.0, 20.0, 30.0, 40.0, 100.0] {
            monitor.ingest(record("json_udp", Some(l)));
        }
        monitor
            .set_thresholds(
                &thresholds(&[("p50_latency_ms", 50.0), ("p95_latency_ms", 80.0)]),
                ThresholdMode::Merge,
            )
            .unwrap();

        let report = monitor.analyze(None);
        let evals = report.evaluation_map();
        assert!(evals["p50_latency_ms"].passed);
        assert!(!evals["p95_latency_ms"].passed);
        assert!(!report.is_healthy());
    }

    #[test]
    fn merge_keeps_and_replace_discards() {
        let monitor = LatencyMonitor::default();
        monitor
            .set_thresholds(&thresholds(&[("max_latency_ms", 500.0)]), ThresholdMode::Merge)
            .unwrap();
        let merged = monitor
            .set_thresholds(&thresholds(&[("p95_latency_ms", 100.0)]), ThresholdMode::Merge)
            .unwrap();
        assert_eq!(merged.len(), 2);

        let replaced = monitor
            .set_thresholds(&thresholds(&[("p99_latency_ms", 200.0)]), ThresholdMode::Replace)
            .unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced.get(&LatencyMetric::P99), Some(&200.0));
    }

    #[test]
    fn invalid_threshold_leaves_state_untouched() {
        let monitor = LatencyMonitor::default();
        monitor
            .set_thresholds(&thresholds(&[("p95_latency_ms", 100.0)]), ThresholdMode::Merge)
            .unwrap();

        let err = monitor
            .set_thresholds(
                &thresholds(&[("max_latency_ms", 10.0), ("p95_latency_ms", f64::NAN)]),
                ThresholdMode::Replace,
            )
            .unwrap_err();
        assert!(matches!(err, InvalidThreshold::NotFinite { .. }));

        let err = monitor
            .set_thresholds(&thresholds(&[("p95_latency_ms", -1.0)]), ThresholdMode::Merge)
            .unwrap_err();
        assert!(matches!(err, InvalidThreshold::Negative { .. }));

        let err = monitor
            .set_thresholds(&thresholds(&[("jitter_ms", 1.0)]), ThresholdMode::Merge)
            .unwrap_err();
        assert_eq!(err, InvalidThreshold::UnknownMetric("jitter_ms".into()));

        let current = monitor.thresholds();
        assert_eq!(current.len(), 1);
        assert_eq!(current.get(&LatencyMetric::P95), Some(&100.0));
    }

    #[test]
    fn min_samples_gates_statistics() {
        let monitor = monitor_with(MonitorConfig {
            min_samples: 3,
            ..MonitorConfig::default()
        });
        monitor.ingest(record("json_udp", Some(1.0)));
        monitor.ingest(record("json_udp", Some(2.0)));
        assert!(monitor.analyze(None).is_insufficient());

        monitor.ingest(record("json_udp", Some(3.0)));
        assert!(!monitor.analyze(None).is_insufficient());
    }

    #[test]
    fn analyze_scopes_to_one_capability() {
        let monitor = LatencyMonitor::default();
        monitor.ingest(record("a", Some(10.0)));
        monitor.ingest(record("b", Some(90.0)));

        assert_eq!(monitor.analyze(Some("a")).stats().unwrap().max_ms, 10.0);
        assert_eq!(monitor.analyze(None).stats().unwrap().max_ms, 90.0);
        assert!(monitor.analyze(Some("c")).is_insufficient());
    }

    #[test]
    fn top_flows_rank_by_p95() {
        let monitor = monitor_with(MonitorConfig {
            top_flows: 2,
            ..MonitorConfig::default()
        });
        monitor.ingest(flow_record("json_udp", 1000, 5.0));
        monitor.ingest(flow_record("json_udp", 2000, 50.0));
        monitor.ingest(flow_record("json_udp", 3000, 20.0));
        monitor.ingest(record("json_udp", Some(500.0)));

        let report = monitor.analyze(None);
        let keys: Vec<&str> = report.top_flows.iter().map(|f| f.flow.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "10.0.0.1:2000->10.0.0.2:443/TCP",
                "10.0.0.1:3000->10.0.0.2:443/TCP"
            ]
        );
    }

    #[test]
    fn monitor_once_alerts_are_deduplicated() {
        let monitor = LatencyMonitor::default();
        monitor
            .set_thresholds(&thresholds(&[("p95_latency_ms", 100.0)]), ThresholdMode::Merge)
            .unwrap();
        monitor.ingest(flow_record("json_udp", 1000, 150.0));
        monitor.ingest(flow_record("json_udp", 2000, 10.0));

        let first = monitor.monitor_once();
        let kinds: Vec<AlertKind> = first.alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Threshold, AlertKind::Flow]);
        assert_eq!(first.alerts[1].key, "10.0.0.1:1000->10.0.0.2:443/TCP");

        let second = monitor.monitor_once();
        assert!(second.alerts.is_empty());

        assert!(monitor.analyze(None).alerts.is_empty());
    }

    #[test]
    fn reset_clears_selected_window() {
        let monitor = LatencyMonitor::default();
        monitor.ingest(record("a", Some(1.0)));
        monitor.ingest(record("b", Some(2.0)));

        assert_eq!(monitor.reset(Some("a")), 1);
        assert_eq!(monitor.window_len("a"), 0);
        assert_eq!(monitor.window_len("b"), 1);
        assert_eq!(monitor.reset(None), 1);
    }

    #[test]
    fn tuning_applies_at_runtime() {
        let monitor = LatencyMonitor::default();
        monitor.ingest(record("json_udp", Some(1.0)));
        monitor.ingest(record("json_udp", Some(2.0)));
        assert!(!monitor.analyze(None).is_insufficient());

        let settings = monitor
            .tune(&MonitorTuning {
                min_samples: Some(3),
                alert_cooldown: Some(Duration::from_secs(5)),
                ..MonitorTuning::default()
            })
            .unwrap();
        assert_eq!(settings.min_samples, 3);
        assert_eq!(settings.alert_cooldown, Duration::from_secs(5));
        assert_eq!(settings.window_max_age, Duration::from_secs(300));
        assert!(monitor.analyze(None).is_insufficient());

        let err = monitor
            .tune(&MonitorTuning {
                min_samples: Some(0),
                window_max_age: Some(Duration::from_secs(1)),
                ..MonitorTuning::default()
            })
            .unwrap_err();
        assert_eq!(err.name, "min_samples");
        assert_eq!(monitor.settings(), settings);
    }

    #[test]
    fn shorter_max_age_evicts_on_next_read() {
        let monitor = LatencyMonitor::default();
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) else {
            return;
        };
        monitor.ingest(
            FlowRecord::builder("json_udp", ProtocolTag::Json)
                .timestamp(FlowTimestamp::new(0, old))
                .latency_ms(999.0)
                .build(),
        );
        monitor.ingest(record("json_udp", Some(5.0)));
        assert_eq!(monitor.analyze(None).stats().unwrap().count, 2);

        monitor
            .tune(&MonitorTuning {
                window_max_age: Some(Duration::from_secs(60)),
                ..MonitorTuning::default()
            })
            .unwrap();
        assert_eq!(monitor.analyze(None).stats().unwrap().count, 1);
        assert_eq!(monitor.window_len("json_udp"), 1);
    }

    #[test]
    fn lookback_narrows_without_evicting() {
        let monitor = LatencyMonitor::default();
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) else {
            return;
        };
        monitor.ingest(
            FlowRecord::builder("json_udp", ProtocolTag::Json)
                .timestamp(FlowTimestamp::new(0, old))
                .latency_ms(999.0)
                .build(),
        );
        monitor.ingest(record("json_udp", Some(5.0)));

        let narrowed = monitor.analyze_within(Some("json_udp"), Some(Duration::from_secs(60)));
        assert_eq!(narrowed.lookback_ms, Some(60_000));
        assert_eq!(narrowed.stats().unwrap().max_ms, 5.0);

        let full = monitor.analyze(Some("json_udp"));
        assert_eq!(full.lookback_ms, None);
        assert_eq!(full.stats().unwrap().max_ms, 999.0);
        assert_eq!(monitor.recent_records(None, None).len(), 2);
        assert_eq!(monitor.recent_records(None, Some(Duration::from_secs(60))).len(), 1);
    }

    #[test]
    fn zero_cooldown_realerts_every_pass() {
        let monitor = LatencyMonitor::default();
        monitor
            .set_thresholds(&thresholds(&[("max_latency_ms", 10.0)]), ThresholdMode::Merge)
            .unwrap();
        monitor
            .tune(&MonitorTuning {
                alert_cooldown: Some(Duration::ZERO),
                ..MonitorTuning::default()
            })
            .unwrap();
        monitor.ingest(record("json_udp", Some(50.0)));

        assert_eq!(monitor.monitor_once().alerts.len(), 1);
        assert_eq!(monitor.monitor_once().alerts.len(), 1);
    }

    #[test]
    fn analyze_during_ingest_never_sees_more_than_the_bound() {
        let monitor = monitor_with(MonitorConfig {
            window_max_records: 50,
            ..MonitorConfig::default()
        });

        std::thread::scope(|scope| {
            for capability in ["a", "b"] {
                let monitor = &monitor;
                scope.spawn(move || {
                    for i in 0..5_000 {
                        monitor.ingest(record(capability, Some(f64::from(i % 100))));
                    }
                });
            }

            let monitor = &monitor;
            scope.spawn(move || {
                for _ in 0..500 {
                    let one = monitor.analyze(Some("a"));
                    assert!(one.flow_count <= 50, "saw {} records", one.flow_count);
                    let all = monitor.analyze(None);
                    assert!(all.flow_count <= 100, "saw {} records", all.flow_count);
                    if let Some(stats) = all.stats() {
                        assert_eq!(stats.count, all.latency_samples);
                        assert!(stats.p50_ms <= stats.p95_ms && stats.p95_ms <= stats.max_ms);
                    }
                }
            });
        });

        assert_eq!(monitor.window_len("a"), 50);
        assert_eq!(monitor.window_len("b"), 50);
    }

    #[test]
    fn config_thresholds_are_validated() {
        let mut config = MonitorConfig::default();
        config.thresholds.insert("p42_latency_ms".into(), 1.0);
        assert!(LatencyMonitor::new(&config).is_err());
    }
}
