//! Latency report - the answer to an analyze or monitor query.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::SCHEMA_VERSION;

/// Minor revision of the report schema. Bumped for additive fields.
pub const SCHEMA_MINOR: u32 = 1;

/// Report schema version, serialized as `"major.minor"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(into = "String", try_from = "String"))]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn current() -> Self {
        Self {
            major: SCHEMA_VERSION,
            minor: SCHEMA_MINOR,
        }
    }

    /// A reader of this version can consume `other` when the majors match.
    pub fn can_read(&self, other: &SchemaVersion) -> bool {
        self.major == other.major
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error returned for a version string that is not `"major.minor"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSchemaVersion(pub String);

impl fmt::Display for InvalidSchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid report schema version: {}", self.0)
    }
}

impl std::error::Error for InvalidSchemaVersion {}

impl FromStr for SchemaVersion {
    type Err = InvalidSchemaVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSchemaVersion(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = InvalidSchemaVersion;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A latency statistic that can carry a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LatencyMetric {
    #[cfg_attr(feature = "serde", serde(rename = "mean_latency_ms"))]
    Mean,
    #[cfg_attr(feature = "serde", serde(rename = "p50_latency_ms"))]
    P50,
    #[cfg_attr(feature = "serde", serde(rename = "p95_latency_ms"))]
    P95,
    #[cfg_attr(feature = "serde", serde(rename = "p99_latency_ms"))]
    P99,
    #[cfg_attr(feature = "serde", serde(rename = "max_latency_ms"))]
    Max,
}

impl LatencyMetric {
    pub const ALL: [LatencyMetric; 5] = [
        LatencyMetric::Mean,
        LatencyMetric::P50,
        LatencyMetric::P95,
        LatencyMetric::P99,
        LatencyMetric::Max,
    ];

    /// Name used in threshold mappings and reports.
    pub fn name(&self) -> &'static str {
        match self {
            LatencyMetric::Mean => "mean_latency_ms",
            LatencyMetric::P50 => "p50_latency_ms",
            LatencyMetric::P95 => "p95_latency_ms",
            LatencyMetric::P99 => "p99_latency_ms",
            LatencyMetric::Max => "max_latency_ms",
        }
    }
}

impl fmt::Display for LatencyMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unsupported metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetric(pub String);

impl fmt::Display for UnknownMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown latency metric: {}", self.0)
    }
}

impl std::error::Error for UnknownMetric {}

impl FromStr for LatencyMetric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LatencyMetric::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Summary statistics over the latency-bearing records of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LatencyStats {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// The value of one thresholdable statistic.
    pub fn value(&self, metric: LatencyMetric) -> f64 {
        match metric {
            LatencyMetric::Mean => self.mean_ms,
            LatencyMetric::P50 => self.p50_ms,
            LatencyMetric::P95 => self.p95_ms,
            LatencyMetric::P99 => self.p99_ms,
            LatencyMetric::Max => self.max_ms,
        }
    }
}

/// Pass/fail result for one configured threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThresholdEvaluation {
    pub metric: LatencyMetric,
    pub bound: f64,
    pub observed: f64,
    pub passed: bool,
}

impl ThresholdEvaluation {
    /// A statistic breaches its bound when it reaches or exceeds it.
    pub fn evaluate(metric: LatencyMetric, bound: f64, stats: &LatencyStats) -> Self {
        let observed = stats.value(metric);
        Self {
            metric,
            bound,
            observed,
            passed: observed < bound,
        }
    }
}

/// Latency summary for a single flow key.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowLatency {
    pub flow: String,
    pub samples: u64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
    pub offender: bool,
}

/// Whether there was enough data to compute statistics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "status", rename_all = "snake_case"))]
pub enum ReportOutcome {
    /// Fewer latency-bearing records than required; no statistic is reported.
    InsufficientData {
        latency_samples: u64,
        min_samples: u64,
    },
    Evaluated {
        stats: LatencyStats,
        evaluations: Vec<ThresholdEvaluation>,
        healthy: bool,
    },
}

/// What an alert was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AlertKind {
    /// An aggregate statistic breached its threshold.
    Threshold,
    /// A single flow's p95 breached the p95 threshold.
    Flow,
}

/// An alert produced by a monitoring pass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LatencyAlert {
    pub kind: AlertKind,
    /// Dedupe key: the scope for threshold alerts, the flow key for flow alerts.
    pub key: String,
    pub metric: LatencyMetric,
    pub observed: f64,
    pub bound: f64,
    pub samples: u64,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Result of `analyze` or `monitor_once`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LatencyReport {
    pub version: SchemaVersion,
    pub generated_at_ms: u64,
    /// Capability the report is scoped to; `None` aggregates all.
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: Option<String>,
    /// Lookback applied on top of the window, when narrower than it.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub lookback_ms: Option<u64>,
    /// Records in window, with or without latency.
    pub flow_count: u64,
    pub latency_samples: u64,
    pub outcome: ReportOutcome,
    #[cfg_attr(feature = "serde", serde(default))]
    pub top_flows: Vec<FlowLatency>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub alerts: Vec<LatencyAlert>,
}

impl LatencyReport {
    pub fn stats(&self) -> Option<&LatencyStats> {
        match &self.outcome {
            ReportOutcome::Evaluated { stats, .. } => Some(stats),
            ReportOutcome::InsufficientData { .. } => None,
        }
    }

    pub fn evaluations(&self) -> &[ThresholdEvaluation] {
        match &self.outcome {
            ReportOutcome::Evaluated { evaluations, .. } => evaluations,
            ReportOutcome::InsufficientData { .. } => &[],
        }
    }

    /// True when this build can interpret the report's layout.
    pub fn is_readable(&self) -> bool {
        SchemaVersion::current().can_read(&self.version)
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self.outcome, ReportOutcome::InsufficientData { .. })
    }

    /// True when statistics were computed and no threshold was breached.
    pub fn is_healthy(&self) -> bool {
        matches!(self.outcome, ReportOutcome::Evaluated { healthy: true, .. })
    }

    /// Evaluations keyed by metric name.
    pub fn evaluation_map(&self) -> BTreeMap<&'static str, &ThresholdEvaluation> {
        self.evaluations()
            .iter()
            .map(|e| (e.metric.name(), e))
            .collect()
    }
}
