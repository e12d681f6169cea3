//! Configuration types for the registry and the latency monitor.
//!
//! These are plain serde structs; layering of files and environment variables
//! is left to the embedding binary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::baseline::BaselineConfig;
use crate::capability::BindConfig;
use crate::duration::serde_str;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowwatchConfig {
    /// Capabilities to add to the registry at startup.
    pub capabilities: Vec<CapabilityConfig>,
    pub monitor: MonitorConfig,
    /// Baseline anomaly and traffic shift detection.
    pub baseline: BaselineConfig,
    /// How long `stop` waits for an in-flight decode before aborting the loop.
    #[serde(with = "serde_str")]
    pub stop_grace: Duration,
}

impl Default for FlowwatchConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            monitor: MonitorConfig::default(),
            baseline: BaselineConfig::default(),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Identifier the capability is known by.
    pub id: String,
    /// Loader reference; defaults to `id`.
    #[serde(default)]
    pub loader: Option<String>,
    /// Listen address; defaults to the capability's own.
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub autoload: bool,
    #[serde(default)]
    pub autostart: bool,
}

impl CapabilityConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            loader: None,
            bind: None,
            autoload: false,
            autostart: false,
        }
    }

    pub fn with_bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = Some(addr.into());
        self
    }

    pub fn with_loader(mut self, reference: impl Into<String>) -> Self {
        self.loader = Some(reference.into());
        self
    }

    pub fn loader_reference(&self) -> &str {
        self.loader.as_deref().unwrap_or(&self.id)
    }

    pub fn bind_config(&self) -> Option<BindConfig> {
        self.bind.as_ref().map(BindConfig::new)
    }
}

/// Latency monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum records kept per capability window.
    pub window_max_records: usize,
    /// Maximum record age; zero disables age eviction.
    #[serde(with = "serde_str")]
    pub window_max_age: Duration,
    /// Latency-bearing records required before statistics are reported.
    pub min_samples: u64,
    /// Minimum gap between two alerts with the same key.
    #[serde(with = "serde_str")]
    pub alert_cooldown: Duration,
    /// Number of flows listed in a report.
    pub top_flows: usize,
    /// Initial thresholds, metric name to bound.
    pub thresholds: BTreeMap<String, f64>,
    /// When set, run `monitor_once` on this interval.
    #[serde(with = "serde_str::option")]
    pub interval: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_max_records: 10_000,
            window_max_age: Duration::from_secs(300),
            min_samples: 1,
            alert_cooldown: Duration::from_secs(120),
            top_flows: 10,
            thresholds: BTreeMap::new(),
            interval: None,
        }
    }
}
