//! Named operations over the registry and monitor.
//!
//! Every call returns a [`ToolResponse`]; errors are values, never panics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flowwatch_types::LatencyReport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::baseline::{BaselineDetector, BaselineUpdate};
use crate::duration::serde_str;
use crate::error::{InvalidSetting, LoadError, RegistryError};
use crate::monitor::{validate_thresholds, LatencyMonitor, MonitorTuning, ThresholdMode};
use crate::registry::CapabilityRegistry;

/// A tool invocation as received from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    ListCapabilities,
    CapabilityStatus {
        identifier: String,
    },
    LoadCapability {
        identifier: String,
    },
    UnloadCapability {
        identifier: String,
    },
    StartCollection {
        identifier: String,
    },
    StopCollection {
        identifier: String,
    },
    /// Thresholds plus optional window and alert settings.
    SetThresholds {
        #[serde(default)]
        thresholds: BTreeMap<String, f64>,
        #[serde(default)]
        mode: ThresholdMode,
        #[serde(flatten)]
        tuning: MonitorTuning,
    },
    AnalyzeLatency {
        #[serde(default)]
        identifier: Option<String>,
        /// Only records received within this duration, e.g. `"30s"`.
        #[serde(default, with = "serde_str::option", skip_serializing_if = "Option::is_none")]
        lookback: Option<Duration>,
    },
    MonitorOnce,
    ResetWindow {
        #[serde(default)]
        identifier: Option<String>,
    },
    ConfigureBaseline {
        #[serde(flatten)]
        settings: BaselineUpdate,
    },
    AnalyzeBaseline,
}

/// Category of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LoadError,
    BindError,
    InvalidThreshold,
    InvalidSetting,
    UnknownCapability,
    Duplicate,
    NotLoaded,
    NotRunning,
    StillRunning,
    InvalidRequest,
    Internal,
}

/// Structured result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    Ok { data: Value },
    /// The query ran but there was not enough data for statistics.
    InsufficientData { data: Value },
    Error { kind: ErrorKind, message: String },
}

impl ToolResponse {
    fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => ToolResponse::Ok { data },
            Err(e) => Self::error(ErrorKind::Internal, e),
        }
    }

    fn error(kind: ErrorKind, message: impl ToString) -> Self {
        ToolResponse::Error {
            kind,
            message: message.to_string(),
        }
    }

    fn report(report: &LatencyReport) -> Self {
        match Self::ok(report) {
            ToolResponse::Ok { data } if report.is_insufficient() => {
                ToolResponse::InsufficientData { data }
            }
            other => other,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolResponse::Ok { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolResponse::Ok { data } | ToolResponse::InsufficientData { data } => Some(data),
            ToolResponse::Error { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ToolResponse::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<RegistryError> for ToolResponse {
    fn from(err: RegistryError) -> Self {
        let kind = match &err {
            RegistryError::Load(LoadError::UnknownCapability(_)) => ErrorKind::UnknownCapability,
            RegistryError::Load(_) => ErrorKind::LoadError,
            RegistryError::Bind(_) => ErrorKind::BindError,
            RegistryError::UnknownCapability(_) => ErrorKind::UnknownCapability,
            RegistryError::Duplicate(_) => ErrorKind::Duplicate,
            RegistryError::NotLoaded(_) => ErrorKind::NotLoaded,
            RegistryError::NotRunning(_) => ErrorKind::NotRunning,
            RegistryError::StillRunning(_) => ErrorKind::StillRunning,
        };
        Self::error(kind, err)
    }
}

impl From<InvalidSetting> for ToolResponse {
    fn from(err: InvalidSetting) -> Self {
        Self::error(ErrorKind::InvalidSetting, err)
    }
}

/// Maps named operations onto an injected registry, monitor and baseline detector.
#[derive(Debug, Clone)]
pub struct ToolSurface {
    registry: Arc<CapabilityRegistry>,
    monitor: Arc<LatencyMonitor>,
    baseline: Arc<BaselineDetector>,
}

impl ToolSurface {
    /// A surface with a default-configured baseline detector.
    pub fn new(registry: Arc<CapabilityRegistry>, monitor: Arc<LatencyMonitor>) -> Self {
        Self {
            registry,
            monitor,
            baseline: Arc::new(BaselineDetector::default()),
        }
    }

    pub fn with_baseline(mut self, baseline: Arc<BaselineDetector>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn baseline(&self) -> &Arc<BaselineDetector> {
        &self.baseline
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<LatencyMonitor> {
        &self.monitor
    }

    /// Dispatch a parsed call.
    pub async fn invoke(&self, call: ToolCall) -> ToolResponse {
        debug!(?call, "tool call");
        match call {
            ToolCall::ListCapabilities => self.list_capabilities(),
            ToolCall::CapabilityStatus { identifier } => self.capability_status(&identifier),
            ToolCall::LoadCapability { identifier } => self.load_capability(&identifier).await,
            ToolCall::UnloadCapability { identifier } => self.unload_capability(&identifier).await,
            ToolCall::StartCollection { identifier } => self.start_collection(&identifier).await,
            ToolCall::StopCollection { identifier } => self.stop_collection(&identifier).await,
            ToolCall::SetThresholds {
                thresholds,
                mode,
                tuning,
            } => self.configure_monitor(&thresholds, mode, &tuning),
            ToolCall::AnalyzeLatency {
                identifier,
                lookback,
            } => self.analyze_latency_within(identifier.as_deref(), lookback),
            ToolCall::MonitorOnce => self.monitor_once(),
            ToolCall::ResetWindow { identifier } => self.reset_window(identifier.as_deref()),
            ToolCall::ConfigureBaseline { settings } => self.configure_baseline(&settings),
            ToolCall::AnalyzeBaseline => self.analyze_baseline(),
        }
    }

    /// Parse one JSON request and dispatch it.
    pub async fn invoke_json(&self, request: &str) -> ToolResponse {
        match serde_json::from_str::<ToolCall>(request) {
            Ok(call) => self.invoke(call).await,
            Err(e) => ToolResponse::error(ErrorKind::InvalidRequest, e),
        }
    }

    pub fn list_capabilities(&self) -> ToolResponse {
        let entries: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .map(|s| json!({ "identifier": s.identifier, "state": s.state }))
            .collect();
        ToolResponse::ok(&entries)
    }

    pub fn capability_status(&self, identifier: &str) -> ToolResponse {
        match self.registry.status(identifier) {
            Ok(status) => ToolResponse::ok(&status),
            Err(e) => e.into(),
        }
    }

    pub async fn load_capability(&self, identifier: &str) -> ToolResponse {
        match self.registry.load(identifier).await {
            Ok(status) => ToolResponse::ok(&status),
            Err(e) => e.into(),
        }
    }

    pub async fn unload_capability(&self, identifier: &str) -> ToolResponse {
        match self.registry.unload(identifier).await {
            Ok(status) => ToolResponse::ok(&status),
            Err(e) => e.into(),
        }
    }

    pub async fn start_collection(&self, identifier: &str) -> ToolResponse {
        match self.registry.start(identifier).await {
            Ok(status) => ToolResponse::ok(&status),
            Err(e) => e.into(),
        }
    }

    pub async fn stop_collection(&self, identifier: &str) -> ToolResponse {
        match self.registry.stop(identifier).await {
            Ok(status) => ToolResponse::ok(&status),
            Err(e) => e.into(),
        }
    }

    pub fn set_thresholds(&self, mapping: &BTreeMap<String, f64>, mode: ThresholdMode) -> ToolResponse {
        self.configure_monitor(mapping, mode, &MonitorTuning::default())
    }

    /// Update thresholds and settings together; nothing changes unless both are valid.
    pub fn configure_monitor(
        &self,
        mapping: &BTreeMap<String, f64>,
        mode: ThresholdMode,
        tuning: &MonitorTuning,
    ) -> ToolResponse {
        if let Err(e) = validate_thresholds(mapping) {
            return ToolResponse::error(ErrorKind::InvalidThreshold, e);
        }
        if let Err(e) = tuning.validate() {
            return e.into();
        }

        let current = match self.monitor.set_thresholds(mapping, mode) {
            Ok(current) => current,
            Err(e) => return ToolResponse::error(ErrorKind::InvalidThreshold, e),
        };
        let settings = match self.monitor.tune(tuning) {
            Ok(settings) => settings,
            Err(e) => return e.into(),
        };
        let named: BTreeMap<&str, f64> = current.iter().map(|(m, v)| (m.name(), *v)).collect();
        ToolResponse::ok(&json!({ "thresholds": named, "settings": settings }))
    }

    pub fn analyze_latency(&self, identifier: Option<&str>) -> ToolResponse {
        self.analyze_latency_within(identifier, None)
    }

    /// Analyze, optionally narrowed to records received within `lookback`.
    pub fn analyze_latency_within(
        &self,
        identifier: Option<&str>,
        lookback: Option<Duration>,
    ) -> ToolResponse {
        if let Some(id) = identifier {
            if !self.registry.contains(id) {
                return RegistryError::UnknownCapability(id.to_string()).into();
            }
        }
        if lookback.is_some_and(|l| l.is_zero()) {
            return InvalidSetting::new("lookback", "must be greater than zero").into();
        }
        ToolResponse::report(&self.monitor.analyze_within(identifier, lookback))
    }

    pub fn monitor_once(&self) -> ToolResponse {
        ToolResponse::report(&self.monitor.monitor_once())
    }

    pub fn reset_window(&self, identifier: Option<&str>) -> ToolResponse {
        if let Some(id) = identifier {
            if !self.registry.contains(id) {
                return RegistryError::UnknownCapability(id.to_string()).into();
            }
        }
        let dropped = self.monitor.reset(identifier);
        ToolResponse::ok(&json!({ "dropped_records": dropped }))
    }

    pub fn configure_baseline(&self, update: &BaselineUpdate) -> ToolResponse {
        match self.baseline.configure(update) {
            Ok(config) => ToolResponse::ok(&config),
            Err(e) => e.into(),
        }
    }

    pub fn analyze_baseline(&self) -> ToolResponse {
        ToolResponse::ok(&self.baseline.analyze_once(&self.monitor))
    }
}
