//! # flowwatch-core
//!
//! The protocol-agnostic engine behind flowwatch: the capability contract,
//! the registry that drives capability lifecycles, the latency monitor
//! every running capability feeds, and the baseline detector that learns
//! what normal latency looks like per group of flows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flowwatch_core::{CapabilityRegistry, LatencyMonitor, LoaderCatalog, MonitorConfig, ToolSurface};
//!
//! #[tokio::main]
//! async fn main() {
//!     let monitor = Arc::new(LatencyMonitor::new(&MonitorConfig::default()).unwrap());
//!
//!     // Protocol crates register their loaders here.
//!     let catalog = LoaderCatalog::new();
//!
//!     let registry = Arc::new(CapabilityRegistry::new(
//!         catalog,
//!         monitor.clone(),
//!         Duration::from_secs(2),
//!     ));
//!     let tools = ToolSurface::new(registry, monitor);
//!
//!     let response = tools.invoke_json(r#"{"tool":"monitor_once"}"#).await;
//!     println!("{}", serde_json::to_string(&response).unwrap());
//! }
//! ```

mod baseline;
mod capability;
mod config;
mod dedupe;
pub mod duration;
mod error;
mod monitor;
pub mod periodic;
mod registry;
mod stats;
mod tools;

pub use baseline::{
    AnomalyEvent, BaselineConfig, BaselineDetector, BaselineReport, BaselineUpdate, GroupBy,
    GroupShare, ShiftEvent,
};
pub use capability::{
    BindConfig, Capability, CapabilityLoader, CloseHandle, CloseSignal, Collector, Decoder,
    FlowSink, LoaderCatalog, RawDatagram, DEFAULT_RECV_BUFFER,
};
pub use config::{CapabilityConfig, FlowwatchConfig, MonitorConfig};
pub use dedupe::AlertDeduper;
pub use error::{
    BindError, ConfigError, DecodeError, InvalidSetting, InvalidThreshold, LoadError,
    RegistryError,
};
pub use monitor::{
    validate_thresholds, LatencyMonitor, MonitorSettings, MonitorTuning, ThresholdMode,
};
pub use periodic::PeriodicHandle;
pub use registry::{CapabilityRegistry, CapabilityStatus, CounterSnapshot, Lifecycle};
pub use stats::{nearest_rank, sort_samples, summarize, Sample};
pub use tools::{ErrorKind, ToolCall, ToolResponse, ToolSurface};

// Re-export types for convenience
pub use flowwatch_types;
