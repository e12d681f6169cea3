//! # flowwatch
//!
//! Flow telemetry collector with pluggable protocol capabilities and a
//! latency monitor, driven through a JSON tool interface.
//!
//! ## Architecture
//!
//! ```text
//!   stdin ──▶ transport ──▶ ToolSurface ──▶ CapabilityRegistry
//!   stdout ◀──────────────────┘                   │
//!                                                 ▼
//!                       json_udp | sflow_udp | netflow_udp | ...
//!                       (one collector + decoder per capability)
//!                                                 │ FlowRecords
//!                                                 ▼
//!                                          LatencyMonitor
//! ```
//!
//! - **[`bootstrap`]**: configuration loading and the assembled [`Flowwatch`] service
//! - **[`transport`]**: newline-delimited JSON requests in, responses out
//!
//! ## Usage
//!
//! ```bash
//! # Start with a config file, logs as JSON on stderr
//! flowwatch --config flowwatch.toml --log-json
//!
//! # Drive it from the shell
//! echo '{"tool":"start_collection","arguments":{"identifier":"json_udp"}}' | flowwatch
//! ```
//!
//! ### As a library
//!
//! ```no_run
//! use flowwatch::{Flowwatch, FlowwatchConfig};
//!
//! # tokio_test::block_on(async {
//! let mut app = Flowwatch::build(FlowwatchConfig::default()).unwrap();
//! app.start().await;
//!
//! let response = app.tools().invoke_json(r#"{"tool":"list_capabilities"}"#).await;
//! assert!(response.is_ok());
//! app.shutdown().await;
//! # });
//! ```

pub mod bootstrap;
pub mod transport;

pub use bootstrap::{load_config, Flowwatch};
pub use flowwatch_core::{FlowwatchConfig, ToolCall, ToolResponse, ToolSurface};
