//! # flowwatch-types
//!
//! Core types for flow telemetry monitoring. This crate defines the
//! protocol-neutral schema every flowwatch capability decodes into, and the
//! report shapes the latency monitor answers with.
//!
//! ## Design Goals
//!
//! - **Zero required dependencies**: Core types work without any serialization framework
//! - **Optional serialization**: Enable the `serde` feature as needed
//! - **Protocol neutral**: A [`FlowRecord`] looks the same whether it came from
//!   sFlow, NetFlow, jFlow, IPFIX or the JSON test format
//! - **Explicit unknowns**: Counters the exporter did not report stay `None`,
//!   they are never coerced to zero
//! - **Versioned reports**: Reports include version info for forward compatibility
//!
//! ## Example
//!
//! ```rust
//! use flowwatch_types::{Endpoint, FlowRecord, ProtocolTag};
//!
//! let record = FlowRecord::builder("json_udp", ProtocolTag::Json)
//!     .source(Endpoint::new("10.0.0.1".parse().unwrap(), Some(40312)))
//!     .destination(Endpoint::new("10.0.0.2".parse().unwrap(), Some(443)))
//!     .transport(6)
//!     .byte_count(1500)
//!     .latency_ms(12.5)
//!     .build();
//!
//! assert_eq!(record.packet_count(), None);
//! assert_eq!(record.flow_key().as_deref(), Some("10.0.0.1:40312->10.0.0.2:443/TCP"));
//! ```
//!
//! ## Schema Version
//!
//! The current report schema is **1.1**. It is serialized as a `"major.minor"`
//! string in every report; consumers should reject a different major.

mod record;
mod report;

pub use record::*;
pub use report::*;

/// Current schema version.
///
/// Increment this when making breaking changes to the report format.
pub const SCHEMA_VERSION: u32 = 1;
