//! # flowwatch-capabilities
//!
//! Ready-made flow telemetry capabilities for the flowwatch registry.
//!
//! Every capability pairs the shared [`udp::UdpCollector`] with a protocol
//! decoder that normalizes datagrams into [`FlowRecord`]s.
//!
//! ## Supported Protocols
//!
//! - **JSON** (`json` feature) - `json_udp` on 9995, one or more JSON flow
//!   objects per datagram. Also the only format that carries latency.
//! - **sFlow v5** (`sflow` feature) - `sflow_udp` on 6343, sampled packet
//!   headers from flow samples
//! - **NetFlow v5/v9** (`netflow` feature) - `netflow_udp` on 2055
//! - **IPFIX** (`ipfix` feature) - `ipfix_udp` on 4739
//! - **jFlow** (`jflow` feature) - `jflow_udp` on 9996, NetFlow or IPFIX on
//!   the wire
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flowwatch_core::{CapabilityRegistry, LatencyMonitor, LoaderCatalog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut catalog = LoaderCatalog::new();
//!     flowwatch_capabilities::register_all(&mut catalog);
//!
//!     let monitor = Arc::new(LatencyMonitor::default());
//!     let registry = CapabilityRegistry::new(catalog, monitor, Duration::from_secs(2));
//!
//!     registry.load("json_udp").await?;
//!     let status = registry.start("json_udp").await?;
//!     println!("listening on {:?}", status.bound_addr);
//!     Ok(())
//! }
//! ```

pub mod udp;

#[cfg(any(feature = "sflow", feature = "netflow", feature = "ipfix"))]
mod wire;

#[cfg(any(feature = "netflow", feature = "ipfix"))]
mod template;

#[cfg(feature = "json")]
pub mod json;

#[cfg(feature = "sflow")]
pub mod sflow;

#[cfg(feature = "netflow")]
pub mod netflow;

#[cfg(feature = "ipfix")]
pub mod ipfix;

#[cfg(feature = "jflow")]
pub mod jflow;

use flowwatch_core::LoaderCatalog;

pub use udp::{UdpCapability, UdpCollector};

// Re-export types for convenience
pub use flowwatch_types::{FlowRecord, ProtocolTag};

/// Register every compiled-in capability under its default identifier.
pub fn register_all(catalog: &mut LoaderCatalog) -> &mut LoaderCatalog {
    #[cfg(feature = "json")]
    catalog.register(json::IDENTIFIER, json::load);
    #[cfg(feature = "sflow")]
    catalog.register(sflow::IDENTIFIER, sflow::load);
    #[cfg(feature = "netflow")]
    catalog.register(netflow::IDENTIFIER, netflow::load);
    #[cfg(feature = "ipfix")]
    catalog.register(ipfix::IDENTIFIER, ipfix::load);
    #[cfg(feature = "jflow")]
    catalog.register(jflow::IDENTIFIER, jflow::load);
    catalog
}
