//! The contract every protocol plugin satisfies.
//!
//! A [`Capability`] bundles one [`Collector`] (the network listener) with one
//! [`Decoder`] (the wire-format parser). The registry only ever talks to these
//! traits; all protocol knowledge lives behind them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use flowwatch_types::{FlowRecord, ProtocolTag};
use tokio::sync::watch;

use crate::error::{BindError, DecodeError, LoadError};

/// Default receive buffer, large enough for any UDP datagram.
pub const DEFAULT_RECV_BUFFER: usize = 65_535;

/// One datagram as handed from a collector to its decoder.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
    pub received: Instant,
    pub received_unix_ms: u64,
}

impl RawDatagram {
    /// Stamp a payload as received now.
    pub fn now(peer: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            peer,
            payload,
            received: Instant::now(),
            received_unix_ms: flowwatch_types::current_timestamp_ms(),
        }
    }
}

/// Where and how a collector listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfig {
    pub addr: String,
    pub recv_buffer: usize,
}

impl BindConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            recv_buffer: DEFAULT_RECV_BUFFER,
        }
    }
}

/// Closes a collector from outside its receive loop.
///
/// Cloneable and idempotent: closing twice is the same as closing once.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver side that resolves once `close` has been called.
    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable side of a [`CloseHandle`].
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves when the handle is closed (immediately if it already is).
    pub async fn closed(&mut self) {
        // An Err means every sender is gone, which also counts as closed.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

/// Network listener half of a capability.
///
/// After a successful `listen`, repeated `recv` calls yield datagrams until
/// the collector is closed, after which `recv` returns `None` forever.
#[async_trait]
pub trait Collector: Send {
    /// Bind the listener, returning the local address actually bound.
    async fn listen(&mut self, bind: &BindConfig) -> Result<SocketAddr, BindError>;

    /// Next datagram, or `None` once closed.
    async fn recv(&mut self) -> Option<RawDatagram>;

    /// Handle that unblocks a pending `recv` from another task.
    fn close_handle(&self) -> CloseHandle;

    fn close(&self) {
        self.close_handle().close();
    }
}

/// Wire-format half of a capability.
pub trait Decoder: Send {
    fn decode(&mut self, datagram: &RawDatagram) -> Result<Vec<FlowRecord>, DecodeError>;
}

/// A named, loadable collector/decoder factory.
///
/// Each `start` asks for a fresh collector and decoder so no state (sockets,
/// template caches) survives a stop.
pub trait Capability: Send + Sync {
    fn identifier(&self) -> &str;

    fn protocol(&self) -> ProtocolTag;

    /// Listen address used when the configuration does not name one.
    fn default_bind(&self) -> BindConfig;

    fn collector(&self) -> Box<dyn Collector>;

    fn decoder(&self) -> Box<dyn Decoder>;
}

/// Constructor for a capability, given the identifier it will be known by.
pub type CapabilityLoader =
    Arc<dyn Fn(&str) -> Result<Box<dyn Capability>, LoadError> + Send + Sync>;

/// The fixed set of loader references available to the registry.
///
/// Populated by explicit registration at startup.
#[derive(Clone, Default)]
pub struct LoaderCatalog {
    loaders: BTreeMap<String, CapabilityLoader>,
}

impl LoaderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loader under `reference`, replacing any previous one.
    pub fn register<F>(&mut self, reference: impl Into<String>, loader: F) -> &mut Self
    where
        F: Fn(&str) -> Result<Box<dyn Capability>, LoadError> + Send + Sync + 'static,
    {
        self.loaders.insert(reference.into(), Arc::new(loader));
        self
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.loaders.contains_key(reference)
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    /// Instantiate the capability behind `reference` as `identifier`.
    pub fn instantiate(
        &self,
        reference: &str,
        identifier: &str,
    ) -> Result<Box<dyn Capability>, LoadError> {
        let loader = self
            .loaders
            .get(reference)
            .ok_or_else(|| LoadError::UnknownLoader(reference.to_string()))?;
        loader(identifier)
    }
}

impl fmt::Debug for LoaderCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCatalog")
            .field("references", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Receives decoded records from every running capability.
pub trait FlowSink: Send + Sync {
    fn ingest(&self, record: FlowRecord);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Inert;

    impl Capability for Inert {
        fn identifier(&self) -> &str {
            "inert"
        }

        fn protocol(&self) -> ProtocolTag {
            ProtocolTag::Json
        }

        fn default_bind(&self) -> BindConfig {
            BindConfig::new("127.0.0.1:0")
        }

        fn collector(&self) -> Box<dyn Collector> {
            unimplemented!("not started in these tests")
        }

        fn decoder(&self) -> Box<dyn Decoder> {
            unimplemented!("not started in these tests")
        }
    }

    #[test]
    fn catalog_rejects_unknown_reference() {
        let catalog = LoaderCatalog::new();
        let err = catalog.instantiate("netflow_udp", "nf").err().unwrap();
        assert!(matches!(err, LoadError::UnknownLoader(r) if r == "netflow_udp"));
    }

    #[test]
    fn catalog_instantiates_registered_loader() {
        let mut catalog = LoaderCatalog::new();
        catalog.register("inert", |_id| Ok(Box::new(Inert) as Box<dyn Capability>));

        assert!(catalog.contains("inert"));
        let cap = catalog.instantiate("inert", "inert").unwrap();
        assert_eq!(cap.protocol(), ProtocolTag::Json);
    }

    #[test]
    fn close_handle_is_idempotent() {
        let handle = CloseHandle::new();
        assert!(!handle.is_closed());
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn close_signal_resolves_for_late_subscribers() {
        let handle = CloseHandle::new();
        handle.close();

        let mut signal = handle.signal();
        tokio::time::timeout(Duration::from_millis(100), signal.closed())
            .await
            .expect("already-closed signal resolves immediately");
    }

    #[tokio::test]
    async fn close_signal_wakes_pending_waiter() {
        let handle = CloseHandle::new();
        let mut signal = handle.signal();

        let waiter = tokio::spawn(async move { signal.closed().await });
        tokio::task::yield_now().await;
        handle.close();

        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
