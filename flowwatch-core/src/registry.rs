//! Capability lifecycle management.
//!
//! The registry maps identifiers to capabilities and drives each one through
//! `unloaded -> loaded -> running -> loaded -> unloaded`. Lifecycle calls for
//! the same identifier are serialized by that entry's own async lock; calls
//! for different identifiers never wait on each other.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowwatch_types::ProtocolTag;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{Capability, CloseHandle, Collector, Decoder, FlowSink, LoaderCatalog};
use crate::config::{CapabilityConfig, FlowwatchConfig};
use crate::error::{LoadError, RegistryError};

/// Lifecycle state of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unloaded,
    Loaded,
    Running,
    /// Transient: the collector is closing and the loop is draining.
    Stopping,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Unloaded => "unloaded",
            Lifecycle::Loaded => "loaded",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
        }
    }
}

/// Cumulative counters for one capability, across all of its runs.
#[derive(Debug, Default)]
struct Counters {
    datagrams_received: AtomicU64,
    records_produced: AtomicU64,
    decode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            records_produced: self.records_produced.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a capability's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub datagrams_received: u64,
    pub records_produced: u64,
    pub decode_errors: u64,
}

/// Status of one capability as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityStatus {
    pub identifier: String,
    pub loader: String,
    pub state: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolTag>,
    /// Configured listen address, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    /// Address actually bound while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_addr: Option<SocketAddr>,
    pub last_error: Option<String>,
    pub counters: CounterSnapshot,
}

#[derive(Debug)]
struct Shared {
    state: Lifecycle,
    protocol: Option<ProtocolTag>,
    last_error: Option<String>,
    bound_addr: Option<SocketAddr>,
}

struct RunningTask {
    close: CloseHandle,
    task: JoinHandle<()>,
}

/// State owned by whoever holds the entry's lifecycle lock.
#[derive(Default)]
struct Slot {
    capability: Option<Arc<dyn Capability>>,
    running: Option<RunningTask>,
}

struct CapabilityEntry {
    config: CapabilityConfig,
    shared: RwLock<Shared>,
    counters: Arc<Counters>,
    slot: Mutex<Slot>,
}

impl CapabilityEntry {
    fn new(config: CapabilityConfig) -> Self {
        Self {
            config,
            shared: RwLock::new(Shared {
                state: Lifecycle::Unloaded,
                protocol: None,
                last_error: None,
                bound_addr: None,
            }),
            counters: Arc::new(Counters::default()),
            slot: Mutex::new(Slot::default()),
        }
    }

    fn status(&self) -> CapabilityStatus {
        let shared = self.shared.read();
        CapabilityStatus {
            identifier: self.config.id.clone(),
            loader: self.config.loader_reference().to_string(),
            state: shared.state,
            protocol: shared.protocol,
            bind: self.config.bind.clone(),
            bound_addr: shared.bound_addr,
            last_error: shared.last_error.clone(),
            counters: self.counters.snapshot(),
        }
    }

    fn state(&self) -> Lifecycle {
        self.shared.read().state
    }
}

/// Process-wide table of capabilities.
///
/// Construct once at startup and share behind an `Arc`.
pub struct CapabilityRegistry {
    catalog: LoaderCatalog,
    sink: Arc<dyn FlowSink>,
    stop_grace: Duration,
    entries: RwLock<BTreeMap<String, Arc<CapabilityEntry>>>,
}

impl CapabilityRegistry {
    pub fn new(catalog: LoaderCatalog, sink: Arc<dyn FlowSink>, stop_grace: Duration) -> Self {
        Self {
            catalog,
            sink,
            stop_grace,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a registry and add every configured capability.
    pub fn from_config(
        catalog: LoaderCatalog,
        sink: Arc<dyn FlowSink>,
        config: &FlowwatchConfig,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new(catalog, sink, config.stop_grace);
        for cap in &config.capabilities {
            registry.add(cap.clone())?;
        }
        Ok(registry)
    }

    /// Add an entry in the `unloaded` state.
    pub fn add(&self, config: CapabilityConfig) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&config.id) {
            return Err(RegistryError::Duplicate(config.id));
        }
        debug!(capability = %config.id, loader = %config.loader_reference(), "capability added");
        entries.insert(config.id.clone(), Arc::new(CapabilityEntry::new(config)));
        Ok(())
    }

    pub fn catalog(&self) -> &LoaderCatalog {
        &self.catalog
    }

    fn entry(&self, identifier: &str) -> Result<Arc<CapabilityEntry>, RegistryError> {
        self.entries
            .read()
            .get(identifier)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCapability(identifier.to_string()))
    }

    /// Resolve and instantiate a capability. Does not touch the network.
    ///
    /// An identifier that is not in the table but names a registered loader is
    /// added on the fly. Loading an already-loaded capability is a no-op.
    pub async fn load(&self, identifier: &str) -> Result<CapabilityStatus, RegistryError> {
        let entry = match self.entry(identifier) {
            Ok(entry) => entry,
            Err(_) if self.catalog.contains(identifier) => {
                // Lost races with a concurrent add are fine: both add the same config.
                let _ = self.add(CapabilityConfig::new(identifier));
                self.entry(identifier)?
            }
            Err(_) => return Err(LoadError::UnknownCapability(identifier.to_string()).into()),
        };

        let mut slot = entry.slot.lock().await;
        if entry.state() != Lifecycle::Unloaded {
            return Ok(entry.status());
        }

        let reference = entry.config.loader_reference();
        match self.catalog.instantiate(reference, identifier) {
            Ok(capability) => {
                let protocol = capability.protocol();
                slot.capability = Some(Arc::from(capability));
                let mut shared = entry.shared.write();
                shared.state = Lifecycle::Loaded;
                shared.protocol = Some(protocol);
                shared.last_error = None;
                drop(shared);
                info!(capability = %identifier, loader = %reference, protocol = %protocol, "capability loaded");
                Ok(entry.status())
            }
            Err(e) => {
                warn!(capability = %identifier, loader = %reference, error = %e, "capability failed to load");
                entry.shared.write().last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Bind the collector and start its receive loop.
    ///
    /// Starting a running capability returns its current status. On a bind
    /// failure the capability stays `loaded` with the error recorded.
    pub async fn start(&self, identifier: &str) -> Result<CapabilityStatus, RegistryError> {
        let entry = self.entry(identifier)?;
        let mut slot = entry.slot.lock().await;

        match entry.state() {
            Lifecycle::Unloaded => return Err(RegistryError::NotLoaded(identifier.to_string())),
            Lifecycle::Running | Lifecycle::Stopping => {
                debug!(capability = %identifier, "start ignored, already running");
                return Ok(entry.status());
            }
            Lifecycle::Loaded => {}
        }

        let capability = slot
            .capability
            .clone()
            .ok_or_else(|| RegistryError::NotLoaded(identifier.to_string()))?;
        let bind = entry
            .config
            .bind_config()
            .unwrap_or_else(|| capability.default_bind());

        let mut collector = capability.collector();
        let bound_addr = match collector.listen(&bind).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(capability = %identifier, addr = %bind.addr, error = %e, "bind failed");
                entry.shared.write().last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let decoder = capability.decoder();
        let close = collector.close_handle();
        let task = tokio::spawn(run_loop(
            identifier.to_string(),
            collector,
            decoder,
            entry.counters.clone(),
            self.sink.clone(),
        ));
        slot.running = Some(RunningTask { close, task });

        {
            let mut shared = entry.shared.write();
            shared.state = Lifecycle::Running;
            shared.bound_addr = Some(bound_addr);
            shared.last_error = None;
        }
        info!(capability = %identifier, addr = %bound_addr, "capability started");
        Ok(entry.status())
    }

    /// Close the collector and wait for the loop to drain.
    ///
    /// The loop gets `stop_grace` to finish decoding the datagram it holds;
    /// after that it is aborted. Either way the capability ends up `loaded`.
    ///
    /// Teardown runs on its own task, so a caller that gives up waiting
    /// does not leave the capability stuck in `stopping`.
    pub async fn stop(&self, identifier: &str) -> Result<CapabilityStatus, RegistryError> {
        let entry = self.entry(identifier)?;
        let mut slot = entry.slot.lock().await;

        let running = match (entry.state(), slot.running.take()) {
            (Lifecycle::Running, Some(running)) => running,
            (_, running) => {
                slot.running = running;
                return Err(RegistryError::NotRunning(identifier.to_string()));
            }
        };

        entry.shared.write().state = Lifecycle::Stopping;
        let teardown = tokio::spawn(teardown(
            identifier.to_string(),
            entry.clone(),
            running,
            self.stop_grace,
        ));

        if let Err(e) = teardown.await {
            warn!(capability = %identifier, error = %e, "teardown task failed");
            finish_stop(&entry);
        }
        drop(slot);
        Ok(entry.status())
    }

    /// Drop the loaded capability. Running capabilities must be stopped first.
    pub async fn unload(&self, identifier: &str) -> Result<CapabilityStatus, RegistryError> {
        let entry = self.entry(identifier)?;
        let mut slot = entry.slot.lock().await;

        match entry.state() {
            Lifecycle::Running | Lifecycle::Stopping => {
                return Err(RegistryError::StillRunning(identifier.to_string()))
            }
            Lifecycle::Unloaded => return Ok(entry.status()),
            Lifecycle::Loaded => {}
        }

        slot.capability = None;
        {
            let mut shared = entry.shared.write();
            shared.state = Lifecycle::Unloaded;
            shared.protocol = None;
        }
        info!(capability = %identifier, "capability unloaded");
        Ok(entry.status())
    }

    pub fn status(&self, identifier: &str) -> Result<CapabilityStatus, RegistryError> {
        Ok(self.entry(identifier)?.status())
    }

    /// Every configured capability, in identifier order.
    pub fn list(&self) -> Vec<CapabilityStatus> {
        self.entries.read().values().map(|e| e.status()).collect()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.read().contains_key(identifier)
    }

    /// Stop every running capability.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.state() == Lifecycle::Running)
            .map(|(id, _)| id.clone())
            .collect();

        for id in running {
            if let Err(e) = self.stop(&id).await {
                debug!(capability = %id, error = %e, "skipped during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("catalog", &self.catalog)
            .field("stop_grace", &self.stop_grace)
            .field("entries", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Close the collector, give the loop `grace` to drain, then abort it.
async fn teardown(
    identifier: String,
    entry: Arc<CapabilityEntry>,
    running: RunningTask,
    grace: Duration,
) {
    let RunningTask { close, mut task } = running;
    close.close();

    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(capability = %identifier, error = %e, "collector loop ended abnormally");
        }
        Err(_) => {
            warn!(capability = %identifier, grace = ?grace, "collector loop did not drain in time, aborting");
            task.abort();
        }
    }

    finish_stop(&entry);
    info!(capability = %identifier, "capability stopped");
}

fn finish_stop(entry: &CapabilityEntry) {
    let mut shared = entry.shared.write();
    shared.state = Lifecycle::Loaded;
    shared.bound_addr = None;
}

/// Receive, decode and forward until the collector is closed.
///
/// Decoding is inline so records keep datagram arrival order and a bad
/// datagram only bumps a counter.
async fn run_loop(
    identifier: String,
    mut collector: Box<dyn Collector>,
    mut decoder: Box<dyn Decoder>,
    counters: Arc<Counters>,
    sink: Arc<dyn FlowSink>,
) {
    while let Some(datagram) = collector.recv().await {
        counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
        match decoder.decode(&datagram) {
            Ok(records) => {
                counters
                    .records_produced
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                for record in records {
                    sink.ingest(record);
                }
            }
            Err(e) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(capability = %identifier, peer = %datagram.peer, error = %e, "datagram dropped");
            }
        }
    }
    debug!(capability = %identifier, "receive loop finished");
}
