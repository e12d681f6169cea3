//! Process wiring: configuration loading and the assembled service.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use flowwatch_core::periodic::{self, PeriodicHandle};
use flowwatch_core::{
    BaselineDetector, CapabilityRegistry, FlowwatchConfig, LatencyMonitor, LoaderCatalog,
    ToolSurface,
};
use tracing::{info, warn};

/// Environment variable prefix, e.g. `FLOWWATCH_MONITOR__MIN_SAMPLES=20`.
pub const ENV_PREFIX: &str = "FLOWWATCH";

/// Load configuration from an optional file layered under the environment.
pub fn load_config(path: Option<&Path>) -> Result<FlowwatchConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    let settings = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to read configuration")?;

    settings
        .try_deserialize::<FlowwatchConfig>()
        .context("invalid configuration")
}

/// A fully wired collector: monitor, baseline detector, registry and tool surface.
#[derive(Debug)]
pub struct Flowwatch {
    config: FlowwatchConfig,
    monitor: Arc<LatencyMonitor>,
    registry: Arc<CapabilityRegistry>,
    tools: ToolSurface,
    periodic: Option<PeriodicHandle>,
}

impl Flowwatch {
    /// Build every component. Nothing is loaded or bound yet.
    pub fn build(config: FlowwatchConfig) -> Result<Self> {
        let mut catalog = LoaderCatalog::new();
        flowwatch_capabilities::register_all(&mut catalog);

        let monitor = Arc::new(
            LatencyMonitor::new(&config.monitor).context("invalid monitor thresholds")?,
        );
        let registry = Arc::new(
            CapabilityRegistry::from_config(catalog, monitor.clone(), &config)
                .context("invalid capability list")?,
        );
        let baseline = Arc::new(
            BaselineDetector::new(&config.baseline).context("invalid baseline settings")?,
        );
        let tools = ToolSurface::new(registry.clone(), monitor.clone()).with_baseline(baseline);

        Ok(Self {
            config,
            monitor,
            registry,
            tools,
            periodic: None,
        })
    }

    /// Apply `autoload`/`autostart` and start the periodic monitor if configured.
    ///
    /// A capability that fails to load or bind is logged and left where it
    /// stopped; the rest still come up.
    pub async fn start(&mut self) {
        for cap in &self.config.capabilities {
            if !(cap.autoload || cap.autostart) {
                continue;
            }
            if let Err(e) = self.registry.load(&cap.id).await {
                warn!(capability = %cap.id, error = %e, "autoload failed");
                continue;
            }
            if cap.autostart {
                if let Err(e) = self.registry.start(&cap.id).await {
                    warn!(capability = %cap.id, error = %e, "autostart failed");
                }
            }
        }

        if let Some(interval) = self.config.monitor.interval {
            if self.periodic.is_none() {
                info!(interval = ?interval, "periodic monitor started");
                self.periodic = Some(periodic::spawn(self.monitor.clone(), interval, None));
            }
        }
    }

    pub fn tools(&self) -> &ToolSurface {
        &self.tools
    }

    pub fn monitor(&self) -> &Arc<LatencyMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Stop the periodic monitor and every running capability.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.periodic.take() {
            handle.stop().await;
        }
        self.registry.shutdown().await;
        info!("flowwatch stopped");
    }
}
