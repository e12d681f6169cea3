use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowwatch::{bootstrap, transport, Flowwatch};

#[derive(Parser, Debug)]
#[command(name = "flowwatch")]
#[command(about = "Collect flow telemetry and monitor latency through a JSON tool interface")]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit log lines as JSON
    #[arg(long)]
    log_json: bool,

    /// Run one monitor pass after startup, print the report and exit
    #[arg(long)]
    once: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = bootstrap::load_config(args.config.as_deref())?;
    let mut app = Flowwatch::build(config)?;
    app.start().await;

    if args.once {
        let report = app.monitor().monitor_once();
        println!("{}", serde_json::to_string_pretty(&report)?);
        app.shutdown().await;
        return Ok(());
    }

    info!("ready for tool calls on stdin");
    tokio::select! {
        served = transport::serve(app.tools(), tokio::io::stdin(), tokio::io::stdout()) => {
            match served {
                Ok(n) => info!(requests = n, "stdin closed"),
                Err(e) => warn!(error = %e, "tool transport failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    app.shutdown().await;
    Ok(())
}
