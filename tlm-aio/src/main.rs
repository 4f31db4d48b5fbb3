use std::{error::Error, path::PathBuf};

use clap::{command, Parser};
use tlm_core::{Ingestor, Pipeline};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{Assembly, Config};

mod config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let Assembly {
        limits,
        pipeline,
        collectors,
        host,
        output,
        dead_letter,
    } = Config::load(&cli.config)?.assemble()?;
    if cli.check {
        info!(
            "{} is valid: {} collectors, {} plugins, output {}",
            cli.config.display(),
            collectors.len(),
            host.len(),
            output.id()
        );
        return Ok(());
    }

    // a collector that can't bind is fatal, same as a bad config
    let mut listeners = Vec::with_capacity(collectors.len());
    for collector in &collectors {
        listeners.push(collector.bind().await?);
    }

    let pipeline = Pipeline::start(pipeline, host, output, dead_letter);
    let ingestor = Ingestor::new(pipeline.handle(), limits);

    let (stop, stopped) = watch::channel(false);
    let mut handles = vec![];
    for (collector, listener) in collectors.into_iter().zip(listeners) {
        let ingestor = ingestor.clone();
        let mut stopped = stopped.clone();
        let shutdown = async move {
            let _ = stopped.changed().await;
        };
        let handle = tokio::spawn(async move {
            if let Err(e) = collector.serve(listener, ingestor, shutdown).await {
                error!("collector {} stopped, {e}", collector.id());
            }
        });
        handles.push(handle);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = stop.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            error!("collector task failed, {e}");
        }
    }

    let stats = pipeline.shutdown().await;
    info!(
        "accepted {}, emitted {}, filtered {}, dead-lettered {}",
        stats.accepted, stats.emitted, stats.filtered, stats.dead_lettered
    );

    Ok(())
}
