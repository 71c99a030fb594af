//! # tally-runner
//!
//! Main entry point for the tally system.
//!
//! Queries every ticket against the remote endpoint, waits until all of them
//! have answered, and prints the median of the answers.
//!
//! # Usage
//!
//! ```bash
//! tally-runner                       # compiled-in defaults
//! tally-runner config.json --log-level debug
//! tally-runner --host 127.0.0.1 --port 2012 --tickets 100 --concurrency 16
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use tally_core::{
    config::{AppConfig, EndpointConfig},
    logging::LogFormat,
    stats::ResultStats,
};
use tally_net::{
    exchange::{TcpExchange, TcpExchangeConfig},
    scheduler::{Scheduler, SchedulerConfig},
};
use tracing::info;

/// Ticket querier: fetch every ticket's answer and report the median.
#[derive(Parser)]
#[command(name = "tally-runner", about = "Query every ticket and report the median answer")]
struct Cli {
    /// Optional configuration file path (JSON).
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Console log format (text, json).
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Override the endpoint host.
    #[arg(long)]
    host: Option<String>,

    /// Override the endpoint port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the number of tickets.
    #[arg(long)]
    tickets: Option<u32>,

    /// Override the maximum number of concurrent exchanges.
    #[arg(long)]
    concurrency: Option<usize>,
}

impl Cli {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => tally_core::config::load_config(path)?,
            None => AppConfig::default(),
        };

        if self.host.is_some() || self.port.is_some() {
            let base = config.effective_endpoint();
            config.endpoint = Some(EndpointConfig {
                host: self.host.clone().unwrap_or(base.host),
                port: self.port.unwrap_or(base.port),
            });
        }
        if self.tickets.is_some() {
            config.tickets = self.tickets;
        }
        if self.concurrency.is_some() {
            config.max_concurrency = self.concurrency;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = cli.load_config()?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    tally_core::logging::init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name(), cli.log_format);

    let exchange_config = TcpExchangeConfig::from_app_config(&config);
    let scheduler_config = SchedulerConfig::from_app_config(&config);
    info!(
        "tally-runner starting: endpoint={}, tickets={}, max_concurrency={}, timeouts(connect/send/recv)={:?}/{:?}/{:?}",
        exchange_config.endpoint,
        scheduler_config.tickets,
        scheduler_config.max_concurrency,
        exchange_config.connect_timeout,
        exchange_config.send_timeout,
        exchange_config.recv_timeout,
    );

    // 3. Run every ticket to completion
    let scheduler = Scheduler::new(scheduler_config, Arc::new(TcpExchange::new(exchange_config)));
    let report = scheduler.run().await?;

    // 4. Reduce
    let stats = ResultStats::from_results(&report.results).ok_or_else(|| anyhow!("no results to aggregate"))?;
    info!("results: {stats}");
    println!("The answer is: {}", stats.median);

    Ok(())
}
