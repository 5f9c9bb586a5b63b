mod cli;

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use preview::config::load_app_config;
use preview::{AppConfig, DispatchError, Dispatcher, SubmitRequest};

fn init_logging(json: bool) -> anyhow::Result<()> {
    tracing_log::LogTracer::init().context("failed to bridge log records")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.context("failed to install tracing subscriber")
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    if let Some(path) = path {
        if !path.is_file() {
            bail!("configuration file {} does not exist", path.display());
        }
    }
    Ok(load_app_config(path)?)
}

fn run(config: AppConfig) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::from_config(config).context("failed to start dispatcher")?;

    if dispatcher.is_enabled() {
        let report = dispatcher.recover()?;
        info!(
            requeued = report.requeued,
            delegated = report.delegated,
            "Recovered previous work"
        );
    } else {
        warn!("Work dispatcher disabled; this node only answers status queries");
    }

    for agent in dispatcher.agent_reports() {
        info!(agent = %agent.name, kind = agent.kind.as_str(), workers = agent.count, "Render agent ready");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    info!(node_id = %dispatcher.config().common.node_id, "Preview node running");
    let _ = rx.recv();

    info!("Shutting down...");
    dispatcher.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn render(config: AppConfig, file: &Path, timeout: Duration) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::from_config(config).context("failed to start dispatcher")?;
    let request = SubmitRequest::local_file(file)?;

    let job_id = match dispatcher.submit(request) {
        Ok(job_id) => job_id,
        Err(e @ (DispatchError::UnsupportedType { .. } | DispatchError::AssetTooLarge { .. })) => {
            warn!(error = %e, "Request rejected");
            e.job_id().map(str::to_string).context("rejected without a job")?
        }
        Err(e) => return Err(e.into()),
    };

    let job = dispatcher.wait_for(&job_id, timeout)?;
    if !job.is_terminal() {
        warn!(job_id = %job_id, status = %job.status, "Timed out waiting for the job");
    }

    let report = dispatcher.report(&job_id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    dispatcher.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs)?;

    info!("Starting preview-daemon v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(config),
        Command::Render { file, timeout } => render(config, &file, Duration::from_secs(timeout)),
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
