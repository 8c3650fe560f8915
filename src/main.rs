use anyhow::{Context, Result};
use clap::Parser;
use pgtunnel::config::{self, CliArgs};
use pgtunnel::database::{ConnectionPool, SqlxDriver};
use pgtunnel::error::QueryError;
use pgtunnel::lifecycle::{Orchestrator, RunOutcome, signals};
use pgtunnel::ssh::handle_askpass_mode;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "pgtunnel=info,warn";

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // stdout carries the query report only
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    // Must run before anything else: ssh re-invokes this binary for secrets
    handle_askpass_mode();
    init_logging();

    let args = CliArgs::parse();
    let signal = signals::install().context("Failed to install signal handler")?;

    let config = config::load(args.config.as_deref(), &args.overrides())
        .context("Failed to load configuration")?;
    tracing::debug!("Configuration: {:?}", config);

    let spec = config.tunnel_spec()?;
    let statement = config.pg.statement.clone();
    let orchestrator = Orchestrator::new(
        config.transport(),
        SqlxDriver::new(config.pg_credentials()),
    )
    .with_close_timeout(config.close_timeout());

    let outcome = smol::block_on(orchestrator.run_until_signal(
        &signal,
        spec,
        config.pool_config(),
        async |pool: &ConnectionPool<SqlxDriver>| -> Result<Option<String>, QueryError> {
            pool.query_scalar(&statement).await
        },
    ));

    let code = ExitCode::from(outcome.exit_code());
    match outcome {
        RunOutcome::Completed(count) => {
            println!("COUNT {}", count.unwrap_or_else(|| "0".to_string()));
        }
        RunOutcome::Interrupted => {
            tracing::warn!("Interrupted; tunnel and pool released");
        }
        RunOutcome::Failed(e) if e.is_startup_failure() => {
            return Err(anyhow::Error::new(e).context("Startup failed"));
        }
        RunOutcome::Failed(e) => {
            // Reported, but still a normal exit
            println!("{}", e);
        }
    }

    Ok(code)
}
