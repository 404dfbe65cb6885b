use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use thermostat_sim::config::ThermostatConfig;
use thermostat_sim::supervisor::Supervisor;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::FmtSubscriber;

/// Simulated MQTT thermostat publishing temperature readings
#[derive(Parser, Debug)]
#[command(name = "thermostat-sim", version, about)]
struct Cli {
    /// TOML configuration file (default: <config dir>/thermostat-sim/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides runtime.log_level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration with the password redacted and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let cli_level = cli.log_level.as_deref().map(parse_level).transpose()?;

    // The global subscriber needs the configured level, loading logs to stderr meanwhile
    let config = ThermostatConfig::load(cli.config.as_deref())
        .with_subscriber(build_subscriber(
            cli_level.unwrap_or(Level::INFO),
            std::io::stderr,
        ))
        .await?;

    if cli.print_config {
        print!("{}", config.redacted().to_toml()?);
        return Ok(());
    }

    let level = match cli_level {
        Some(level) => level,
        None => parse_level(&config.runtime.log_level)?,
    };
    setup_logging_env(level)?;

    match &config.source {
        Some(path) => info!("Using configuration from {}", path.display()),
        None => info!("Using built-in default configuration"),
    }

    let stats = Supervisor::new(config)
        .run(shutdown_signal())
        .await
        .map_err(|e| eyre!("Thermostat simulator stopped: {}", e))?;

    info!(
        "Published {} readings, {} failed",
        stats.readings_published, stats.publish_failures
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn parse_level(level: &str) -> Result<Level> {
    level
        .parse::<Level>()
        .map_err(|e| eyre!("Invalid log level {:?}: {}", level, e))
}

fn build_subscriber<W>(level: Level, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer)
        .finish()
}

fn setup_logging_env(level: Level) -> Result<()> {
    tracing::subscriber::set_global_default(build_subscriber(level, std::io::stdout))?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => {
            // Without a signal handler only a fatal error can stop us
            error!("Unable to listen for interrupt: {}", e);
            std::future::pending::<()>().await
        }
    }
}
