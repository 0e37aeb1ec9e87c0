use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use sys_health::app::App;
use sys_health::config::Config;
use sys_health::mode::{usage, Mode};

#[derive(Parser, Debug)]
#[command(name = "sys-health", about = "Lightweight host telemetry collector")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate config, print the effective settings and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    /// setup | monitor | status | logs | test | help
    command: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("sys-health {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    // Reject unknown commands before touching config or the filesystem.
    let mode = match Mode::parse(cli.command.as_deref()) {
        Ok(m) => m,
        Err(e) => {
            print!("{}", usage());
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli, mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, mode: Mode) -> Result<()> {
    let config = Config::resolve(cli.config.as_deref())?;

    if cli.check {
        let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("Configuration is valid.\n\n{}", rendered);
        return Ok(());
    }

    init_logging(&config);
    debug!(mode = %mode, log = %config.log.path.display(), "Starting sys-health");

    let app = App::new(config)?;
    let stdout = std::io::stdout();
    let stdin = std::io::stdin();
    let mut out = stdout.lock();
    let mut input = stdin.lock();

    app.run(mode, &mut out, &mut input).await?;
    out.flush()?;
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}
