//! opentmi-report CLI - upload test results to OpenTMI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use opentmi_report::config::{self, Config, normalize_host};
use opentmi_report::framework::{JunitFormat, Phase, parse_junit_file};
use opentmi_report::report::{
    ConsoleReporter, MultiReporter, OpenTmiReporter, Reporter, print_summary,
};

const DEFAULT_CONFIG: &str = "opentmi.toml";

#[derive(Parser)]
#[command(name = "opentmi-report")]
#[command(about = "Upload test results to OpenTMI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (default: opentmi.toml, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload results from JUnit XML files
    Upload {
        /// JUnit XML files to upload
        #[arg(required = true)]
        junit: Vec<PathBuf>,

        /// OpenTMI host
        #[arg(long)]
        host: Option<String>,

        /// OpenTMI access token
        #[arg(long, env = "OPENTMI_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Store captured output as result logs
        #[arg(long)]
        store_logs: Option<bool>,

        /// Override maximum concurrent submissions
        #[arg(short, long)]
        workers: Option<usize>,

        /// Extra metadata as KEY=VALUE (e.g. DUT_SERIAL_NUMBER=123)
        #[arg(short, long, value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,

        /// How test ids are formed (pytest, nextest, default)
        #[arg(long)]
        format: Option<JunitFormat>,

        /// Show upload progress
        #[arg(long)]
        progress: bool,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Where to write the configuration
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Upload {
            junit,
            host,
            token,
            store_logs,
            workers,
            metadata,
            format,
            progress,
        } => {
            let mut config = load(cli.config.as_deref())?;

            // Apply overrides
            if host.is_some() {
                config.opentmi.host = host;
            }
            if token.is_some() {
                config.opentmi.token = token;
            }
            if let Some(store_logs) = store_logs {
                config.opentmi.store_logs = store_logs;
            }
            if workers.is_some() {
                config.opentmi.workers = workers;
            }
            if let Some(format) = format {
                config.junit.format = format;
            }
            config.opentmi.progress |= progress;
            for (key, value) in metadata {
                config.metadata.push(key, value);
            }

            upload(config, &junit, cli.verbose).await
        }
        Commands::Validate => validate_config(cli.config.as_deref()),
        Commands::Init { path } => init_config(&path),
    }
}

/// Loads the given config, or the default file when it exists, or defaults.
fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG))
        }
        None => Ok(Config::default()),
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

async fn upload(config: Config, junit: &[PathBuf], verbose: bool) -> Result<()> {
    let mut reports = Vec::new();
    for path in junit {
        let parsed = parse_junit_file(path, config.junit.format)
            .with_context(|| format!("Failed to read results from {}", path.display()))?;
        info!("Read {} test cases from {}", parsed.len(), path.display());
        reports.extend(parsed);
    }

    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    match OpenTmiReporter::from_config(&config) {
        Some(opentmi) => reporter = reporter.with_reporter(opentmi),
        None => warn!("OpenTMI reporting disabled; results will not be uploaded"),
    }

    if let Some(header) = reporter.header() {
        println!("{}", header);
    }

    reporter.on_session_start().await;
    for report in &reports {
        if report.phase == Phase::Collect {
            reporter.on_collect_report(report).await;
        } else {
            reporter.on_test_report(report).await;
        }
    }
    reporter.on_session_finish().await;

    print_summary(&reporter);
    Ok(())
}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG));
    match config::load_config(path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            match normalize_host(config.opentmi.host.as_deref()) {
                Ok(host) => println!("  Host: {}", host),
                Err(e) => println!("  Host: {} (uploading disabled)", e),
            }
            let token = if config.opentmi.token.is_some() {
                "configured"
            } else if config.opentmi.resolve_token().is_some() {
                "from $OPENTMI_TOKEN"
            } else {
                "missing"
            };
            println!("  Token: {}", token);
            println!("  Auth service: {}", config.opentmi.auth_service);
            println!("  Workers: {}", config.opentmi.worker_count());
            match config.opentmi.submit_timeout() {
                Some(timeout) => println!("  Submit timeout: {}s", timeout.as_secs()),
                None => println!("  Submit timeout: none"),
            }
            println!("  Store logs: {}", config.opentmi.store_logs);
            println!("  JUnit format: {:?}", config.junit.format);
            println!("  Metadata entries: {}", config.metadata_pairs().len());

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path) -> Result<()> {
    let config = r#"# opentmi-report configuration file

[opentmi]
host = "http://localhost:3000"
# token = "..."            # defaults to $OPENTMI_TOKEN
auth_service = "github"
store_logs = true
# workers = 8              # defaults to the number of CPUs
submit_timeout_secs = 30
connect_timeout_secs = 10

[metadata]
# DUT_SERIAL_NUMBER = "123456"
# DUT_VENDOR = "acme"
# SUT_COMPONENT = ["wifi", "ble"]

[junit]
format = "pytest"
"#;

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  opentmi-report upload junit.xml");

    Ok(())
}
