//! Volley CLI - command-line driver for the request dispatcher.
//!
//! # Commands
//!
//! - `volley fetch <URL>`: dispatch one request and print its envelope
//! - `volley batch <FILE>`: dispatch every request in a JSON or TOML batch file and print
//!   the envelopes in file order
//!
//! Envelopes are printed to stdout as pretty JSON. Logs go to stderr (or `--log-file`);
//! the filter comes from `RUST_LOG` and defaults to warnings plus debug-switch
//! diagnostics. A JOIN_ALL batch in which any request failed exits non-zero after
//! printing its envelopes.

mod batch_file;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use volley_config::VolleyConfig;
use volley_dispatch::{
    ConcurrencyMode, Dispatcher, DispatcherConfig, Method, Params, RequestSpec,
    total_timeout_from_secs,
};

const DEFAULT_LOG_FILTER: &str = "warn,volley::diag=info";

#[derive(Debug, Parser)]
#[command(name = "volley", version, about = "Concurrent HTTP request dispatcher")]
struct Cli {
    /// Config file (default: $VOLLEY_CONFIG, then ~/.volley/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit per-request diagnostics
    #[arg(long, global = true)]
    debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch a single request
    Fetch(FetchArgs),
    /// Dispatch every request in a batch file concurrently
    Batch(BatchArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,

    /// Request parameter; values that parse as JSON are sent as JSON
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Opaque tag echoed back in the envelope
    #[arg(long)]
    tag: Option<String>,
}

impl FetchArgs {
    fn into_spec(self) -> Result<RequestSpec> {
        let mut spec = RequestSpec::new(&self.url)?
            .with_method(self.method)
            .with_params(parse_params(&self.params)?);
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            spec = spec.with_header(name, value)?;
        }
        if let Some(seconds) = self.timeout {
            spec = spec.with_timeout_secs(seconds)?;
        }
        if let Some(tag) = self.tag {
            spec = spec.with_tag(tag);
        }
        Ok(spec)
    }
}

#[derive(Debug, Args)]
struct BatchArgs {
    file: PathBuf,

    /// SELECT_ALL or JOIN_ALL (default: config, then SELECT_ALL)
    #[arg(long)]
    mode: Option<ConcurrencyMode>,

    /// Deadline for the whole batch in seconds; negative values expire immediately
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    total_timeout: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;
    run(cli).await
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    let mut resolved = DispatcherConfig::from_config(&config)?.with_env_overrides();
    if cli.debug {
        resolved.debug = true;
    }
    let batch_defaults = resolved.batch;
    let dispatcher = Dispatcher::new(resolved)?;

    match cli.command {
        Command::Fetch(args) => {
            let spec = args.into_spec()?;
            let envelope = dispatcher.fetch_single(&spec).await;
            print_json(&envelope)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Batch(args) => {
            let specs = batch_file::load(&args.file)?;
            let mode = args.mode.unwrap_or(batch_defaults.mode);
            let total_timeout = args
                .total_timeout
                .map_or(batch_defaults.total_timeout, total_timeout_from_secs);

            let report = dispatcher.fetch_requests(&specs, mode, total_timeout).await;
            print_json(report.envelopes())?;

            match report.into_result() {
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(err) => {
                    tracing::error!(failed = ?err.failed, "{err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<VolleyConfig> {
    match path {
        Some(path) => Ok(VolleyConfig::load_from(path)?),
        None => Ok(VolleyConfig::load()?.unwrap_or_default()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn parse_params(raw: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid param `{pair}`: expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid param `{pair}`: empty key"));
        }
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid header `{raw}`: expected 'Name: value'"))?;
    Ok((name.trim(), value.trim()))
}
