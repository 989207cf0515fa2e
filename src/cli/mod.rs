//! CLI mode for octo-sw: run the offline proxy or drive a worker by hand.

mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use crate::cache::{CacheStorage, open_storage};
use crate::clients::Clients;
use crate::config::{AppConfig, StorageKind};
use crate::error::{Error, Result};
use crate::http::FetchRequest;
use crate::network::{HttpNetwork, Network};
use crate::registration::Registration;
use crate::worker::ServiceWorker;

use report::{CacheSummary, print_caches, print_install, print_outcome};

/// A parsed subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the offline proxy.
    Serve {
        host: Option<String>,
        port: Option<u16>,
    },
    /// Pre-cache the configured assets without activating.
    Install,
    /// Install (reusing cached assets) and activate, purging stale stores.
    Activate,
    /// Fetch one URL or path through the worker.
    Fetch { target: String, navigate: bool },
    /// List cache stores.
    Caches,
    /// Print the equivalent browser service worker.
    Script,
    /// Write the effective configuration to the config file.
    Init,
    /// Show usage.
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Config file override.
    pub config: Option<PathBuf>,
    /// Use in-memory storage instead of the configured backend.
    pub memory: bool,
    /// Origin override.
    pub origin: Option<Url>,
    /// Version tag override.
    pub version: Option<String>,
    /// Subcommand.
    pub command: Command,
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: octo-sw [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve [--host HOST] [--port PORT]   Run the offline proxy");
    eprintln!("  install                             Pre-cache the configured assets");
    eprintln!("  activate                            Activate the version and purge stale caches");
    eprintln!("  fetch <URL|PATH> [--navigate]       Fetch through the worker");
    eprintln!("  caches                              List cache stores");
    eprintln!("  script                              Print the browser service worker");
    eprintln!("  init                                Write the effective config file");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     Config file (default: {})", AppConfig::default_path().display());
    eprintln!("  --origin <URL>      Origin to serve offline");
    eprintln!("  --cache-version <V> Cache version tag");
    eprintln!("  --memory            Keep caches in memory only");
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Logging is controlled with RUST_LOG (default: info).");
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("{flag} requires a value")))
}

/// Parses command-line arguments, excluding the program name.
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown flags, missing values or a missing
/// command.
pub fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut config = None;
    let mut memory = false;
    let mut origin = None;
    let mut version = None;
    let mut host = None;
    let mut port = None;
    let mut navigate = false;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                return Ok(CliArgs {
                    config,
                    memory,
                    origin,
                    version,
                    command: Command::Help,
                });
            }
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(value(args, i, "--config")?));
            }
            "--memory" => memory = true,
            "--origin" => {
                i += 1;
                origin = Some(Url::parse(value(args, i, "--origin")?)?);
            }
            "--cache-version" => {
                i += 1;
                version = Some(value(args, i, "--cache-version")?.to_string());
            }
            "--host" => {
                i += 1;
                host = Some(value(args, i, "--host")?.to_string());
            }
            "--port" => {
                i += 1;
                let raw = value(args, i, "--port")?;
                port = Some(
                    raw.parse()
                        .map_err(|_| Error::Config(format!("invalid port: {raw}")))?,
                );
            }
            "--navigate" => navigate = true,
            flag if flag.starts_with('-') => {
                return Err(Error::Config(format!("unknown option: {flag}")));
            }
            arg => positional.push(arg),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        [] => Command::Help,
        ["serve"] => Command::Serve { host, port },
        ["install"] => Command::Install,
        ["activate"] => Command::Activate,
        ["fetch", target] => Command::Fetch {
            target: (*target).to_string(),
            navigate,
        },
        ["fetch"] => return Err(Error::Config("fetch requires a URL or path".to_string())),
        ["caches"] => Command::Caches,
        ["script"] => Command::Script,
        ["init"] => Command::Init,
        [other, ..] => return Err(Error::Config(format!("unknown command: {other}"))),
    };

    Ok(CliArgs {
        config,
        memory,
        origin,
        version,
        command,
    })
}

/// Loads the config file and applies command-line overrides.
fn load_config(cli: &CliArgs) -> Result<(AppConfig, PathBuf)> {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&path)?;
    if cli.memory {
        config.storage.kind = StorageKind::Memory;
    }
    if let Some(origin) = &cli.origin {
        config.worker.origin = origin.clone();
    }
    if let Some(version) = &cli.version {
        config.worker.version.clone_from(version);
    }
    if let Command::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }
    config.worker.validate()?;
    Ok((config, path))
}

fn build_network(config: &AppConfig) -> Result<Arc<dyn Network>> {
    Ok(Arc::new(HttpNetwork::with_connect_timeout(
        Duration::from_secs(config.server.connect_timeout_secs),
    )?))
}

/// Summarises every cache store in creation order.
async fn summarize(storage: &dyn CacheStorage) -> Result<Vec<CacheSummary>> {
    let mut summaries = Vec::new();
    for name in storage.keys().await? {
        let mut bytes = 0u64;
        let entries = storage.entries(&name).await?;
        for key in &entries {
            if let Some(response) = storage.get(&name, key).await? {
                bytes += response.body.len() as u64;
            }
        }
        summaries.push(CacheSummary {
            name,
            entries: entries.len(),
            bytes,
        });
    }
    Ok(summaries)
}

async fn run_install(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config.storage).await?;
    let network = build_network(&config)?;
    let version = config.worker.version.clone();
    let worker = ServiceWorker::new(
        config.worker,
        Arc::clone(&storage),
        network,
        Arc::new(Clients::new()),
    )?;

    let started = Instant::now();
    worker.install().await?;
    let summary = summarize(storage.as_ref())
        .await?
        .into_iter()
        .find(|s| s.name == version);
    print_install(&version, summary.as_ref(), started.elapsed());
    Ok(())
}

async fn run_activate(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config.storage).await?;
    let registration = Registration::new(Arc::clone(&storage), build_network(&config)?);
    let worker = registration
        .register(config.worker.with_skip_waiting(true))
        .await?;
    println!("Activated {}", console::style(worker.version()).green().bold());
    print_caches(&summarize(storage.as_ref()).await?, Some(worker.version()));
    Ok(())
}

async fn run_fetch(config: AppConfig, target: &str, navigate: bool) -> Result<()> {
    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(_) => config.worker.resolve(target)?,
    };
    let storage = open_storage(&config.storage).await?;
    let registration = Registration::new(storage, build_network(&config)?);
    if let Err(e) = registration.register(config.worker).await {
        log::warn!("No worker installed, fetching without cache: {e}");
    }

    let request = if navigate {
        FetchRequest::navigate(url)
    } else {
        FetchRequest::get(url)
    };
    let started = Instant::now();
    let outcome = registration.fetch(request).await;
    let elapsed = started.elapsed();
    registration.settle().await;

    print_outcome(&outcome, elapsed);
    Ok(())
}

async fn run_caches(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config.storage).await?;
    print_caches(
        &summarize(storage.as_ref()).await?,
        Some(config.worker.version.as_str()),
    );
    Ok(())
}

/// Runs the CLI with the given arguments, excluding the program name.
///
/// # Errors
///
/// Returns an error if the arguments or config are invalid, or the command
/// fails.
pub async fn run(args: Vec<String>) -> Result<()> {
    let cli = parse_args(&args)?;
    if cli.command == Command::Help {
        print_usage();
        return Ok(());
    }

    let (config, path) = load_config(&cli)?;
    log::debug!("Using config {}", path.display());

    match cli.command {
        Command::Serve { .. } => crate::server::run(config).await,
        Command::Install => run_install(config).await,
        Command::Activate => run_activate(config).await,
        Command::Fetch { target, navigate } => run_fetch(config, &target, navigate).await,
        Command::Caches => run_caches(config).await,
        Command::Script => {
            print!("{}", crate::script::render(&config.worker)?);
            Ok(())
        }
        Command::Init => {
            config.save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Help => Ok(()),
    }
}
