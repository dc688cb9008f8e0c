//! Command-line interface for managing the offline cache.

mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use console::style;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::http::{Method, Request, RequestMode};
use crate::manager::FetchOutcome;
use crate::message::ControlMessage;
use crate::network::{HttpNetwork, Network, OfflineNetwork};
use crate::state::Registration;
use crate::store::DiskStorage;
use crate::worker::ServiceWorker;

use progress::{InstallBar, print_activation, print_install_summary, print_status};

/// giftcache - offline asset cache for the gift-list app
///
/// Precaches the app shell, keeps one versioned cache, and answers requests
/// network-first or cache-first with an offline fallback.
#[derive(Parser, Debug)]
#[command(name = "giftcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "GIFTCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration file
    Init(InitArgs),

    /// Fetch the precache list into the configured version's cache
    Install,

    /// Promote the waiting version and delete stale caches
    Activate,

    /// Run one request through the cache
    Fetch(FetchArgs),

    /// Send a control message, e.g. '{"type":"SKIP_WAITING"}'
    Message(MessageArgs),

    /// Show the registration, statistics and stored caches
    Status,

    /// Run the caching reverse proxy
    #[cfg(feature = "proxy")]
    Serve(ServeArgs),

    /// Increase the patch component of the cache version
    BumpVersion(BumpArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing file
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// URL or origin-relative path
    pub url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Treat the request as a page navigation
    #[arg(long)]
    pub navigate: bool,

    /// Pretend the network is unreachable
    #[arg(long)]
    pub offline: bool,

    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MessageArgs {
    /// Message JSON
    pub json: String,
}

#[cfg(feature = "proxy")]
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct BumpArgs {
    /// Print the new version without saving it
    #[arg(long)]
    pub dry_run: bool,
}

/// Runs a parsed command line.
///
/// # Errors
///
/// Returns the first error of the selected command.
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);

    if let Commands::Init(args) = &cli.command {
        return init(&config_path, args.force);
    }

    let mut config = AppConfig::load_or_create(&config_path)?;
    log::debug!("Loaded config from {}", config_path.display());

    match cli.command {
        Commands::Init(_) => Ok(()),
        Commands::Install => install(&config).await,
        Commands::Activate => activate(&config).await,
        Commands::Fetch(args) => {
            if args.offline {
                fetch(&config, OfflineNetwork, &args).await
            } else {
                fetch(&config, HttpNetwork::new(&config.origin)?, &args).await
            }
        }
        Commands::Message(args) => message(&config, &args.json).await,
        Commands::Status => status(&config).await,
        #[cfg(feature = "proxy")]
        Commands::Serve(args) => {
            if let Some(host) = args.host {
                config.proxy.host = host;
            }
            if let Some(port) = args.port {
                config.proxy.port = port;
            }
            serve(&config).await
        }
        Commands::BumpVersion(args) => bump_version(&mut config, &config_path, args.dry_run),
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
        return Ok(());
    }
    AppConfig::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Opens the on-disk caches and re-attaches the persisted registration.
async fn open_worker<N: Network + 'static>(
    config: &AppConfig,
    network: N,
) -> Result<ServiceWorker<DiskStorage, N>> {
    let storage = Arc::new(DiskStorage::new(config.paths.cache_dir.clone()));
    let worker = ServiceWorker::new(
        storage,
        Arc::new(network),
        config.cache.clone(),
        config.origin.base_url()?,
    )?;
    let registration = Registration::load(&config.paths.registration_path())?;
    worker.restore(&registration).await?;
    Ok(worker)
}

async fn save_registration<S, N>(worker: &ServiceWorker<S, N>, config: &AppConfig) -> Result<()>
where
    S: crate::store::CacheStorage + 'static,
    N: Network + 'static,
{
    worker.settle().await;
    worker
        .registration()
        .await
        .save(&config.paths.registration_path())
}

async fn install(config: &AppConfig) -> Result<()> {
    let worker = open_worker(config, HttpNetwork::new(&config.origin)?).await?;
    let bar = InstallBar::new();
    let result = worker.install(&bar).await;
    bar.finish();

    let outcome = result?;
    save_registration(&worker, config).await?;
    print_install_summary(&outcome);
    Ok(())
}

async fn activate(config: &AppConfig) -> Result<()> {
    let worker = open_worker(config, HttpNetwork::new(&config.origin)?).await?;
    match worker.activate_waiting().await? {
        Some(report) => {
            save_registration(&worker, config).await?;
            print_activation(&report);
        }
        None => println!("No version is waiting."),
    }
    Ok(())
}

async fn fetch<N: Network + 'static>(config: &AppConfig, network: N, args: &FetchArgs) -> Result<()> {
    let worker = open_worker(config, network).await?;
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|e| Error::Message(format!("invalid method {:?}: {e}", args.method)))?;
    let url = crate::url::resolve(worker.origin(), &args.url)?;
    let mode = if args.navigate {
        RequestMode::Navigate
    } else {
        RequestMode::Subresource
    };
    let request = Request::new(method, url).with_mode(mode);

    let (response, source) = match worker.handle_fetch(&request).await {
        FetchOutcome::Respond { response, source } => (response, source.to_string()),
        FetchOutcome::Passthrough => (worker.passthrough(&request).await, "passthrough".to_string()),
    };
    save_registration(&worker, config).await?;

    eprintln!(
        "{} {} {}",
        style(response.status).bold(),
        response.status_text,
        style(format!("({source})")).dim()
    );
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &response.body).await?;
            eprintln!("Wrote {} bytes to {}", response.body.len(), path.display());
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&response.body)?;
        }
    }
    Ok(())
}

async fn message(config: &AppConfig, json: &str) -> Result<()> {
    let message: ControlMessage = json.parse()?;
    let worker = open_worker(config, HttpNetwork::new(&config.origin)?).await?;
    let outcome = worker.post_message(message).await?;
    save_registration(&worker, config).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn status(config: &AppConfig) -> Result<()> {
    let worker = open_worker(config, OfflineNetwork).await?;
    let registration = worker.registration().await;
    let caches = worker.caches().await?;
    print_status(config, &registration, &caches);
    Ok(())
}

#[cfg(feature = "proxy")]
async fn serve(config: &AppConfig) -> Result<()> {
    let worker = Arc::new(open_worker(config, HttpNetwork::new(&config.origin)?).await?);
    crate::proxy::serve(
        worker,
        &config.proxy,
        Some(config.paths.registration_path()),
    )
    .await
}

fn bump_version(config: &mut AppConfig, path: &Path, dry_run: bool) -> Result<()> {
    let next = config.cache.version.bump_patch()?;
    println!("{} -> {}", config.cache.version, style(&next).green());
    if dry_run {
        return Ok(());
    }
    config.cache.version = next;
    config.save(path)?;
    log::info!("Saved cache version {} to {}", config.cache.version, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::CacheVersion;

    #[test]
    fn parses_fetch_flags() {
        let cli = Cli::try_parse_from([
            "giftcache",
            "-vv",
            "fetch",
            "/presentes/",
            "--navigate",
            "--offline",
            "-X",
            "post",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(args.url, "/presentes/");
        assert!(args.navigate && args.offline);
        assert_eq!(args.method, "post");
        assert!(args.output.is_none());
    }

    #[test]
    fn global_config_flag() {
        let cli = Cli::try_parse_from(["giftcache", "status", "-c", "/etc/giftcache.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/giftcache.toml")));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn bump_version_dry_run_leaves_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.save(&path).unwrap();

        bump_version(&mut config, &path, true).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().cache.version.as_str(), "v1.0.0");

        bump_version(&mut config, &path, false).unwrap();
        assert_eq!(
            AppConfig::load(&path).unwrap().cache.version,
            CacheVersion::new("v1.0.1").unwrap()
        );
    }

    #[test]
    fn init_does_not_clobber() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nversion = \"v9\"\n").unwrap();

        init(&path, false).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().cache.version.as_str(), "v9");

        init(&path, true).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().cache.version.as_str(), "v1.0.0");
    }

    #[tokio::test]
    async fn offline_fetch_without_cache_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.paths.cache_dir = dir.path().join("cache");
        let out = dir.path().join("body.html");

        // Nothing installed: the request passes through and the offline network fails.
        let args = FetchArgs {
            url: "/".to_string(),
            method: "GET".to_string(),
            navigate: true,
            offline: true,
            output: Some(out.clone()),
        };
        fetch(&config, OfflineNetwork, &args).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"Bad Gateway");
        assert!(config.paths.registration_path().exists());
    }
}
