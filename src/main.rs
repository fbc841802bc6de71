use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedrelay::commands::{self, Command};
use feedrelay::config::{self, Config};
use feedrelay::deliver::{Delivery, LogDelivery, WebhookDelivery};
use feedrelay::feed::{build_client, HttpFetcher};
use feedrelay::media::MediaCache;
use feedrelay::scheduler::CronScheduler;
use feedrelay::storage::Store;
use feedrelay::Relay;

#[derive(Parser, Debug)]
#[command(name = "feedrelay", about = "Scheduled RSS/Atom relay with media caching")]
struct Args {
    /// Config file (default: ~/.config/feedrelay/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subscriber id the subscription commands act for
    #[arg(long, global = true, value_name = "ID")]
    subscriber: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the scheduler until interrupted (SIGHUP reloads subscriptions)
    Run,

    /// Manage hub endpoints
    Hub {
        #[command(subcommand)]
        action: HubCmd,
    },

    /// Subscribe to a hub route: add <HUB> <ROUTE> <MIN> <HOUR> <DAY> <MONTH> <DOW>
    Add {
        hub: usize,
        route: String,
        #[arg(num_args = 5, value_names = ["MINUTE", "HOUR", "DAY", "MONTH", "DAY_OF_WEEK"], allow_hyphen_values = true)]
        cron: Vec<String>,
    },

    /// Subscribe to a feed URL: add-url <URL> <MIN> <HOUR> <DAY> <MONTH> <DOW>
    AddUrl {
        url: String,
        #[arg(num_args = 5, value_names = ["MINUTE", "HOUR", "DAY", "MONTH", "DAY_OF_WEEK"], allow_hyphen_values = true)]
        cron: Vec<String>,
    },

    /// List the subscriber's subscriptions
    List,

    /// Remove a subscription by index
    Remove { index: usize },

    /// Deliver the newest entry of a subscription now
    Get { index: usize },
}

#[derive(Subcommand, Debug)]
enum HubCmd {
    Add { url: String },
    List,
    Remove { index: usize },
}

impl Cmd {
    fn into_command(self) -> Option<Command> {
        Some(match self {
            Cmd::Run => return None,
            Cmd::Hub { action: HubCmd::Add { url } } => Command::HubAdd { url },
            Cmd::Hub { action: HubCmd::List } => Command::HubList,
            Cmd::Hub { action: HubCmd::Remove { index } } => Command::HubRemove { index },
            Cmd::Add { hub, route, cron } => Command::Add {
                hub,
                route,
                cron: cron.join(" "),
            },
            Cmd::AddUrl { url, cron } => Command::AddUrl {
                url,
                cron: cron.join(" "),
            },
            Cmd::List => Command::List,
            Cmd::Remove { index } => Command::Remove { index },
            Cmd::Get { index } => Command::Get { index },
        })
    }
}

/// Creates `dir` if needed and restricts it to the current user.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
        tracing::info!(path = %dir.display(), "Created directory");
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to read directory metadata");
            }
        }
    }
    Ok(())
}

async fn build_relay(config: &Config, scheduler: Arc<CronScheduler>) -> Result<Arc<Relay>> {
    if let Some(parent) = config.data_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_private_dir(parent)?;
    }
    let store = Store::open(&config.data_path)
        .with_context(|| format!("Failed to open subscription store '{}'", config.data_path.display()))?;

    let client = build_client().context("Failed to build HTTP client")?;
    let fetcher = Arc::new(HttpFetcher::new(client.clone()));
    let media = MediaCache::new(client.clone(), config.media_options()).with_context(|| {
        format!("Failed to prepare media cache '{}'", config.media.cache_dir.display())
    })?;

    let delivery: Arc<dyn Delivery> = match &config.delivery.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering through webhook");
            Arc::new(WebhookDelivery::new(client, url.clone(), config.delivery.token.clone()))
        }
        None => {
            tracing::warn!("No webhook configured, messages are only logged");
            Arc::new(LogDelivery)
        }
    };

    Ok(Relay::new(config, store, fetcher, Arc::new(media), delivery, scheduler))
}

async fn run(relay: Arc<Relay>, scheduler: Arc<CronScheduler>) -> Result<()> {
    let report = relay.reconcile().await;
    scheduler.start().await.context("Failed to start scheduler")?;
    tracing::info!(jobs = report.upserted, "feedrelay running");

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Shutting down");
                break;
            }
            _ = reload => {
                if let Err(e) = relay.reload().await {
                    tracing::error!(error = %e, "Reload failed, keeping current jobs");
                }
            }
        }
    }

    scheduler.shutdown().await.context("Scheduler shutdown failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedrelay=info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    let scheduler = Arc::new(CronScheduler::new().await.context("Failed to create scheduler")?);
    let relay = build_relay(&config, Arc::clone(&scheduler)).await?;

    let Some(command) = args.command.into_command() else {
        return run(relay, scheduler).await;
    };

    let subscriber = match (&command, args.subscriber) {
        (_, Some(id)) => id,
        (Command::HubAdd { .. } | Command::HubList | Command::HubRemove { .. }, None) => String::new(),
        (_, None) => anyhow::bail!("This command needs --subscriber <ID>"),
    };

    let mutates = matches!(
        command,
        Command::Add { .. } | Command::AddUrl { .. } | Command::Remove { .. }
    );
    println!("{}", commands::reply(&relay, &subscriber, command).await);
    if mutates {
        println!("Send SIGHUP to a running `feedrelay run` to apply the change.");
    }
    Ok(())
}
