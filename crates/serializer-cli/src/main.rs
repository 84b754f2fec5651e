use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serializer_core::links::{FarsideTransformer, UrlTransformer};
use serializer_storage::{MemoryStore, PgStore, StoryStore};
use serializer_sync::{ScrapeScheduler, SyncConfig};
use serializer_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "serializer-cli")]
#[command(about = "Tracks the Hacker News front page and records how stories change")]
struct Cli {
    /// Log level or filter directive; `RUST_LOG` wins when set.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Overrides `DATABASE_URL`.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Keep everything in process memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single scrape and print the result.
    Scrape,
    /// Create the schema and exit.
    Migrate,
    /// Start the scrape timer and the web app.
    Serve {
        #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:3000")]
        addr: SocketAddr,
        /// `host=service` pairs routed through farside.link, e.g. `twitter.com=nitter`.
        #[arg(long = "link-rewrite", env = "LINK_REWRITES", value_delimiter = ',')]
        link_rewrites: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut config = SyncConfig::from_env().context("reading configuration")?;
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }

    match cli.command {
        Commands::Scrape => {
            let store = open_store(cli.memory, &config).await?;
            let scheduler = ScrapeScheduler::from_config(&config, store).await?;
            match scheduler.run_once().await {
                Ok(result) => println!(
                    "scrape complete: created={} updated={} rechecked={} marked_gone={}",
                    result.created, result.updated, result.rechecked, result.marked_gone
                ),
                Err(err) => {
                    println!(
                        "scrape partial: created={} updated={} rechecked={} marked_gone={} failed={}",
                        err.result.created,
                        err.result.updated,
                        err.result.rechecked,
                        err.result.marked_gone,
                        err.result.failed
                    );
                    return Err(err.into());
                }
            }
        }
        Commands::Migrate => {
            if cli.memory {
                bail!("migrate needs a database; drop --memory");
            }
            let url = config.require_database_url()?;
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying schema")?;
            println!("schema up to date");
        }
        Commands::Serve {
            addr,
            link_rewrites,
        } => {
            let store = open_store(cli.memory, &config).await?;
            let scheduler = ScrapeScheduler::from_config(&config, store.clone()).await?;
            scheduler.start().await.context("starting scrape timer")?;

            let state = AppState::new(store, scheduler.clone())
                .with_transformers(parse_link_rewrites(&link_rewrites)?);
            let served = serializer_web::serve(addr, state, shutdown_signal()).await;

            info!("shutting down; waiting for in-flight scrape");
            scheduler.shutdown().await.context("stopping scrape timer")?;
            served?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {level:?}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

async fn open_store(memory: bool, config: &SyncConfig) -> Result<Arc<dyn StoryStore>> {
    if memory {
        warn!("using in-memory store; nothing survives a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let url = config.require_database_url()?;
    let store = PgStore::connect(url)
        .await
        .context("could not initialize DB connection")?;
    store.migrate().await.context("applying schema")?;
    Ok(Arc::new(store))
}

fn parse_link_rewrites(pairs: &[String]) -> Result<Vec<Box<dyn UrlTransformer>>> {
    pairs
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|pair| {
            let (host, service) = pair
                .split_once('=')
                .with_context(|| format!("link rewrite {pair:?} is not host=service"))?;
            let transformer = FarsideTransformer::new(host.trim(), service.trim())
                .with_context(|| format!("link rewrite {pair:?}"))?;
            Ok(Box::new(transformer) as Box<dyn UrlTransformer>)
        })
        .collect()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "serializer-cli",
            "--memory",
            "serve",
            "--addr",
            "127.0.0.1:8080",
            "--link-rewrite",
            "twitter.com=nitter,reddit.com=libreddit",
        ])
        .unwrap();
        assert!(cli.memory);
        match cli.command {
            Commands::Serve {
                addr,
                link_rewrites,
            } => {
                assert_eq!(addr.port(), 8080);
                assert_eq!(link_rewrites.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn link_rewrites_need_host_and_service() {
        let ok = parse_link_rewrites(&["twitter.com=nitter".to_string()]).unwrap();
        assert_eq!(ok.len(), 1);
        assert!(parse_link_rewrites(&["twitter.com".to_string()]).is_err());
    }
}
