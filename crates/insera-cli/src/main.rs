use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use insera_bot::{build_bot, run_dispatcher, BotConfig, BotService, ChatTransport, TelegramTransport};
use insera_core::{format_reply, search, SearchResult, Table};
use insera_storage::{load_table, HttpClientConfig, HttpFetcher, TableStore};
use insera_sync::{maybe_build_scheduler, SchedulerConfig};
use insera_web::WebConfig;
use tokio::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "insera")]
#[command(about = "INSERA incident ticket bot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the chat bot, the daily export, and the liveness endpoint.
    Serve,
    /// Look a ticket up in the remote dataset and print the chat reply.
    Query {
        #[command(flatten)]
        source: SourceArgs,
        term: Vec<String>,
    },
    /// Download the remote dataset and write it out as xlsx.
    Export {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long, default_value = insera_storage::EXPORT_FILE_NAME)]
        out: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct SourceArgs {
    #[arg(long, env = "INSERA_DATASET_URL")]
    url: String,
    #[arg(long, env = "INSERA_HTTP_TIMEOUT_SECS", default_value_t = 20)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Query { source, term } => {
            let table = load_dataset(&source.url, source.timeout_secs, None).await?;
            println!("{}", render_query(&table, &term.join(" ")));
        }
        Commands::Export { source, out } => {
            let table = load_dataset(&source.url, source.timeout_secs, None).await?;
            let bytes = write_export(&table, &out).await?;
            println!(
                "export complete: records={} bytes={} path={}",
                table.len(),
                bytes,
                out.display()
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

async fn serve() -> Result<()> {
    let config = BotConfig::from_env().context("reading bot configuration")?;
    let web = WebConfig::from_env();
    let schedule = SchedulerConfig::from_env();
    info!(?config, port = web.port, "starting insera");

    let table = load_dataset(
        &config.dataset_url,
        config.http_timeout_secs,
        Some(config.user_agent.clone()),
    )
    .await?;
    let store = Arc::new(TableStore::new(table));
    let service = Arc::new(BotService::new(store, config.admin_chat, config.open_export));

    let bot = build_bot(&config.token, config.http_timeout_secs)?;
    let transport: Arc<dyn ChatTransport> = Arc::new(TelegramTransport::new(bot.clone()));
    let scheduler = maybe_build_scheduler(&schedule, service.clone(), transport).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    tokio::select! {
        res = insera_web::serve(&web) => res.context("liveness endpoint stopped")?,
        () = run_dispatcher(bot, service) => info!("telegram dispatcher stopped"),
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            info!("shutdown requested");
        }
    }

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn load_dataset(url: &str, timeout_secs: u64, user_agent: Option<String>) -> Result<Table> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(timeout_secs),
        user_agent,
        ..Default::default()
    })?;
    load_table(&fetcher, url)
        .await
        .with_context(|| format!("loading dataset from {url}"))
}

fn render_query(table: &Table, term: &str) -> String {
    match search(table, term) {
        SearchResult::EmptyTerm => insera_core::query::NOT_FOUND.to_string(),
        result => format_reply(result.records(), table.date_range()),
    }
}

async fn write_export(table: &Table, out: &Path) -> Result<usize> {
    let bytes = insera_storage::encode(table).context("encoding workbook")?;
    fs::write(out, &bytes)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    Ok(bytes.len())
}
