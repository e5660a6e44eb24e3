use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flatwatch_core::{ActiveState, ListingId};
use flatwatch_storage::Store;
use flatwatch_sync::{DispatchPipeline, Dispatcher, IngestPipeline, SourceRegistry, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "flatwatch")]
#[command(about = "Rental listing watcher: ingest, match and notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest cycle followed by one dispatch pass.
    Sync,
    /// Pull every enabled source through the dedup gate.
    Ingest,
    /// Run one matching and dispatch pass.
    Dispatch,
    /// Run sync on FLATWATCH_SYNC_CRON until interrupted.
    Schedule,
    Migrate,
    Serve,
    #[command(subcommand)]
    Subscriber(SubscriberCommand),
    #[command(subcommand)]
    Listing(ListingCommand),
}

#[derive(Debug, Subcommand)]
enum SubscriberCommand {
    Register { user_id: i64 },
    Show { user_id: i64 },
    Extend { user_id: i64, days: u32 },
    Searching {
        user_id: i64,
        #[arg(action = clap::ArgAction::Set)]
        on: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ListingCommand {
    Show { id: String },
    /// State is one of unknown, active, inactive.
    SetActive { id: String, state: String },
    Remove { id: String },
    Liveness {
        #[arg(long, default_value = "unknown")]
        state: String,
        #[arg(long)]
        after: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_active_state(value: &str) -> Result<ActiveState> {
    match value.trim().to_ascii_lowercase().as_str() {
        "unknown" => Ok(ActiveState::Unknown),
        "active" => Ok(ActiveState::Active),
        "inactive" => Ok(ActiveState::Inactive),
        other => bail!("unknown listing state `{other}` (expected unknown, active or inactive)"),
    }
}

async fn open_store(config: &SyncConfig) -> Result<Store> {
    Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = flatwatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} inserted={} failed_sources={} matched={} sent={} failed={} elapsed_ms={}",
                summary.pass.run_id,
                summary.ingest.inserted(),
                summary.ingest.failed_sources().len(),
                summary.pass.matched,
                summary.pass.sent,
                summary.pass.failed,
                summary.elapsed_ms
            );
        }
        Commands::Ingest => {
            let store = open_store(&config).await?;
            let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml")).await?;
            let summary = IngestPipeline::from_registry(store, &registry, &config.workspace_root)
                .run_cycle()
                .await;
            for report in &summary.sources {
                let source = report.source.map(|s| s.slug()).unwrap_or("?");
                match &report.error {
                    Some(err) => println!("{source}: failed: {err}"),
                    None => println!(
                        "{source}: fetched={} inserted={} duplicates={} rejected={}",
                        report.fetched, report.inserted, report.duplicates, report.rejected
                    ),
                }
            }
        }
        Commands::Dispatch => {
            let store = open_store(&config).await?;
            let dispatcher = Dispatcher::new(store.clone(), config.build_transport()?, config.dispatcher_config());
            let summary = DispatchPipeline::new(store, dispatcher).run_pass().await?;
            println!(
                "pass complete: run_id={} watermark={} candidates={} matched={} sent={} skipped={} failed={}",
                summary.run_id,
                summary.watermark.to_rfc3339(),
                summary.candidates,
                summary.matched,
                summary.sent,
                summary.skipped,
                summary.failed
            );
        }
        Commands::Schedule => flatwatch_sync::run_scheduler_from_env().await?,
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => flatwatch_web::serve_from_env().await?,
        Commands::Subscriber(cmd) => {
            let store = open_store(&config).await?;
            match cmd {
                SubscriberCommand::Register { user_id } => {
                    let (filter, created) = store.register_subscriber(user_id, Utc::now()).await?;
                    println!("{}", if created { "registered" } else { "already registered" });
                    println!("{}", serde_json::to_string_pretty(&filter)?);
                }
                SubscriberCommand::Show { user_id } => match store.get_subscriber(user_id).await? {
                    Some(filter) => println!("{}", serde_json::to_string_pretty(&filter)?),
                    None => bail!("subscriber {user_id} not found"),
                },
                SubscriberCommand::Extend { user_id, days } => {
                    match store.extend_subscription(user_id, days, Utc::now()).await? {
                        Some(until) => println!("subscriber {user_id} active until {}", until.to_rfc3339()),
                        None => bail!("subscriber {user_id} not found"),
                    }
                }
                SubscriberCommand::Searching { user_id, on } => {
                    if !store.set_searching(user_id, on).await? {
                        bail!("subscriber {user_id} not found");
                    }
                    println!("subscriber {user_id} searching={on}");
                }
            }
        }
        Commands::Listing(cmd) => {
            let store = open_store(&config).await?;
            match cmd {
                ListingCommand::Show { id } => match store.get_listing(&ListingId::from_raw(id.clone())).await? {
                    Some(listing) => println!("{}", serde_json::to_string_pretty(&listing)?),
                    None => bail!("listing {id} not found"),
                },
                ListingCommand::SetActive { id, state } => {
                    let state = parse_active_state(&state)?;
                    if !store.set_active(&ListingId::from_raw(id.clone()), state, Utc::now()).await? {
                        bail!("listing {id} not found");
                    }
                    println!("{id}: {state:?}");
                }
                ListingCommand::Remove { id } => {
                    if !store.remove_listing(&ListingId::from_raw(id.clone())).await? {
                        bail!("listing {id} not found");
                    }
                    println!("{id}: removed");
                }
                ListingCommand::Liveness { state, after, limit } => {
                    let after = after.map(ListingId::from_raw);
                    let batch = store
                        .listings_for_liveness(parse_active_state(&state)?, after.as_ref(), limit)
                        .await?;
                    for listing in &batch {
                        println!("{}\t{}", listing.id, listing.url);
                    }
                }
            }
        }
    }

    Ok(())
}
