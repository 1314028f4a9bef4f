#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use residue_events::model::{ArtifactStatus, NodeInfo, PlayerProfile};
use residue_events::resolver::{split_list, ResolveRequest};
use residue_events::{server, telemetry, App, ResidueConfig, SqliteStore};

#[derive(Parser)]
#[command(name = "residue", version, about = "Residue event generation service")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite store path (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP resolver
    Serve {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Resolve one event and print it as JSON
    Resolve {
        #[arg(long)]
        world: String,
        #[arg(long)]
        node: String,
        #[arg(long)]
        player: Option<String>,
        #[arg(long, default_value_t = 0)]
        truth_stage: i64,
        /// Comma-separated, strongest first
        #[arg(long, default_value = "")]
        traits: String,
        /// Comma-separated
        #[arg(long, default_value = "")]
        flags: String,
    },
    /// Load nodes and player profiles from JSON arrays
    Seed {
        #[arg(long)]
        nodes: Option<PathBuf>,
        #[arg(long)]
        profiles: Option<PathBuf>,
    },
    /// Export generated events to JSONL
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Print store statistics as JSON
    Stats,
    /// Retire a generated event so it is no longer served
    Retire { gen_event_id: String },
    /// Delete traces and usage rows older than N days
    Prune {
        #[arg(long)]
        max_age_days: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing();

    let mut config = ResidueConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store_path = db;
    }

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
            let app = App::open(config)?;
            server::serve(listener, app.resolver, app.tasks, shutdown_signal()).await?;
        }
        Commands::Resolve {
            world,
            node,
            player,
            truth_stage,
            traits,
            flags,
        } => {
            let app = App::open(config)?;
            let mut req = ResolveRequest::new(world, node)
                .truth_stage(truth_stage)
                .traits(&split_list(&traits))
                .flags(&split_list(&flags));
            req.player_id = player;
            let event = app.resolver.resolve(&req, None).await;
            // Let detached inspiration collection finish before exiting.
            app.tasks.drain().await;
            println!("{}", serde_json::to_string_pretty(&event?)?);
        }
        Commands::Seed { nodes, profiles } => {
            if nodes.is_none() && profiles.is_none() {
                return Err("seed requires --nodes and/or --profiles".into());
            }
            let store = SqliteStore::new(&config.store_path)?;
            if let Some(path) = nodes {
                let nodes: Vec<NodeInfo> = read_json(&path)?;
                for node in &nodes {
                    store.upsert_node(node).await?;
                }
                println!("seeded {} nodes", nodes.len());
            }
            if let Some(path) = profiles {
                let profiles: Vec<PlayerProfile> = read_json(&path)?;
                for profile in &profiles {
                    store.upsert_profile(profile).await?;
                }
                println!("seeded {} profiles", profiles.len());
            }
        }
        Commands::Export { out } => {
            let store = SqliteStore::new(&config.store_path)?;
            let written = store.export_jsonl(&out).await?;
            println!("exported {written} events to {}", out.display());
        }
        Commands::Stats => {
            let store = SqliteStore::new(&config.store_path)?;
            let stats = store.artifact_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Retire { gen_event_id } => {
            let store = SqliteStore::new(&config.store_path)?;
            store
                .set_status(&gen_event_id, ArtifactStatus::Retired)
                .await?;
            println!("retired {gen_event_id}");
        }
        Commands::Prune { max_age_days } => {
            let store = SqliteStore::new(&config.store_path)?;
            let _lock = store.lock_exclusive()?;
            let stats = store.prune(max_age_days).await?;
            println!(
                "pruned {} traces and {} provider calls",
                stats.traces_deleted, stats.calls_deleted
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        io::Error::new(e.kind(), format!("{}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&raw)?)
}
