//! Mnema CLI
//!
//! Thin command-line surface over the memory engine. JSON output,
//! exit code 0 on success, non-zero on any failure.

use clap::{Parser, Subcommand};

use mnema::config::EngineConfig;
use mnema::context::{normalize_tenant_id, SecurityContext, TenantScope};
use mnema::engine::MemoryEngine;
use mnema::types::{CreateMemoryInput, SearchFilter};

#[derive(Parser)]
#[command(name = "mnema")]
#[command(about = "Hierarchical memory engine CLI")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(
        long,
        env = "MNEMA_DB_PATH",
        default_value = "~/.local/share/mnema/memories.db"
    )]
    db_path: String,

    /// Tenant to operate as ("system" spans tenants, admin only)
    #[arg(long, env = "MNEMA_TENANT", default_value = "")]
    tenant: String,

    /// Content encryption passphrase
    #[arg(long, env = "MNEMA_SECRET", default_value = "mnema-dev-secret")]
    secret: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new memory
    Add {
        /// Content to remember
        content: String,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
    },
    /// Search memories
    Search {
        /// Search query
        query: String,
        /// Maximum results
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Expand along waypoints
        #[arg(long)]
        spread: bool,
    },
    /// Get a memory's decrypted content
    Get {
        /// Memory ID
        id: String,
    },
    /// Boost a memory's salience
    Reinforce {
        /// Memory ID
        id: String,
        /// Boost amount
        #[arg(short, long, default_value = "0.1")]
        boost: f64,
    },
    /// Delete a memory
    Delete {
        /// Memory ID
        id: String,
    },
    /// Show engine statistics
    Stats,
    /// Run one decay pass immediately
    Decay,
    /// Wipe every memory in scope
    Wipe,
}

fn context_for(tenant: &str) -> SecurityContext {
    match normalize_tenant_id(tenant) {
        TenantScope::Id(id) => SecurityContext::for_tenant(id),
        TenantScope::System => SecurityContext::system(),
        TenantScope::Any => SecurityContext::admin(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        let payload = serde_json::json!({ "error": e.to_string() });
        eprintln!("{}", payload);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig {
        db_path: shellexpand::tilde(&cli.db_path).to_string(),
        secret: cli.secret.clone(),
        ..EngineConfig::in_memory()
    };
    let engine = MemoryEngine::open(config)?;
    let ctx = context_for(&cli.tenant);

    match cli.command {
        Commands::Add { content, tags } => {
            let input = CreateMemoryInput {
                content,
                tags: tags
                    .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                ..Default::default()
            };
            let memory = engine.add(&ctx, input).await?;
            println!("{}", serde_json::to_string_pretty(&memory)?);
        }
        Commands::Search {
            query,
            limit,
            spread,
        } => {
            let filter = SearchFilter {
                spread,
                ..Default::default()
            };
            let matches = engine.search(&ctx, &query, limit, &filter).await?;
            println!("{}", serde_json::to_string_pretty(&matches)?);
        }
        Commands::Get { id } => {
            let content = engine.content(&ctx, &id)?;
            println!("{}", serde_json::json!({ "id": id, "content": content }));
        }
        Commands::Reinforce { id, boost } => {
            let memory = engine.reinforce(&ctx, &id, boost).await?;
            println!(
                "{}",
                serde_json::json!({
                    "id": memory.id,
                    "salience": memory.salience,
                    "version": memory.version,
                })
            );
        }
        Commands::Delete { id } => {
            let removed = engine.delete(&ctx, &id).await?;
            if !removed {
                anyhow::bail!("memory not found: {}", id);
            }
            println!("{}", serde_json::json!({ "deleted": id }));
        }
        Commands::Stats => {
            let stats = engine.stats(&ctx)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Decay => {
            let outcome = engine.run_decay().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Wipe => {
            let removed = engine.delete_all(&ctx)?;
            println!("{}", serde_json::json!({ "removed": removed }));
        }
    }

    Ok(())
}
