//! # skillbot CLI
//!
//! ## Usage
//!
//! ```bash
//! skillbot --config ./config/skillbot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `skillbot init` | Create the SQLite database and run schema migrations |
//! | `skillbot seed <file.json>` | Upsert skill records from a JSON array |
//! | `skillbot index` | Rebuild the vector index from the skill records |
//! | `skillbot ask "<query>"` | Answer one query and print the JSON response |
//! | `skillbot serve` | Start the HTTP server |
//!
//! Logging goes to stderr and is filtered with `RUST_LOG`
//! (default `skillbot=info,tower_http=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skillbot::config;
use skillbot::db;
use skillbot::migrate;
use skillbot::query::RequestContext;
use skillbot::server;
use skillbot::services::Services;
use skillbot::skills::SkillStore;

#[derive(Parser)]
#[command(
    name = "skillbot",
    about = "Answer questions about a CV's skills with vector search and an LLM",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/skillbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Upsert skill records from a JSON array file.
    ///
    /// Records are matched on `skill_id`; existing ones are replaced.
    Seed {
        /// Path to a JSON file holding an array of skill records.
        file: PathBuf,
    },

    /// Embed every skill record into a new index version.
    Index,

    /// Run one query through the full pipeline and print the response.
    Ask {
        query: String,

        /// Operator token that skips the schedule gate.
        #[arg(long)]
        bypass: Option<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skillbot=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Seed { file } => {
            migrate::run_migrations(&cfg).await?;
            let skills = SkillStore::new(db::connect(&cfg).await?);
            let n = skills.seed_from_file(&file).await?;
            println!("Seeded {} skill records.", n);
        }
        Commands::Index => {
            let services = Services::build(&cfg).await?;
            let report = services.indexer.run().await?;
            println!("Indexed {} records as version {}.", report.total, report.version);
        }
        Commands::Ask { query, bypass } => {
            let services = Services::build(&cfg).await?;
            let ctx = RequestContext {
                now: chrono::Utc::now(),
                bypass: bypass.as_deref(),
            };
            let response = services.queries.answer_and_flush(&query, ctx).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
