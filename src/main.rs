//! # Context Relay CLI (`crelay`)
//!
//! ## Usage
//!
//! ```bash
//! crelay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crelay init` | Create the SQLite database and run schema migrations |
//! | `crelay ingest <path>` | Ingest a PDF, or every PDF in a directory |
//! | `crelay ask "<question>"` | Answer a question from the indexed documents |
//! | `crelay documents list` | List ingested documents |
//! | `crelay documents delete <id>` | Remove a document from the registry |
//! | `crelay serve` | Start the HTTP/WebSocket server |
//!
//! ## Examples
//!
//! ```bash
//! crelay init
//! crelay ingest ./resumes/
//! crelay ask "What is the candidate's title?"
//! crelay serve
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use context_relay::app::App;
use context_relay::config::{self, Config};
use context_relay::store::DocumentRegistry;
use context_relay::{db, migrate, server};

/// Context Relay: ask questions about your PDFs, answered from their content.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/relay.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "crelay",
    about = "Retrieval-augmented question answering over PDF documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/relay.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest a PDF file, or every PDF directly inside a directory.
    Ingest {
        /// File or directory path.
        path: PathBuf,
    },

    /// Run retrieval, grading and generation once and print the answer.
    Ask {
        /// The question.
        question: String,
    },

    /// Manage ingested documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Start the HTTP and WebSocket server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List ingested documents, newest first.
    List,
    /// Delete a document's registry row.
    ///
    /// Its indexed chunks stay searchable.
    Delete {
        /// Document UUID.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = read_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest { path } => {
            let app = App::open(&cfg).await?;
            run_ingest(&app, &path).await?;
        }
        Commands::Ask { question } => {
            let app = App::open(&cfg).await?;
            let state = app.workflow()?.run(&question).await?;
            if state.needs_web_search {
                warn!("no retrieved passage was judged relevant");
            }
            println!("{}", state.answer.unwrap_or_default());
        }
        Commands::Documents { action } => {
            let app = App::open(&cfg).await?;
            let registry: Arc<dyn DocumentRegistry> = app.store.clone();
            match action {
                DocumentsAction::List => {
                    let docs = registry.list().await?;
                    if docs.is_empty() {
                        println!("No documents.");
                    }
                    for doc in docs {
                        println!(
                            "{}  {}  {} bytes  {} chunks  {}",
                            doc.id, doc.filename, doc.file_size, doc.chunk_count, doc.created_at
                        );
                    }
                }
                DocumentsAction::Delete { id } => {
                    if registry.delete(&id).await? {
                        println!("Deleted document {}", id);
                    } else {
                        anyhow::bail!("document not found: {}", id);
                    }
                }
            }
        }
        Commands::Serve => {
            let app = App::open(&cfg).await?;
            server::run_server(&app).await?;
        }
    }

    Ok(())
}

fn read_config(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

async fn run_ingest(app: &App, path: &Path) -> Result<()> {
    if path.is_dir() {
        let report = app.ingestor.ingest_dir(path).await?;
        println!("ingest {}", path.display());
        for (file, summary) in &report.ingested {
            println!("  {}: {}", file.display(), summary.message);
        }
        for (file, err) in &report.failed {
            println!("  {}: FAILED ({})", file.display(), err);
        }
        println!(
            "  files ingested: {}, failed: {}",
            report.ingested.len(),
            report.failed.len()
        );
    } else {
        let summary = app.ingestor.process(path).await?;
        println!("{}", summary.message);
        println!("  document id: {}", summary.document_id);
    }
    println!("ok");
    Ok(())
}
