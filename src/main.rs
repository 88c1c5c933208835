use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::io::AsyncReadExt;

mod db;
mod models;
mod report;
mod schema;
mod scorer;
mod service;
mod validate;

use db::{MemoryPredictionStore, PgPredictionStore, PredictionStore};
use scorer::ModelBundle;
use service::ScoringService;

#[derive(Parser)]
#[command(name = "income-scoring")]
#[command(about = "Scores census observations and records their true outcomes", long_about = None)]
struct Cli {
    /// Directory holding columns.json, dtypes.json and model.json
    #[arg(long, global = true, default_value = "data")]
    artifacts: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the predictions table
    InitDb,
    /// Score one request, or a JSON array of requests, and store the results.
    /// Prints one JSON response per line as each request is scored.
    Score {
        /// Request file; stdin when omitted
        #[arg(long)]
        request: Option<PathBuf>,
        /// Keep predictions in memory instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },
    /// Record the true class of a previously scored observation
    Correct {
        /// Request file; stdin when omitted
        #[arg(long)]
        request: Option<PathBuf>,
    },
    /// Print the stored record for an observation
    Show {
        #[arg(long)]
        id: String,
    },
    /// Generate a markdown audit report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export every stored prediction as CSV
    Export {
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Score { request, dry_run } => {
            let bundle = Arc::new(ModelBundle::load(&cli.artifacts)?);
            let payload = read_request(request.as_deref()).await?;
            let mut stdout = std::io::stdout();
            if dry_run {
                let service = ScoringService::new(bundle, MemoryPredictionStore::new());
                score_payload(&service, &payload, &mut stdout).await?;
            } else {
                let store = PgPredictionStore::new(connect().await?);
                let service = ScoringService::new(bundle, store);
                score_payload(&service, &payload, &mut stdout).await?;
            }
        }
        Commands::Correct { request } => {
            let payload = read_request(request.as_deref()).await?;
            let store = PgPredictionStore::new(connect().await?);
            let response = service::correct(&store, &payload).await?;
            println!("{}", serde_json::to_string(&response)?);
        }
        Commands::Show { id } => {
            let store = PgPredictionStore::new(connect().await?);
            match service::lookup(&store, &Value::String(id.clone())).await? {
                Some(row) => println!("{}", serde_json::to_string(&row)?),
                None => println!(
                    "{}",
                    serde_json::json!({ "error": format!("Observation ID '{id}' does not exist") })
                ),
            }
        }
        Commands::Report { out } => {
            let bundle = ModelBundle::load(&cli.artifacts)?;
            let store = PgPredictionStore::new(connect().await?);
            let rows = store.list().await?;
            let report = report::build_report(&rows, bundle.threshold());
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { out } => {
            let store = PgPredictionStore::new(connect().await?);
            let rows = store.list().await?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let written = report::export_csv(&rows, file)?;
            println!("Exported {written} predictions to {}.", out.display());
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn read_request(path: Option<&Path>) -> anyhow::Result<Value> {
    let text = match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("failed to read request from stdin")?;
            text
        }
    };
    serde_json::from_str(&text).context("request is not valid JSON")
}

/// Scores each request and writes its response line before moving on, so an
/// internal fault part way through a batch still leaves the earlier
/// predictions on the output.
async fn score_payload<S: PredictionStore, W: Write>(
    service: &ScoringService<S>,
    payload: &Value,
    out: &mut W,
) -> anyhow::Result<()> {
    let requests = match payload {
        Value::Array(requests) => requests.as_slice(),
        request => std::slice::from_ref(request),
    };

    for (index, request) in requests.iter().enumerate() {
        let response = service
            .score(request)
            .await
            .with_context(|| format!("batch stopped at request {}", index + 1))?;
        writeln!(out, "{}", serde_json::to_string(&response)?)?;
        out.flush()?;
    }
    Ok(())
}
