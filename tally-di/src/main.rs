//! tally-di - Document Ingest service
//!
//! Ingests source documents through a two-stage pipeline: extraction into
//! an append-only observation store, then rule-set-driven normalization
//! into a versioned canonical store. Publishing a new rule-set version
//! triggers re-normalization sweeps that replay observations without
//! touching the original documents.

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use tally_common::events::EventBus;

use tally_di::pipeline::Coordinator;
use tally_di::AppState;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting tally-di (Document Ingest) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Resolve root folder
    let resolver = tally_common::config::RootFolderResolver::new("document-ingest");
    let root_folder = resolver.resolve();

    // Step 2: Create root folder directory if missing
    let initializer = tally_common::config::RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;

    // Step 3: Open or create database
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());

    let db_pool = tally_di::store::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Step 4: Crash recovery. Interrupted extractions committed nothing
    // and start over; units at the durable checkpoint resume in the
    // background without re-parsing.
    let reverted = tally_di::store::works::revert_interrupted_extractions(&db_pool).await?;
    if reverted > 0 {
        info!(reverted, "Interrupted extractions reverted to PENDING");
    }

    let event_bus = EventBus::new(100);
    info!("Event bus initialized");

    let resumable = tally_di::store::works::resumable_works(&db_pool).await?;
    if !resumable.is_empty() {
        info!(count = resumable.len(), "Resuming units of work from durable checkpoints");
        let resume_pool = db_pool.clone();
        let resume_bus = event_bus.clone();
        tokio::spawn(async move {
            let coordinator = Coordinator::new(resume_pool, resume_bus);
            for work in resumable {
                let work_id = work.work_id;
                if let Err(e) = coordinator.resume(work, CancellationToken::new()).await {
                    tracing::error!(work_id = %work_id, error = %e, "Resume failed");
                }
            }
        });
    }

    // Create application state and router
    let state = AppState::new(db_pool, event_bus);
    let app = tally_di::build_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind("127.0.0.1:5741").await?;
    info!("Listening on http://127.0.0.1:5741");
    info!("Health check: http://127.0.0.1:5741/health");

    axum::serve(listener, app).await?;

    Ok(())
}
