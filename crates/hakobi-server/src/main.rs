//! Process entrypoint: config, logging, pool, engine tasks, HTTP.

mod config;
mod http;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use hakobi_core::admin::Admin;
use hakobi_core::clock::{Clock, SystemClock};
use hakobi_core::executor::Executor;
use hakobi_core::finalizer::JobFinalizer;
use hakobi_core::lease::LeaseManager;
use hakobi_core::model::WorkerId;
use hakobi_core::poller::Poller;
use hakobi_core::submission::Submitter;
use hakobi_core::TokioSpawner;
use hakobi_sqlx::{PgExportSource, PgStore};

use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "hakobi-server", about = "Batch CSV export coordination service")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn build_object_store(
    config: &ServerConfig,
) -> anyhow::Result<Arc<dyn object_store::ObjectStore>> {
    match config.object_store.kind.as_str() {
        "s3" => {
            let store = object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(&config.engine.storage.bucket)
                .build()?;
            Ok(Arc::new(store))
        }
        "local" => {
            std::fs::create_dir_all(&config.object_store.root)?;
            let store =
                object_store::local::LocalFileSystem::new_with_prefix(&config.object_store.root)?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(object_store::memory::InMemory::new())),
        other => anyhow::bail!("unknown object_store.kind {other:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_deref())?;
    logging::init(&config.logging.level);
    config.validate()?;
    let timezone = config.engine.timezone_offset()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size())
        .acquire_timeout(std::time::Duration::from_secs(
            config.database.acquire_timeout_secs,
        ))
        .connect(&config.database.url)
        .await?;

    let store = PgStore::new(pool.clone());
    store.migrate().await?;

    let source = PgExportSource::new(pool.clone(), &config.source.function)?;
    let storage = build_object_store(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let token = tokio_util::sync::CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    for _ in 0..config.server.pollers {
        let worker_id = WorkerId::generate();
        tracing::info!(worker = %worker_id, "starting poller");
        let lease = LeaseManager::new(
            store.clone(),
            worker_id,
            config.engine.worker.lease_seconds,
            clock.clone(),
        );
        let executor = Arc::new(Executor::new(
            store.clone(),
            source.clone(),
            storage.clone(),
            lease.clone(),
            JobFinalizer::new(store.clone(), clock.clone()),
            &config.engine,
            timezone,
            clock.clone(),
        ));
        let poller = Poller::<_, _, TokioSpawner>::new(
            store.clone(),
            lease,
            executor,
            &config.engine.worker,
            clock.clone(),
        );
        tasks.spawn(poller.run(token.clone().cancelled_owned()));
    }

    let finalizer = JobFinalizer::new(store.clone(), clock.clone());
    tasks.spawn(finalizer.run(
        std::time::Duration::from_millis(config.engine.finalizer.interval_ms),
        token.clone().cancelled_owned(),
    ));

    let state = web::Data::new(http::AppState {
        submitter: Submitter::new(
            store.clone(),
            config.engine.submission.max_units_per_job,
            clock.clone(),
        ),
        admin: Admin::new(store.clone(), clock.clone()),
    });

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(http::configure))
        .bind(&config.http.addr)?
        .run();
    let server_handle = server.handle();
    tracing::info!(addr = %config.http.addr, "listening");

    // Stop the engine and the HTTP server on Ctrl+C, then drain.
    let shutdown_token = token.clone();
    tasks.spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_token.cancel();
        server_handle.stop(true).await;
    });

    server.await?;
    token.cancel();
    while tasks.join_next().await.is_some() {}
    Ok(())
}
