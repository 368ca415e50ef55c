// Dealflow control-plane server
//
// Store selection: DATABASE_URL picks the PostgreSQL store; without it
// the in-memory store backs a single-node evaluation setup.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dealflow_api::{router, AppState};
use dealflow_durable::{
    Engine, EngineConfig, InstanceStore, MemoryInstanceStore, PostgresInstanceStore,
};
use dealflow_workflows::{register_all, Collaborators};

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "dealflow_api=debug,dealflow_durable=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::default()
        .with_auto_approve(env_flag("ALLOW_AUTO_APPROVE"))
        .with_fast_forward(env_flag("ALLOW_FAST_FORWARD"));

    let store: Arc<dyn InstanceStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = sqlx::PgPool::connect(&database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            let store = PostgresInstanceStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("creating engine tables")?;
            tracing::info!("using PostgreSQL store");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryInstanceStore::new())
        }
    };

    let collaborators = Collaborators::simulated();
    let engine = register_all(Engine::builder(), &collaborators)
        .store(store)
        .config(config)
        .build()
        .context("building engine")?;

    let recovered = engine.recover().await?;
    tracing::info!(recovered, "engine recovery complete");
    let handle = engine.spawn();

    let app = router(AppState {
        engine: engine.clone(),
    });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!("dealflow API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    handle.shutdown().await;
    Ok(())
}
