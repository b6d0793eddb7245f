//! Console HTTP service entry point.
//!
//! # Purpose
//! Wires configuration, the document store, the orchestration client, the
//! background loops and the HTTP router, then serves until shutdown.
//!
//! # Notes
//! The `build_runtime` helper keeps wiring testable and minimizes main setup logic.
use anyhow::Context;
use console::app::{AppState, build_router};
use console::config::{ConsoleConfig, StorageBackend};
use console::digest::{DigestLoop, LoggingSink};
use console::mirror::NamespaceMirror;
use console::model::{Document, Role, User, collections};
use console::observability;
use console::orchestration::kube::KubeClient;
use console::orchestration::{OrchestrationApi, Unconfigured};
use console::store::filter::Filter;
use console::store::memory::InMemoryStore;
use console::store::postgres::PostgresStore;
use console::store::query::Query;
use console::store::{DocumentStore, StoreConfig};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConsoleConfig::from_env_or_yaml().context("console config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

struct Runtime {
    state: AppState,
    background: Vec<JoinHandle<()>>,
}

async fn run_with_shutdown<F>(config: ConsoleConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("console")?;
    let runtime = build_runtime(&config).await?;
    let metrics_listener = tokio::net::TcpListener::bind(config.metrics_bind)
        .await
        .with_context(|| format!("bind metrics listener {}", config.metrics_bind))?;
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        metrics_listener,
    ));

    let app = build_router(runtime.state.clone());
    let addr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        backend = runtime.state.store.backend_name(),
        "console listening"
    );
    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {
            tracing::info!("console shutting down");
        }
    }

    metrics_task.abort();
    let _ = metrics_task.await;
    for task in runtime.background {
        task.abort();
        let _ = task.await;
    }
    Ok(())
}

async fn build_store(config: &ConsoleConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let store_config = StoreConfig {
        change_retention: config.change_retention,
        cursor_idle_timeout: config.cursor_idle_timeout,
        ..StoreConfig::default()
    };
    Ok(match config.storage {
        StorageBackend::Memory => Arc::new(InMemoryStore::new(store_config)),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresStore::connect(pg, store_config).await?)
        }
    })
}

/// Insert the configured administrator unless a live user with that name exists.
async fn seed_admin(store: Arc<dyn DocumentStore>, username: &str) -> anyhow::Result<()> {
    let users = Query::new(store, collections::USERS);
    if users.find_one(Filter::eq("username", username)).await?.is_some() {
        return Ok(());
    }
    let admin = User {
        id: None,
        username: username.to_string(),
        role: Role::Administrator,
        firstname: String::new(),
        lastname: String::new(),
        notifications: Default::default(),
        metadata: Default::default(),
    };
    users.insert(Document::from_model(&admin)?).await?;
    tracing::info!(user = %username, "seeded administrator");
    Ok(())
}

async fn build_runtime(config: &ConsoleConfig) -> anyhow::Result<Runtime> {
    let store = build_store(config).await?;
    if let Some(admin) = &config.admin_user {
        seed_admin(store.clone(), admin).await?;
    }

    let mut background = vec![
        Arc::new(DigestLoop::new(store.clone(), Arc::new(LoggingSink))).spawn(config.digest_interval),
    ];
    let orchestrator: Arc<dyn OrchestrationApi> = match &config.orchestrator {
        Some(orchestrator) => {
            let client: Arc<dyn OrchestrationApi> = Arc::new(KubeClient::new(
                orchestrator.base_url.clone(),
                orchestrator.token.clone(),
            ));
            background.push(
                Arc::new(NamespaceMirror::new(store.clone(), client.clone()))
                    .spawn(config.mirror_interval),
            );
            client
        }
        None => {
            tracing::warn!("no orchestration api configured; namespace writes will fail");
            Arc::new(Unconfigured)
        }
    };

    Ok(Runtime {
        state: AppState::new(store, orchestrator, config.convergence_timeout),
        background,
    })
}
