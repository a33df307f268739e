//! eztrip API service entry point.
//!
//! # Purpose
//! Loads and validates configuration, wires storage, token validation and the
//! policy enforcer, seeds default policies, then serves the API and the
//! metrics endpoint until shutdown.
use anyhow::Context;
use eztrip_api::app::{AppState, build_router, cors_layer};
use eztrip_api::auth::oidc::TokenValidator;
use eztrip_api::auth::rbac::initialize_policies;
use eztrip_api::config::{self, ApiConfig, RunMode};
use eztrip_api::observability;
use eztrip_api::store::memory::InMemoryStore;
use eztrip_api::store::postgres::PostgresStore;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ApiConfig::from_env_or_yaml().context("load api config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: ApiConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("eztrip-api");
    config.validate().context("invalid configuration")?;
    let cors = cors_layer(config.mode, &config.cors_allowed_origins)?;

    let state = build_state(&config).await?;
    initialize_policies(&state.enforcer)
        .await
        .context("seed default policies")?;

    let (metrics_stop_tx, metrics_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
        async move {
            let _ = metrics_stop_rx.await;
        },
    ));

    let app = build_router(state).layer(cors);
    let addr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, mode = ?config.mode, "eztrip api listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    let _ = metrics_stop_tx.send(());
    match metrics_task.await {
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics server failed"),
        Err(err) => tracing::warn!(error = %err, "metrics task panicked"),
        Ok(Ok(())) => {}
    }
    Ok(())
}

async fn build_state(config: &ApiConfig) -> anyhow::Result<AppState> {
    let token_validator = match &config.auth {
        Some(auth) => Some(Arc::new(
            TokenValidator::new(auth).context("build token validator")?,
        )),
        None => {
            if config.mode == RunMode::Production {
                anyhow::bail!("token validation must be configured in production");
            }
            tracing::warn!(
                "AUTH0_ISSUER_URL/AUTH0_AUDIENCE not set: bearer tokens are ignored and every \
                 request is anonymous. Never run this configuration in production."
            );
            None
        }
    };

    let state = match config.storage {
        config::StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; principals and policy are not durable");
            AppState::from_store(
                Arc::new(InMemoryStore::new()),
                config.policy_cache_ttl,
                &config.identity,
                token_validator,
            )
        }
        config::StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            let store = PostgresStore::connect(pg)
                .await
                .context("connect to postgres")?;
            AppState::from_store(
                Arc::new(store),
                config.policy_cache_ttl,
                &config.identity,
                token_validator,
            )
        }
    };
    Ok(state)
}
