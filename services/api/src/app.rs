//! HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
//!
//! # Notes
//! Layer order matters: tracing wraps authentication so rejected requests are
//! still traced, and CORS (applied by the caller) wraps everything so
//! preflight requests never reach authentication.
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::auth;
use crate::auth::identity::IdentityResolver;
use crate::auth::oidc::TokenValidator;
use crate::auth::rbac::PolicyEnforcer;
use crate::config::{IdentityConfig, RunMode};
use crate::observability;
use crate::store::AppStore;
use anyhow::{Context, bail};
use axum::http::{HeaderValue, Method, header};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub api_version: String,
    pub store: Arc<dyn AppStore>,
    pub enforcer: Arc<PolicyEnforcer>,
    pub identity: IdentityResolver,
    /// `None` only in development without identity provider configuration.
    pub token_validator: Option<Arc<TokenValidator>>,
}

impl AppState {
    /// Wire the enforcer and identity resolver over one backend.
    pub fn from_store<S>(
        store: Arc<S>,
        policy_cache_ttl: Duration,
        identity: &IdentityConfig,
        token_validator: Option<Arc<TokenValidator>>,
    ) -> Self
    where
        S: AppStore + 'static,
    {
        let enforcer = Arc::new(PolicyEnforcer::new(store.clone(), policy_cache_ttl));
        let resolver = IdentityResolver::new(
            store.clone(),
            enforcer.clone(),
            identity.auto_provision,
            identity.default_role.clone(),
        );
        Self {
            api_version: "v1".to_string(),
            store,
            enforcer,
            identity: resolver,
            token_validator,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route("/health", get(api::system::health))
        .route(
            "/v1/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route(
            "/v1/users/me",
            get(api::users::get_me).patch(api::users::update_me),
        )
        .route(
            "/v1/users",
            get(api::users::list_users).post(api::users::create_user),
        )
        .route(
            "/v1/users/:id",
            get(api::users::get_user).delete(api::users::delete_user),
        )
        .route(
            "/v1/users/:id/roles",
            get(api::roles::list_roles)
                .post(api::roles::add_role)
                .put(api::roles::replace_roles),
        )
        .route(
            "/v1/users/:id/roles/:role",
            axum::routing::delete(api::roles::remove_role),
        )
        .route(
            "/v1/roles/:role/principals",
            get(api::roles::principals_for_role),
        )
        .route(
            "/v1/rbac/policies",
            get(api::policies::list_policies).post(api::policies::add_policy),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::middleware::authenticate,
        ))
        .layer(trace_layer)
        .with_state(state)
}

/// CORS policy for the configured origins.
///
/// Development without an allowlist mirrors the request origin; production
/// refuses to start without one.
pub fn cors_layer(mode: RunMode, origins: &[String]) -> anyhow::Result<CorsLayer> {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);
    if origins.is_empty() {
        if mode == RunMode::Production {
            bail!("CORS_ALLOWED_ORIGINS is required in production");
        }
        tracing::warn!("CORS_ALLOWED_ORIGINS not set; mirroring any request origin");
        return Ok(base.allow_origin(AllowOrigin::mirror_request()));
    }
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin {origin}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(base.allow_origin(origins))
}
