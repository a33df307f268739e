//! Authentication middleware.
//!
//! Validates the bearer token (if any), resolves the principal once, and
//! stores an [`AuthContext`] in the request extensions for handlers.
use crate::api::error::{ApiError, api_unauthorized};
use crate::app::AppState;
use crate::auth::gate::AuthContext;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

#[derive(Debug, PartialEq, Eq)]
pub enum BearerToken<'a> {
    Absent,
    Malformed,
    Present(&'a str),
}

/// Read `Authorization: Bearer <token>`; the scheme is case-insensitive.
pub fn extract_bearer(headers: &HeaderMap) -> BearerToken<'_> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return BearerToken::Absent;
    };
    let Ok(value) = value.to_str() else {
        return BearerToken::Malformed;
    };
    match value.trim().split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            BearerToken::Present(token.trim())
        }
        _ => BearerToken::Malformed,
    }
}

pub async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    // CORS preflight carries no credentials.
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let context = match resolve_context(&state, request.headers()).await {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };
    request.extensions_mut().insert(context);
    next.run(request).await
}

async fn resolve_context(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let anonymous = || AuthContext::anonymous(state.enforcer.clone());
    let Some(validator) = state.token_validator.as_ref() else {
        // Development without identity provider configuration.
        return Ok(anonymous());
    };

    let token = match extract_bearer(headers) {
        BearerToken::Absent => return Ok(anonymous()),
        BearerToken::Malformed => {
            tracing::debug!("rejecting malformed authorization header");
            return Err(api_unauthorized("unauthorized"));
        }
        BearerToken::Present(token) => token,
    };

    let claims = validator.validate(token).await.map_err(|err| {
        tracing::info!(error = %err, kind = ?err.kind(), "bearer token rejected");
        ApiError::from(err)
    })?;
    let principal = state.identity.resolve(&claims).await;
    Ok(AuthContext::new(principal, state.enforcer.clone()))
}
