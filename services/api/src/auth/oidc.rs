//! Bearer token validation against the configured identity provider.
//!
//! # Purpose
//! Verify inbound access tokens (Auth0 by default) and extract the subject
//! the identity resolver keys on.
//!
//! # Key invariants
//! - Only the configured asymmetric algorithms are accepted; `HS*` and `none`
//!   never reach signature verification.
//! - Signature, `iss`, `aud`, `exp` and `nbf` are all verified, with a fixed
//!   leeway for clock skew.
//! - The subject is non-empty after trimming.
//! - The raw token never appears in logs or error messages.
//!
//! # Failure taxonomy
//! Every [`TokenError`] maps onto one of three kinds (see [`TokenErrorKind`]):
//! missing token, invalid token, or a verified token without a subject.
use crate::auth::jwks::{JwksCache, JwksError, KeySource};
use crate::config::{AuthConfig, is_asymmetric};
use crate::observability::TOKEN_VALIDATIONS_TOTAL;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashSet;

/// Identity data taken from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedClaims {
    pub subject: String,
    pub issuer: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorKind {
    MissingToken,
    InvalidToken,
    MissingSubject,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing authorization token")]
    MissingToken,
    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),
    #[error("missing key id")]
    MissingKeyId,
    #[error("signing key not found")]
    KeyNotFound,
    #[error("invalid jwk: {0}")]
    InvalidJwk(String),
    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(#[from] JwksError),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token missing sub claim")]
    MissingSubject,
}

impl TokenError {
    pub fn kind(&self) -> TokenErrorKind {
        match self {
            TokenError::MissingToken => TokenErrorKind::MissingToken,
            TokenError::MissingSubject => TokenErrorKind::MissingSubject,
            _ => TokenErrorKind::InvalidToken,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
}

/// Validates bearer tokens for one issuer.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    issuer: String,
    audiences: Vec<String>,
    allowed_algorithms: Vec<Algorithm>,
    clock_skew_seconds: u64,
    keys: JwksCache,
}

impl TokenValidator {
    pub fn new(config: &AuthConfig) -> Result<Self, TokenError> {
        let keys = JwksCache::new(
            key_source(config),
            config.jwks_cache_ttl,
            config.jwks_stale_grace,
        )?;
        Ok(Self::with_keys(config, keys))
    }

    /// Build with a caller-supplied HTTP client for key fetches.
    pub fn with_client(config: &AuthConfig, client: reqwest::Client) -> Self {
        let keys = JwksCache::with_client(
            client,
            key_source(config),
            config.jwks_cache_ttl,
            config.jwks_stale_grace,
        );
        Self::with_keys(config, keys)
    }

    /// Build with a caller-supplied key cache.
    pub fn with_keys(config: &AuthConfig, keys: JwksCache) -> Self {
        Self {
            issuer: config.issuer_url.clone(),
            audiences: config.audiences.clone(),
            allowed_algorithms: config
                .allowed_algorithms
                .iter()
                .copied()
                .filter(|alg| is_asymmetric(*alg))
                .collect(),
            clock_skew_seconds: config.clock_skew_seconds,
            keys,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Validate `token` and return its identity claims.
    ///
    /// # Errors
    /// See [`TokenError`]; use [`TokenError::kind`] for the coarse category.
    pub async fn validate(&self, token: &str) -> Result<ValidatedClaims, TokenError> {
        let result = self.validate_inner(token).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(err) => match err.kind() {
                TokenErrorKind::MissingToken => "missing",
                TokenErrorKind::InvalidToken => "invalid",
                TokenErrorKind::MissingSubject => "missing_subject",
            },
        };
        metrics::counter!(TOKEN_VALIDATIONS_TOTAL, "result" => label).increment(1);
        result
    }

    async fn validate_inner(&self, token: &str) -> Result<ValidatedClaims, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::MissingToken);
        }

        // Step 1: Pin the algorithm before touching any key material.
        let header = decode_header(token)?;
        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }
        let kid = header.kid.as_deref().ok_or(TokenError::MissingKeyId)?;

        // Step 2: Find the signing key, refreshing once on a miss to pick up
        // provider key rotation.
        let jwks = self.keys.keys().await?;
        let decoding_key = match find_jwk(&jwks, kid) {
            Some(jwk) => decoding_key_for(jwk, header.alg)?,
            None => {
                let refreshed = self
                    .keys
                    .force_refresh()
                    .await?
                    .ok_or(TokenError::KeyNotFound)?;
                let jwk = find_jwk(&refreshed, kid).ok_or(TokenError::KeyNotFound)?;
                decoding_key_for(jwk, header.alg)?
            }
        };

        // Step 3: Verify signature and registered claims.
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&self.audiences);
        validation.required_spec_claims = HashSet::from([
            "exp".to_string(),
            "iss".to_string(),
            "aud".to_string(),
        ]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.clock_skew_seconds;
        let data = decode::<TokenClaims>(token, &decoding_key, &validation)?;

        // Step 4: Only now is the subject trustworthy.
        let claims = data.claims;
        let subject = claims
            .sub
            .as_deref()
            .map(str::trim)
            .filter(|sub| !sub.is_empty())
            .ok_or(TokenError::MissingSubject)?
            .to_string();
        Ok(ValidatedClaims {
            subject,
            issuer: claims.iss.unwrap_or_else(|| self.issuer.clone()),
            email: claims.email,
            name: claims.name,
            given_name: claims.given_name,
            family_name: claims.family_name,
        })
    }
}

fn key_source(config: &AuthConfig) -> KeySource {
    match &config.jwks_url {
        Some(url) => KeySource::Url(url.clone()),
        None => KeySource::Discovery {
            issuer: config.issuer_url.clone(),
        },
    }
}

fn find_jwk<'a>(jwks: &'a JwkSet, kid: &str) -> Option<&'a Jwk> {
    jwks.keys
        .iter()
        .find(|key| key.common.key_id.as_deref() == Some(kid))
}

fn decoding_key_for(jwk: &Jwk, alg: Algorithm) -> Result<DecodingKey, TokenError> {
    ensure_jwk_matches_algorithm(jwk, alg)?;
    Ok(DecodingKey::from_jwk(jwk)?)
}

fn ensure_jwk_matches_algorithm(jwk: &Jwk, alg: Algorithm) -> Result<(), TokenError> {
    // `alg` on a JWK is optional (Auth0 sets it); when present it must agree.
    if let Some(key_alg) = jwk.common.key_algorithm.as_ref()
        && expected_key_algorithm(alg).as_ref() != Some(key_alg)
    {
        return Err(TokenError::InvalidJwk("alg mismatch".to_string()));
    }
    match (&jwk.algorithm, alg) {
        (
            AlgorithmParameters::RSA(_),
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512,
        ) => Ok(()),
        (AlgorithmParameters::EllipticCurve(params), Algorithm::ES256)
            if params.curve == EllipticCurve::P256 =>
        {
            Ok(())
        }
        (AlgorithmParameters::EllipticCurve(params), Algorithm::ES384)
            if params.curve == EllipticCurve::P384 =>
        {
            Ok(())
        }
        (AlgorithmParameters::OctetKeyPair(_), Algorithm::EdDSA) => Ok(()),
        _ => Err(TokenError::InvalidJwk("key type mismatch".to_string())),
    }
}

fn expected_key_algorithm(alg: Algorithm) -> Option<KeyAlgorithm> {
    match alg {
        Algorithm::RS256 => Some(KeyAlgorithm::RS256),
        Algorithm::RS384 => Some(KeyAlgorithm::RS384),
        Algorithm::RS512 => Some(KeyAlgorithm::RS512),
        Algorithm::PS256 => Some(KeyAlgorithm::PS256),
        Algorithm::PS384 => Some(KeyAlgorithm::PS384),
        Algorithm::PS512 => Some(KeyAlgorithm::PS512),
        Algorithm::ES256 => Some(KeyAlgorithm::ES256),
        Algorithm::ES384 => Some(KeyAlgorithm::ES384),
        Algorithm::EdDSA => Some(KeyAlgorithm::EdDSA),
        _ => None,
    }
}
