//! Service configuration sourced from environment variables.
//!
//! An optional YAML file named by `EZTRIP_CONFIG` overrides individual
//! values after the environment is read. [`ApiConfig::validate`] enforces the
//! production rules; a failure there aborts startup before anything listens.
use anyhow::{Context, Result, bail};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Production,
    Development,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" | "release" => Ok(RunMode::Production),
            "development" | "dev" | "debug" => Ok(RunMode::Development),
            other => bail!("unknown run mode {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => bail!("unknown storage backend {other}"),
        }
    }
}

/// Trust settings for bearer tokens.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Expected `iss`, normalized with a trailing `/`.
    pub issuer_url: String,
    pub audiences: Vec<String>,
    /// Skips discovery when set.
    pub jwks_url: Option<String>,
    pub allowed_algorithms: Vec<Algorithm>,
    pub jwks_cache_ttl: Duration,
    pub jwks_stale_grace: Duration,
    pub clock_skew_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub auto_provision: bool,
    /// Role granted to principals created by auto-provisioning.
    pub default_role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub mode: RunMode,
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    /// `None` only when issuer or audience is unset.
    pub auth: Option<AuthConfig>,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    pub identity: IdentityConfig,
    pub policy_cache_ttl: Duration,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiConfigOverride {
    mode: Option<String>,
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    issuer_url: Option<String>,
    audiences: Option<Vec<String>>,
    jwks_url: Option<String>,
    storage: Option<String>,
    database_url: Option<String>,
    auto_provision: Option<bool>,
    default_role: Option<String>,
    policy_cache_ttl_secs: Option<u64>,
    cors_allowed_origins: Option<Vec<String>>,
}

struct RawAuth {
    issuer_url: Option<String>,
    audiences: Vec<String>,
    jwks_url: Option<String>,
    allowed_algorithms: Vec<Algorithm>,
    jwks_cache_ttl: Duration,
    jwks_stale_grace: Duration,
    clock_skew_seconds: u64,
}

impl RawAuth {
    /// `None` only when no trust setting is present at all; a partial set is
    /// an error in every mode.
    fn build(&self) -> Result<Option<AuthConfig>> {
        let issuer_url = match (self.issuer_url.as_deref(), self.audiences.is_empty()) {
            (None, true) => {
                if self.jwks_url.is_some() {
                    bail!("AUTH0_ISSUER_URL and AUTH0_AUDIENCE are required when AUTH0_JWKS_URL is set");
                }
                return Ok(None);
            }
            (Some(_), true) => bail!("AUTH0_AUDIENCE is required when AUTH0_ISSUER_URL is set"),
            (None, false) => bail!("AUTH0_ISSUER_URL is required when AUTH0_AUDIENCE is set"),
            (Some(issuer_url), false) => issuer_url,
        };
        Ok(Some(AuthConfig {
            issuer_url: normalize_issuer_url(issuer_url),
            audiences: self.audiences.clone(),
            jwks_url: self.jwks_url.clone(),
            allowed_algorithms: self.allowed_algorithms.clone(),
            jwks_cache_ttl: self.jwks_cache_ttl,
            jwks_stale_grace: self.jwks_stale_grace,
            clock_skew_seconds: self.clock_skew_seconds,
        }))
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("EZTRIP_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read EZTRIP_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mode = get("EZTRIP_ENV")
            .map(|value| value.parse::<RunMode>())
            .transpose()
            .with_context(|| "parse EZTRIP_ENV")?
            .unwrap_or(RunMode::Production);
        let bind_addr = get("EZTRIP_BIND")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse EZTRIP_BIND")?;
        let metrics_bind = get("EZTRIP_METRICS_BIND")
            .unwrap_or_else(|| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse EZTRIP_METRICS_BIND")?;

        let raw_auth = RawAuth {
            issuer_url: get("AUTH0_ISSUER_URL"),
            audiences: split_list(get("AUTH0_AUDIENCE").as_deref()),
            jwks_url: get("AUTH0_JWKS_URL"),
            allowed_algorithms: parse_algorithms(
                get("AUTH0_ALGORITHMS").as_deref().unwrap_or("RS256"),
            )?,
            jwks_cache_ttl: Duration::from_secs(parse_or(
                get("EZTRIP_JWKS_CACHE_TTL_SECS"),
                300,
                "EZTRIP_JWKS_CACHE_TTL_SECS",
            )?),
            jwks_stale_grace: Duration::from_secs(parse_or(
                get("EZTRIP_JWKS_STALE_GRACE_SECS"),
                3600,
                "EZTRIP_JWKS_STALE_GRACE_SECS",
            )?),
            clock_skew_seconds: parse_or(get("EZTRIP_CLOCK_SKEW_SECS"), 60, "EZTRIP_CLOCK_SKEW_SECS")?,
        };

        let storage = get("EZTRIP_STORAGE")
            .map(|value| value.parse::<StorageBackend>())
            .transpose()
            .with_context(|| "parse EZTRIP_STORAGE")?
            .unwrap_or(StorageBackend::Memory);
        let postgres = match get("DATABASE_URL") {
            Some(url) => Some(PostgresConfig {
                url,
                max_connections: parse_or(
                    get("EZTRIP_PG_MAX_CONNECTIONS"),
                    10,
                    "EZTRIP_PG_MAX_CONNECTIONS",
                )?,
                acquire_timeout_ms: parse_or(
                    get("EZTRIP_PG_ACQUIRE_TIMEOUT_MS"),
                    5_000,
                    "EZTRIP_PG_ACQUIRE_TIMEOUT_MS",
                )?,
            }),
            None => None,
        };

        let identity = IdentityConfig {
            auto_provision: parse_or(get("EZTRIP_AUTO_PROVISION"), true, "EZTRIP_AUTO_PROVISION")?,
            // An explicitly empty value disables the default role.
            default_role: match lookup("EZTRIP_DEFAULT_ROLE") {
                Some(value) if value.trim().is_empty() => None,
                Some(value) => Some(value.trim().to_string()),
                None => Some(eztrip_authz::ROLE_USER.to_string()),
            },
        };

        Ok(Self {
            mode,
            bind_addr,
            metrics_bind,
            auth: raw_auth.build()?,
            storage,
            postgres,
            identity,
            policy_cache_ttl: Duration::from_secs(parse_or(
                get("EZTRIP_POLICY_CACHE_TTL_SECS"),
                30,
                "EZTRIP_POLICY_CACHE_TTL_SECS",
            )?),
            cors_allowed_origins: split_list(get("CORS_ALLOWED_ORIGINS").as_deref()),
        })
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ApiConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse api config yaml")?;
        if let Some(value) = override_cfg.mode {
            self.mode = value.parse().with_context(|| "parse mode")?;
        }
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if override_cfg.issuer_url.is_some()
            || override_cfg.audiences.is_some()
            || override_cfg.jwks_url.is_some()
        {
            let current = self.auth.take();
            let raw = RawAuth {
                issuer_url: override_cfg
                    .issuer_url
                    .or_else(|| current.as_ref().map(|auth| auth.issuer_url.clone())),
                audiences: override_cfg
                    .audiences
                    .or_else(|| current.as_ref().map(|auth| auth.audiences.clone()))
                    .unwrap_or_default(),
                jwks_url: override_cfg
                    .jwks_url
                    .or_else(|| current.as_ref().and_then(|auth| auth.jwks_url.clone())),
                allowed_algorithms: current
                    .as_ref()
                    .map(|auth| auth.allowed_algorithms.clone())
                    .unwrap_or_else(|| vec![Algorithm::RS256]),
                jwks_cache_ttl: current
                    .as_ref()
                    .map(|auth| auth.jwks_cache_ttl)
                    .unwrap_or(Duration::from_secs(300)),
                jwks_stale_grace: current
                    .as_ref()
                    .map(|auth| auth.jwks_stale_grace)
                    .unwrap_or(Duration::from_secs(3600)),
                clock_skew_seconds: current
                    .as_ref()
                    .map(|auth| auth.clock_skew_seconds)
                    .unwrap_or(60),
            };
            self.auth = raw.build()?;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value.parse().with_context(|| "parse storage")?;
        }
        if let Some(url) = override_cfg.database_url {
            match self.postgres.as_mut() {
                Some(pg) => pg.url = url,
                None => {
                    self.postgres = Some(PostgresConfig {
                        url,
                        max_connections: 10,
                        acquire_timeout_ms: 5_000,
                    })
                }
            }
        }
        if let Some(value) = override_cfg.auto_provision {
            self.identity.auto_provision = value;
        }
        if let Some(value) = override_cfg.default_role {
            let value = value.trim().to_string();
            self.identity.default_role = (!value.is_empty()).then_some(value);
        }
        if let Some(value) = override_cfg.policy_cache_ttl_secs {
            self.policy_cache_ttl = Duration::from_secs(value);
        }
        if let Some(value) = override_cfg.cors_allowed_origins {
            self.cors_allowed_origins = value;
        }
        Ok(())
    }

    /// Reject configurations that must never serve traffic.
    pub fn validate(&self) -> Result<()> {
        if let Some(auth) = &self.auth {
            if auth.allowed_algorithms.is_empty() {
                bail!("AUTH0_ALGORITHMS must list at least one algorithm");
            }
            if let Some(alg) = auth
                .allowed_algorithms
                .iter()
                .find(|alg| !is_asymmetric(**alg))
            {
                bail!("AUTH0_ALGORITHMS: {alg:?} is not an asymmetric algorithm");
            }
        }
        if self.storage == StorageBackend::Postgres && self.postgres.is_none() {
            bail!("DATABASE_URL is required when EZTRIP_STORAGE=postgres");
        }
        if let Some(role) = &self.identity.default_role
            && role == eztrip_authz::WILDCARD
        {
            bail!("EZTRIP_DEFAULT_ROLE cannot be the wildcard");
        }
        if self.mode == RunMode::Production {
            if self.auth.is_none() {
                bail!("AUTH0_ISSUER_URL and AUTH0_AUDIENCE are required in production");
            }
            if self.storage != StorageBackend::Postgres {
                bail!("EZTRIP_STORAGE=postgres is required in production");
            }
            if self.cors_allowed_origins.is_empty() {
                bail!("CORS_ALLOWED_ORIGINS is required in production");
            }
        }
        Ok(())
    }
}

/// Auth0 issues `iss` with a trailing slash; accept the URL either way.
pub fn normalize_issuer_url(issuer: &str) -> String {
    let trimmed = issuer.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

pub fn is_asymmetric(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
            | Algorithm::ES256
            | Algorithm::ES384
            | Algorithm::EdDSA
    )
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_algorithms(value: &str) -> Result<Vec<Algorithm>> {
    split_list(Some(value))
        .iter()
        .map(|name| {
            Algorithm::from_str(name).with_context(|| format!("parse AUTH0_ALGORITHMS: {name}"))
        })
        .collect()
}

fn parse_or<T>(value: Option<String>, default: T, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("parse {key}")),
        None => Ok(default),
    }
}
