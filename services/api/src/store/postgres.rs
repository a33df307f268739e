//! Postgres-backed store.
//!
//! # Purpose
//! Durable directory and policy storage shared by every API instance.
//!
//! # Key invariants
//! - Migrations run before the store is handed out, so handlers can assume
//!   the schema exists.
//! - Each public method is a single statement or one explicit transaction;
//!   nothing is left half-applied on error.
//! - `seed_rules_if_empty` serializes concurrent seeders with a
//!   transaction-scoped advisory lock.
//! - The connection URL is never logged (it may carry credentials).
use crate::config::PostgresConfig;
use crate::model::{NewPrincipal, Principal, PrincipalPatch};
use crate::store::{AppStore, DirectoryStore, PolicyStore, StoreError, StoreResult, Upserted};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eztrip_authz::{PolicyRule, RoleAssignment};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Advisory lock key guarding default-policy seeding.
const SEED_LOCK_KEY: i64 = 0x657a_7472_6970_0001;

const PRINCIPAL_COLUMNS: &str =
    "id, external_id, email, first_name, last_name, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct DbPrincipal {
    id: Uuid,
    external_id: Option<String>,
    email: Option<String>,
    first_name: String,
    last_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<DbPrincipal> for Principal {
    fn from(row: DbPrincipal) -> Self {
        Principal {
            id: row.id,
            external_id: row.external_id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbRule {
    subject: String,
    resource: String,
    action: String,
}

#[derive(Debug, FromRow)]
struct DbAssignment {
    principal_id: String,
    role: String,
}

impl PostgresStore {
    /// Connect, run migrations and return a ready store.
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        Self::connect_internal(pg, true).await
    }

    /// Connect without applying migrations. Used by tests that manage the
    /// schema themselves.
    pub async fn connect_without_migrations(pg: &PostgresConfig) -> StoreResult<Self> {
        Self::connect_internal(pg, false).await
    }

    async fn connect_internal(pg: &PostgresConfig, run_migrations: bool) -> StoreResult<Self> {
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options)
            .await?;

        if run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO principals (id, external_id, email, first_name, last_name, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(principal.id)
        .bind(&principal.external_id)
        .bind(&principal.email)
        .bind(&principal.first_name)
        .bind(&principal.last_name)
        .bind(principal.created_at)
        .bind(principal.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for PostgresStore {
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Principal>> {
        let row = sqlx::query_as::<_, DbPrincipal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals
             WHERE external_id = $1 AND deleted_at IS NULL"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Principal::from))
    }

    async fn upsert_by_external_id(
        &self,
        external_id: &str,
        mut profile: NewPrincipal,
    ) -> StoreResult<Upserted> {
        profile.external_id = Some(external_id.to_string());
        let candidate = profile.into_principal(Utc::now());

        // Step 1: Race-free insert; the unique constraint on external_id picks
        // exactly one winner among concurrent first logins.
        let inserted = sqlx::query_as::<_, DbPrincipal>(&format!(
            "INSERT INTO principals (id, external_id, email, first_name, last_name, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (external_id) DO NOTHING
             RETURNING {PRINCIPAL_COLUMNS}"
        ))
        .bind(candidate.id)
        .bind(&candidate.external_id)
        .bind(&candidate.email)
        .bind(&candidate.first_name)
        .bind(&candidate.last_name)
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .fetch_optional(&self.pool)
        .await;
        let email_conflict = match inserted {
            Ok(Some(row)) => {
                return Ok(Upserted {
                    principal: row.into(),
                    created: true,
                });
            }
            Ok(None) => None,
            // A concurrent winner can trip the email index before the
            // external_id arbiter; the read below sorts it out.
            Err(err) => match StoreError::from(err) {
                StoreError::Conflict(message) => Some(message),
                other => return Err(other),
            },
        };

        // Step 2: Lost the race (or already linked); read the winner.
        let existing = sqlx::query_as::<_, DbPrincipal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        let existing: Principal = match (existing, email_conflict) {
            (Some(row), _) => row.into(),
            (None, Some(message)) => return Err(StoreError::Conflict(message)),
            (None, None) => {
                return Err(StoreError::Unexpected(anyhow::anyhow!(
                    "principal for {external_id} vanished during upsert"
                )));
            }
        };
        if existing.is_deleted() {
            return Err(StoreError::Conflict(format!(
                "principal {} is deactivated",
                existing.id
            )));
        }
        Ok(Upserted {
            principal: existing,
            created: false,
        })
    }

    async fn create_principal(&self, profile: NewPrincipal) -> StoreResult<Principal> {
        let principal = profile.into_principal(Utc::now());
        self.insert_principal(&principal).await?;
        Ok(principal)
    }

    async fn get_principal(&self, id: Uuid) -> StoreResult<Principal> {
        let row = sqlx::query_as::<_, DbPrincipal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Principal::from)
            .ok_or_else(|| StoreError::NotFound(format!("principal {id}")))
    }

    async fn list_principals(&self) -> StoreResult<Vec<Principal>> {
        let rows = sqlx::query_as::<_, DbPrincipal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals
             WHERE deleted_at IS NULL
             ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Principal::from).collect())
    }

    async fn update_principal(&self, id: Uuid, patch: PrincipalPatch) -> StoreResult<Principal> {
        let row = sqlx::query_as::<_, DbPrincipal>(&format!(
            "UPDATE principals
             SET first_name = COALESCE($2, first_name),
                 last_name = COALESCE($3, last_name),
                 updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL
             RETURNING {PRINCIPAL_COLUMNS}"
        ))
        .bind(id)
        .bind(&patch.first_name)
        .bind(&patch.last_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Principal::from)
            .ok_or_else(|| StoreError::NotFound(format!("principal {id}")))
    }

    async fn delete_principal(&self, id: Uuid, hard: bool) -> StoreResult<()> {
        let result = if hard {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query("DELETE FROM principals WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("principal {id}")));
            }
            sqlx::query("DELETE FROM role_assignments WHERE principal_id = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            result
        } else {
            sqlx::query(
                "UPDATE principals SET deleted_at = now(), updated_at = now()
                 WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("principal {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for PostgresStore {
    async fn list_rules(&self) -> StoreResult<Vec<PolicyRule>> {
        let rows = sqlx::query_as::<_, DbRule>(
            "SELECT subject, resource, action FROM policy_rules ORDER BY subject, resource, action",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PolicyRule {
                subject: row.subject,
                resource: row.resource,
                action: row.action,
            })
            .collect())
    }

    async fn rule_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_rules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn add_rule(&self, rule: PolicyRule) -> StoreResult<bool> {
        rule.validate()?;
        let result = sqlx::query(
            "INSERT INTO policy_rules (subject, resource, action) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(&rule.subject)
        .bind(&rule.resource)
        .bind(&rule.action)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn seed_rules_if_empty(&self, rules: Vec<PolicyRule>) -> StoreResult<bool> {
        for rule in &rules {
            rule.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SEED_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_rules")
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            tx.commit().await?;
            return Ok(false);
        }
        for rule in &rules {
            sqlx::query(
                "INSERT INTO policy_rules (subject, resource, action) VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(&rule.subject)
            .bind(&rule.resource)
            .bind(&rule.action)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn list_assignments(&self) -> StoreResult<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, DbAssignment>(
            "SELECT principal_id, role FROM role_assignments ORDER BY principal_id, role",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| RoleAssignment {
                principal_id: row.principal_id,
                role: row.role,
            })
            .collect())
    }

    async fn add_role(&self, assignment: RoleAssignment) -> StoreResult<bool> {
        assignment.validate()?;
        let result = sqlx::query(
            "INSERT INTO role_assignments (principal_id, role) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(&assignment.principal_id)
        .bind(&assignment.role)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_role(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM role_assignments WHERE principal_id = $1 AND role = $2")
                .bind(&assignment.principal_id)
                .bind(&assignment.role)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_roles(&self, principal_id: &str, role: &str) -> StoreResult<()> {
        let assignment = RoleAssignment::new(principal_id, role)?;
        // Dropping `tx` on any early return rolls the removal back.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_assignments WHERE principal_id = $1")
            .bind(&assignment.principal_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO role_assignments (principal_id, role) VALUES ($1, $2)")
            .bind(&assignment.principal_id)
            .bind(&assignment.role)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_roles(&self, principal_id: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM role_assignments WHERE principal_id = $1")
            .bind(principal_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn roles_for_principal(&self, principal_id: &str) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT role FROM role_assignments WHERE principal_id = $1 ORDER BY role",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn principals_for_role(&self, role: &str) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT principal_id FROM role_assignments WHERE role = $1 ORDER BY principal_id",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl AppStore for PostgresStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
