//! PostgreSQL-backed store.
//!
//! Read sessions hold one pooled connection each. A unit of work is written
//! inside a single transaction; a unique-index violation rolls the whole
//! transaction back and surfaces as [`StoreError::Conflict`].

use super::{
    LookupKey, StagedEntity, Store, StoreError, StoreResult, StoreSession, UnitOfWork,
    normalize_candidates,
};
use crate::models::{Application, Role, User, UserApplication};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply pending migrations. Already-applied migrations are skipped.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        log::info!("checking database migration state");
        MIGRATOR.run(&self.pool).await?;
        log::info!("database migrations up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(sqlx::query_as::<_, User>(
            r#"SELECT id, username, email, first_name, last_name, is_active, created_by, created_at
               FROM users ORDER BY created_at, username"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        Ok(sqlx::query_as::<_, Role>(
            r#"SELECT id, name, description, created_by, created_at
               FROM roles ORDER BY created_at, name"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_applications(&self) -> StoreResult<Vec<Application>> {
        Ok(sqlx::query_as::<_, Application>(
            r#"SELECT id, name, description, url, status, created_by, created_at
               FROM applications ORDER BY created_at, name"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_assignments(&self) -> StoreResult<Vec<UserApplication>> {
        Ok(sqlx::query_as::<_, UserApplication>(
            r#"SELECT id, user_id, application_id, role_id, expires_at, assigned_by, assigned_at
               FROM user_applications ORDER BY assigned_at"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession { conn }))
    }

    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize> {
        let pending = unit.take_pending();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for entity in &pending {
            if let Err(err) = insert_entity(&mut *tx, entity).await {
                return Err(map_insert_error(err, entity));
            }
        }
        tx.commit().await?;

        let count = pending.len();
        unit.mark_committed(count);
        log::trace!("committed {} staged entities", count);
        Ok(count)
    }
}

async fn insert_entity(conn: &mut PgConnection, entity: &StagedEntity) -> Result<(), sqlx::Error> {
    match entity {
        StagedEntity::User(user) => {
            sqlx::query(
                r#"INSERT INTO users
                   (id, username, email, first_name, last_name, is_active, created_by, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(user.is_active)
            .bind(user.created_by)
            .bind(user.created_at)
            .execute(conn)
            .await?;
        }
        StagedEntity::Role(role) => {
            sqlx::query(
                r#"INSERT INTO roles (id, name, description, created_by, created_at)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(role.id)
            .bind(&role.name)
            .bind(&role.description)
            .bind(role.created_by)
            .bind(role.created_at)
            .execute(conn)
            .await?;
        }
        StagedEntity::Application(application) => {
            sqlx::query(
                r#"INSERT INTO applications
                   (id, name, description, url, status, created_by, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(application.id)
            .bind(&application.name)
            .bind(&application.description)
            .bind(&application.url)
            .bind(application.status)
            .bind(application.created_by)
            .bind(application.created_at)
            .execute(conn)
            .await?;
        }
        StagedEntity::UserApplication(assignment) => {
            sqlx::query(
                r#"INSERT INTO user_applications
                   (id, user_id, application_id, role_id, expires_at, assigned_by, assigned_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(assignment.id)
            .bind(assignment.user_id)
            .bind(assignment.application_id)
            .bind(assignment.role_id)
            .bind(assignment.expires_at)
            .bind(assignment.assigned_by)
            .bind(assignment.assigned_at)
            .execute(conn)
            .await?;
        }
    }
    Ok(())
}

/// Turn unique-index violations into conflicts naming the offending key.
fn map_insert_error(err: sqlx::Error, entity: &StagedEntity) -> StoreError {
    let constraint = match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            db.constraint().unwrap_or_default().to_string()
        }
        _ => return StoreError::Database(err),
    };

    let keys = entity.natural_keys();
    let description = keys
        .iter()
        .find(|(key, _)| {
            (constraint.contains("email") && key.contains(":email:"))
                || (constraint.contains("username") && key.contains(":username:"))
        })
        .or_else(|| keys.first())
        .map(|(_, description)| description.clone())
        .unwrap_or_else(|| entity.kind().to_string());

    StoreError::Conflict(description)
}

struct PgSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl StoreSession for PgSession {
    async fn resolve(
        &mut self,
        key: LookupKey,
        candidates: &[String],
    ) -> StoreResult<HashMap<String, Uuid>> {
        let wanted = normalize_candidates(candidates.iter().map(String::as_str));
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(String, Uuid)> = match key {
            LookupKey::ApplicationId => {
                let ids: Vec<Uuid> = wanted
                    .iter()
                    .filter_map(|value| Uuid::parse_str(value).ok())
                    .collect();
                if ids.is_empty() {
                    return Ok(HashMap::new());
                }
                sqlx::query_as("SELECT id::text, id FROM applications WHERE id = ANY($1)")
                    .bind(&ids)
                    .fetch_all(&mut *self.conn)
                    .await?
            }
            _ => {
                let sql = match key {
                    LookupKey::Username => {
                        "SELECT lower(username), id FROM users WHERE lower(username) = ANY($1)"
                    }
                    LookupKey::UserEmail => {
                        "SELECT lower(email), id FROM users WHERE lower(email) = ANY($1)"
                    }
                    LookupKey::RoleName => {
                        "SELECT lower(name), id FROM roles WHERE lower(name) = ANY($1)"
                    }
                    _ => "SELECT lower(name), id FROM applications WHERE lower(name) = ANY($1)",
                };
                sqlx::query_as(sql)
                    .bind(&wanted)
                    .fetch_all(&mut *self.conn)
                    .await?
            }
        };

        Ok(rows.into_iter().collect())
    }

    async fn existing_assignments(
        &mut self,
        pairs: &[(Uuid, Uuid)],
    ) -> StoreResult<HashSet<(Uuid, Uuid)>> {
        if pairs.is_empty() {
            return Ok(HashSet::new());
        }

        let (user_ids, application_ids): (Vec<Uuid>, Vec<Uuid>) = pairs.iter().copied().unzip();
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"SELECT ua.user_id, ua.application_id
               FROM user_applications ua
               JOIN UNNEST($1::uuid[], $2::uuid[]) AS t(user_id, application_id)
                 ON ua.user_id = t.user_id AND ua.application_id = t.application_id"#,
        )
        .bind(&user_ids)
        .bind(&application_ids)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows.into_iter().collect())
    }
}
