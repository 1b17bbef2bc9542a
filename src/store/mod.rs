//! Persisted-store access for the import pipeline.
//!
//! Reads and writes go through two different handles:
//!
//! - **[`StoreSession`]**: a short-lived read scope. Validation opens one per
//!   sequential/batch run and one per parallel worker; sessions are never shared
//!   between tasks.
//! - **[`UnitOfWork`]**: staged, fully constructed entities waiting for a commit.
//!   One unit of work lives for a whole import run and is drained by
//!   [`Store::commit`], so commits are naturally serialized.
//!
//! Entities are staged as a closed [`StagedEntity`] enum, which lets each store
//! implementation issue entity-specific inserts without any runtime type lookup.
//!
//! Two stores are provided: [`MemoryStore`] for embedding and tests, and
//! [`PgStore`] backed by PostgreSQL.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{Application, Role, User, UserApplication};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0} conflicts with an existing record")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Natural keys a session can resolve to entity ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKey {
    Username,
    UserEmail,
    RoleName,
    ApplicationName,
    ApplicationId,
}

/// Short-lived read scope over the store.
#[async_trait]
pub trait StoreSession: Send {
    /// Resolve candidate keys to ids.
    ///
    /// Matching is case-insensitive; the returned map is keyed by the
    /// lower-cased candidate and only contains candidates that exist.
    async fn resolve(
        &mut self,
        key: LookupKey,
        candidates: &[String],
    ) -> StoreResult<HashMap<String, Uuid>>;

    /// Return the `(user_id, application_id)` pairs that are already assigned.
    async fn existing_assignments(
        &mut self,
        pairs: &[(Uuid, Uuid)],
    ) -> StoreResult<HashSet<(Uuid, Uuid)>>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a fresh read session.
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>>;

    /// Persist every pending entity of `unit` atomically and return how many
    /// were written. The unit's pending list is drained whether or not the
    /// commit succeeds.
    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize>;
}

/// A fully constructed entity waiting to be committed.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedEntity {
    User(User),
    Role(Role),
    Application(Application),
    UserApplication(UserApplication),
}

impl StagedEntity {
    /// Uniqueness keys as `(key, human description)` pairs.
    pub fn natural_keys(&self) -> Vec<(String, String)> {
        match self {
            StagedEntity::User(user) => vec![
                (
                    format!("user:username:{}", user.username.to_lowercase()),
                    format!("Username '{}'", user.username),
                ),
                (
                    format!("user:email:{}", user.email.to_lowercase()),
                    format!("Email '{}'", user.email),
                ),
            ],
            StagedEntity::Role(role) => vec![(
                format!("role:name:{}", role.name.to_lowercase()),
                format!("Role '{}'", role.name),
            )],
            StagedEntity::Application(application) => vec![
                (
                    format!("application:name:{}", application.name.to_lowercase()),
                    format!("Application '{}'", application.name),
                ),
                (
                    format!("application:id:{}", application.id),
                    format!("Application id '{}'", application.id),
                ),
            ],
            StagedEntity::UserApplication(assignment) => vec![(
                format!(
                    "assignment:{}:{}",
                    assignment.user_id, assignment.application_id
                ),
                format!(
                    "Assignment of user {} to application {}",
                    assignment.user_id, assignment.application_id
                ),
            )],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StagedEntity::User(_) => "user",
            StagedEntity::Role(_) => "role",
            StagedEntity::Application(_) => "application",
            StagedEntity::UserApplication(_) => "user_application",
        }
    }
}

/// Staged entities for one import run.
///
/// The unit remembers every natural key staged during the run, including keys
/// of entities that were already committed, so a later row carrying the same
/// key is refused at construction time.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    pending: Vec<(usize, StagedEntity)>,
    seen: HashSet<String>,
    committed: usize,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an entity built from `row_number`.
    ///
    /// Fails with a user-facing message when one of the entity's natural keys
    /// was already staged in this run; nothing is staged in that case.
    pub fn stage(&mut self, row_number: usize, entity: StagedEntity) -> Result<(), String> {
        let keys = entity.natural_keys();
        if let Some((_, description)) = keys.iter().find(|(key, _)| self.seen.contains(key)) {
            return Err(format!("{description} appears more than once in this import"));
        }

        self.seen.extend(keys.into_iter().map(|(key, _)| key));
        self.pending.push((row_number, entity));
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &StagedEntity> {
        self.pending.iter().map(|(_, entity)| entity)
    }

    /// Row numbers of the pending entities, in staging order.
    pub fn pending_rows(&self) -> Vec<usize> {
        self.pending.iter().map(|(row, _)| *row).collect()
    }

    /// Natural keys of the pending entities.
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending
            .iter()
            .flat_map(|(_, entity)| entity.natural_keys())
            .map(|(key, _)| key)
            .collect()
    }

    /// Forget `keys` so later rows may stage them again. Used when a commit
    /// carrying them was rejected and nothing was written.
    pub fn forget(&mut self, keys: &[String]) {
        for key in keys {
            self.seen.remove(key);
        }
    }

    /// Hand the pending entities to a store. Only stores call this.
    pub fn take_pending(&mut self) -> Vec<StagedEntity> {
        self.pending.drain(..).map(|(_, entity)| entity).collect()
    }

    /// Record a successful commit of `count` entities.
    pub fn mark_committed(&mut self, count: usize) {
        self.committed += count;
    }

    /// Entities committed through this unit so far.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Drop everything pending and forget its keys.
    pub fn discard(&mut self) {
        let keys = self.pending_keys();
        self.forget(&keys);
        self.pending.clear();
    }
}

/// Lower-cased, de-duplicated, non-blank candidates.
pub(crate) fn normalize_candidates<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty() && seen.insert(value.clone()))
        .collect()
}
