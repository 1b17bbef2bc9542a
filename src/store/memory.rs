//! Process-local store.
//!
//! Keeps every table behind one `parking_lot::RwLock` so a commit is applied
//! atomically: either every pending entity lands or none does. Sessions are
//! cheap handles that take the read lock per query.

use super::{
    LookupKey, StagedEntity, Store, StoreError, StoreResult, StoreSession, UnitOfWork,
    normalize_candidates,
};
use crate::models::{Application, Role, User, UserApplication};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    roles: Vec<Role>,
    applications: Vec<Application>,
    assignments: Vec<UserApplication>,
    /// Natural keys of every stored entity.
    keys: HashSet<String>,
}

impl Tables {
    fn insert(&mut self, entity: StagedEntity) {
        for (key, _) in entity.natural_keys() {
            self.keys.insert(key);
        }
        match entity {
            StagedEntity::User(user) => self.users.push(user),
            StagedEntity::Role(role) => self.roles.push(role),
            StagedEntity::Application(application) => self.applications.push(application),
            StagedEntity::UserApplication(assignment) => self.assignments.push(assignment),
        }
    }

    fn resolve(&self, key: LookupKey, candidates: &[String]) -> HashMap<String, Uuid> {
        let wanted: HashSet<String> = normalize_candidates(candidates.iter().map(String::as_str))
            .into_iter()
            .collect();

        let entries: Vec<(String, Uuid)> = match key {
            LookupKey::Username => self
                .users
                .iter()
                .map(|user| (user.username.to_lowercase(), user.id))
                .collect(),
            LookupKey::UserEmail => self
                .users
                .iter()
                .map(|user| (user.email.to_lowercase(), user.id))
                .collect(),
            LookupKey::RoleName => self
                .roles
                .iter()
                .map(|role| (role.name.to_lowercase(), role.id))
                .collect(),
            LookupKey::ApplicationName => self
                .applications
                .iter()
                .map(|application| (application.name.to_lowercase(), application.id))
                .collect(),
            LookupKey::ApplicationId => self
                .applications
                .iter()
                .map(|application| (application.id.to_string(), application.id))
                .collect(),
        };

        entries
            .into_iter()
            .filter(|(value, _)| wanted.contains(value))
            .collect()
    }
}

/// In-memory [`Store`]; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    sessions_opened: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert entities directly, bypassing the import pipeline.
    pub fn seed(&self, entities: impl IntoIterator<Item = StagedEntity>) {
        let mut tables = self.tables.write();
        for entity in entities {
            tables.insert(entity);
        }
    }

    pub fn users(&self) -> Vec<User> {
        self.tables.read().users.clone()
    }

    pub fn roles(&self) -> Vec<Role> {
        self.tables.read().roles.clone()
    }

    pub fn applications(&self) -> Vec<Application> {
        self.tables.read().applications.clone()
    }

    pub fn assignments(&self) -> Vec<UserApplication> {
        self.tables.read().assignments.clone()
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of read sessions handed out so far.
    pub fn session_count(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Make the next commit fail as if the backing store went away.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            tables: Arc::clone(&self.tables),
        }))
    }

    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize> {
        let pending = unit.take_pending();
        if pending.is_empty() {
            return Ok(0);
        }

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store commit refused".into()));
        }

        let mut tables = self.tables.write();
        for entity in &pending {
            if let Some((_, description)) = entity
                .natural_keys()
                .into_iter()
                .find(|(key, _)| tables.keys.contains(key))
            {
                return Err(StoreError::Conflict(description));
            }
        }

        let count = pending.len();
        for entity in pending {
            tables.insert(entity);
        }
        drop(tables);

        self.commits.fetch_add(1, Ordering::SeqCst);
        unit.mark_committed(count);
        log::trace!("memory store: committed {} entities", count);
        Ok(count)
    }
}

struct MemorySession {
    tables: Arc<RwLock<Tables>>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn resolve(
        &mut self,
        key: LookupKey,
        candidates: &[String],
    ) -> StoreResult<HashMap<String, Uuid>> {
        Ok(self.tables.read().resolve(key, candidates))
    }

    async fn existing_assignments(
        &mut self,
        pairs: &[(Uuid, Uuid)],
    ) -> StoreResult<HashSet<(Uuid, Uuid)>> {
        let wanted: HashSet<(Uuid, Uuid)> = pairs.iter().copied().collect();
        Ok(self
            .tables
            .read()
            .assignments
            .iter()
            .map(|assignment| (assignment.user_id, assignment.application_id))
            .filter(|pair| wanted.contains(pair))
            .collect())
    }
}
