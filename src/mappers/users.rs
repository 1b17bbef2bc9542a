use super::checks;
use super::{
    BatchMapper, ColumnSpec, ColumnType, RowIssues, RowValidationResult, SaveOutcome,
    StagedBatch, TableDescriptor, TableMapper, TableType, ValidationResultMap, ensure_active,
    is_eligible,
};
use crate::dataset::{Dataset, Row};
use crate::error::ImportResult;
use crate::models::User;
use crate::store::{LookupKey, StagedEntity, StoreSession, UnitOfWork};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const USERNAME: ColumnSpec =
    ColumnSpec::required("Username", ColumnType::Text, "Unique login name").with_max_length(50);
const EMAIL: ColumnSpec =
    ColumnSpec::required("Email", ColumnType::Email, "Unique email address").with_max_length(255);
const FIRST_NAME: ColumnSpec =
    ColumnSpec::optional("FirstName", ColumnType::Text, "Given name").with_max_length(100);
const LAST_NAME: ColumnSpec =
    ColumnSpec::optional("LastName", ColumnType::Text, "Family name").with_max_length(100);
const IS_ACTIVE: ColumnSpec =
    ColumnSpec::optional("IsActive", ColumnType::Boolean, "Whether the account can sign in")
        .with_default("true");

/// Imports user accounts. Username and email are unique, case-insensitively.
pub struct UserMapper {
    descriptor: TableDescriptor,
}

impl UserMapper {
    pub fn new() -> Self {
        Self {
            descriptor: TableDescriptor {
                table_type: TableType::Users,
                columns: vec![USERNAME, EMAIL, FIRST_NAME, LAST_NAME, IS_ACTIVE],
                example_rows: vec![
                    vec!["jdoe", "jdoe@example.com", "John", "Doe", "true"],
                    vec!["asmith", "asmith@example.com", "Alice", "Smith", "false"],
                ],
            },
        }
    }
}

impl Default for UserMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Format checks that need no store access. Returns the natural keys that
/// are well-formed enough to look up.
fn check_fields<'a>(row: &Row<'a>, issues: &mut RowIssues) -> (Option<&'a str>, Option<&'a str>) {
    let mut username = checks::required(row, &USERNAME, issues);
    if let Some(value) = username {
        if !checks::is_username(value) {
            issues.blocking(format!(
                "Username '{value}' may only contain letters, digits, '.', '_' and '-'"
            ));
            username = None;
        }
    }

    let mut email = checks::required(row, &EMAIL, issues);
    if let Some(value) = email {
        if !checks::is_email(value) {
            issues.blocking(format!("Email '{value}' is not a valid email address"));
            email = None;
        }
    }

    checks::optional_text(row, &FIRST_NAME, issues);
    checks::optional_text(row, &LAST_NAME, issues);
    checks::check_bool(row, &IS_ACTIVE, issues);

    (username, email)
}

fn build_user(row: &Row<'_>, acting_user: Uuid) -> Result<User, String> {
    let username = row
        .optional(USERNAME.name)
        .ok_or_else(|| format!("{} is required", USERNAME.name))?;
    let email = row
        .optional(EMAIL.name)
        .ok_or_else(|| format!("{} is required", EMAIL.name))?;

    Ok(User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: email.to_string(),
        first_name: checks::stored_text(row, &FIRST_NAME),
        last_name: checks::stored_text(row, &LAST_NAME),
        is_active: checks::stored_bool(row, &IS_ACTIVE, true),
        created_by: acting_user,
        created_at: Utc::now(),
    })
}

fn stage(row: &Row<'_>, acting_user: Uuid, unit: &mut UnitOfWork) -> Result<(), String> {
    let user = build_user(row, acting_user)?;
    unit.stage(row.number(), StagedEntity::User(user))
}

#[async_trait]
impl TableMapper for UserMapper {
    fn table_type(&self) -> TableType {
        TableType::Users
    }

    fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    async fn validate_row(
        &self,
        row: Row<'_>,
        session: &mut dyn StoreSession,
        cancel: &CancellationToken,
    ) -> ImportResult<RowValidationResult> {
        ensure_active(cancel)?;

        let mut issues = RowIssues::new(row.number());
        let (username, email) = check_fields(&row, &mut issues);

        if let Some(username) = username {
            let found = session
                .resolve(LookupKey::Username, &[username.to_string()])
                .await?;
            if found.contains_key(&username.to_lowercase()) {
                issues.blocking(format!("Username '{username}' already exists"));
            }
        }

        if let Some(email) = email {
            let found = session
                .resolve(LookupKey::UserEmail, &[email.to_string()])
                .await?;
            if found.contains_key(&email.to_lowercase()) {
                issues.blocking(format!("Email '{email}' already exists"));
            }
        }

        Ok(issues.finish())
    }

    async fn save_row(
        &self,
        row: Row<'_>,
        acting_user: Uuid,
        _session: &mut dyn StoreSession,
        unit: &mut UnitOfWork,
        cancel: &CancellationToken,
    ) -> ImportResult<SaveOutcome> {
        ensure_active(cancel)?;
        Ok(match stage(&row, acting_user, unit) {
            Ok(()) => SaveOutcome::Staged,
            Err(reason) => SaveOutcome::Rejected(reason),
        })
    }

    fn as_batch(&self) -> Option<&dyn BatchMapper> {
        Some(self)
    }
}

#[async_trait]
impl BatchMapper for UserMapper {
    async fn validate_batch(
        &self,
        dataset: &Dataset,
        session: &mut dyn StoreSession,
        cancel: &CancellationToken,
    ) -> ImportResult<ValidationResultMap> {
        ensure_active(cancel)?;

        let usernames: Vec<String> = dataset
            .rows()
            .map(|row| row.get(USERNAME.name).to_string())
            .collect();
        let emails: Vec<String> = dataset
            .rows()
            .map(|row| row.get(EMAIL.name).to_string())
            .collect();
        let existing_usernames = session.resolve(LookupKey::Username, &usernames).await?;
        let existing_emails = session.resolve(LookupKey::UserEmail, &emails).await?;

        let mut first_username: HashMap<String, usize> = HashMap::new();
        let mut first_email: HashMap<String, usize> = HashMap::new();
        let mut results = ValidationResultMap::new();

        for row in dataset.rows() {
            let mut issues = RowIssues::new(row.number());
            let (username, email) = check_fields(&row, &mut issues);

            if let Some(username) = username {
                let key = username.to_lowercase();
                if existing_usernames.contains_key(&key) {
                    issues.blocking(format!("Username '{username}' already exists"));
                } else if let Some(first) = first_username.get(&key) {
                    issues.blocking(format!("Username '{username}' is duplicated in row {first}"));
                } else {
                    first_username.insert(key, row.number());
                }
            }

            if let Some(email) = email {
                let key = email.to_lowercase();
                if existing_emails.contains_key(&key) {
                    issues.blocking(format!("Email '{email}' already exists"));
                } else if let Some(first) = first_email.get(&key) {
                    issues.blocking(format!("Email '{email}' is duplicated in row {first}"));
                } else {
                    first_email.insert(key, row.number());
                }
            }

            results.insert(row.number(), issues.finish());
        }

        log::debug!(
            "validated {} user rows with {} lookups",
            results.len(),
            existing_usernames.len() + existing_emails.len()
        );
        Ok(results)
    }

    async fn save_batch(
        &self,
        dataset: &Dataset,
        acting_user: Uuid,
        results: &ValidationResultMap,
        ignore_errors: bool,
        unit: &mut UnitOfWork,
        cancel: &CancellationToken,
    ) -> ImportResult<StagedBatch> {
        ensure_active(cancel)?;

        let mut batch = StagedBatch::default();
        for row in dataset.rows() {
            let eligible = results
                .get(&row.number())
                .is_some_and(|result| is_eligible(result, ignore_errors));
            if !eligible {
                continue;
            }

            match stage(&row, acting_user, unit) {
                Ok(()) => batch.staged += 1,
                Err(reason) => {
                    batch.rejected.insert(row.number(), reason);
                }
            }
        }
        Ok(batch)
    }
}
