use super::checks;
use super::{
    ColumnSpec, ColumnType, RowIssues, RowValidationResult, SaveOutcome, TableDescriptor,
    TableMapper, TableType, ensure_active,
};
use crate::dataset::Row;
use crate::error::ImportResult;
use crate::models::UserApplication;
use crate::store::{LookupKey, StagedEntity, StoreSession, UnitOfWork};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const USERNAME: ColumnSpec =
    ColumnSpec::required("Username", ColumnType::Text, "Existing user to grant access to")
        .with_max_length(50);
const APPLICATION_NAME: ColumnSpec =
    ColumnSpec::required("ApplicationName", ColumnType::Text, "Existing application")
        .with_max_length(100);
const ROLE_NAME: ColumnSpec =
    ColumnSpec::optional("RoleName", ColumnType::Text, "Existing role granted in the application")
        .with_max_length(100);
const EXPIRES_AT: ColumnSpec = ColumnSpec::optional(
    "ExpiresAt",
    ColumnType::Timestamp,
    "When access lapses; never when blank",
);

/// Assigns existing users to existing applications, optionally with a role.
pub struct UserApplicationMapper {
    descriptor: TableDescriptor,
}

impl UserApplicationMapper {
    pub fn new() -> Self {
        Self {
            descriptor: TableDescriptor {
                table_type: TableType::UserApplications,
                columns: vec![USERNAME, APPLICATION_NAME, ROLE_NAME, EXPIRES_AT],
                example_rows: vec![
                    vec!["jdoe", "Payroll", "Administrator", "2030-12-31T00:00:00Z"],
                    vec!["asmith", "Wiki", "Auditor", ""],
                ],
            },
        }
    }
}

impl Default for UserApplicationMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve one name through the session.
async fn lookup(
    session: &mut dyn StoreSession,
    key: LookupKey,
    value: &str,
) -> ImportResult<Option<Uuid>> {
    let found = session.resolve(key, &[value.to_string()]).await?;
    Ok(found.get(&value.to_lowercase()).copied())
}

#[async_trait]
impl TableMapper for UserApplicationMapper {
    fn table_type(&self) -> TableType {
        TableType::UserApplications
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
        let username = checks::required(&row, &USERNAME, &mut issues);
        let application = checks::required(&row, &APPLICATION_NAME, &mut issues);
        let role = checks::optional_bounded(&row, &ROLE_NAME, &mut issues);
        if let Some(expires_at) = row.optional(EXPIRES_AT.name) {
            if checks::parse_timestamp(expires_at).is_none() {
                issues.blocking(format!("ExpiresAt '{expires_at}' is not a valid timestamp"));
            }
        }

        let mut user_id = None;
        if let Some(username) = username {
            user_id = lookup(session, LookupKey::Username, username).await?;
            if user_id.is_none() {
                issues.blocking(format!("User '{username}' does not exist"));
            }
        }

        let mut application_id = None;
        if let Some(application) = application {
            application_id = lookup(session, LookupKey::ApplicationName, application).await?;
            if application_id.is_none() {
                issues.blocking(format!("Application '{application}' does not exist"));
            }
        }

        if let Some(role) = role {
            if lookup(session, LookupKey::RoleName, role).await?.is_none() {
                issues.blocking(format!("Role '{role}' does not exist"));
            }
        }

        if let (Some(user_id), Some(application_id)) = (user_id, application_id) {
            let existing = session
                .existing_assignments(&[(user_id, application_id)])
                .await?;
            if !existing.is_empty() {
                issues.blocking(format!(
                    "User '{}' is already assigned to application '{}'",
                    username.unwrap_or_default(),
                    application.unwrap_or_default()
                ));
            }
        }

        Ok(issues.finish())
    }

    async fn save_row(
        &self,
        row: Row<'_>,
        acting_user: Uuid,
        session: &mut dyn StoreSession,
        unit: &mut UnitOfWork,
        cancel: &CancellationToken,
    ) -> ImportResult<SaveOutcome> {
        ensure_active(cancel)?;

        let Some(username) = row.optional(USERNAME.name) else {
            return Ok(SaveOutcome::Rejected("Username is required".into()));
        };
        let Some(application) = row.optional(APPLICATION_NAME.name) else {
            return Ok(SaveOutcome::Rejected("ApplicationName is required".into()));
        };

        let Some(user_id) = lookup(session, LookupKey::Username, username).await? else {
            return Ok(SaveOutcome::Rejected(format!(
                "User '{username}' does not exist"
            )));
        };
        let Some(application_id) =
            lookup(session, LookupKey::ApplicationName, application).await?
        else {
            return Ok(SaveOutcome::Rejected(format!(
                "Application '{application}' does not exist"
            )));
        };
        let role_id = match row.optional(ROLE_NAME.name) {
            Some(role) => match lookup(session, LookupKey::RoleName, role).await? {
                Some(id) => Some(id),
                None => {
                    return Ok(SaveOutcome::Rejected(format!(
                        "Role '{role}' does not exist"
                    )));
                }
            },
            None => None,
        };

        let expires_at = match row.optional(EXPIRES_AT.name) {
            Some(value) => match checks::parse_timestamp(value) {
                Some(moment) => Some(moment),
                None => {
                    return Ok(SaveOutcome::Rejected(format!(
                        "ExpiresAt '{value}' is not a valid timestamp"
                    )));
                }
            },
            None => None,
        };

        let assignment = UserApplication {
            id: Uuid::new_v4(),
            user_id,
            application_id,
            role_id,
            expires_at,
            assigned_by: acting_user,
            assigned_at: Utc::now(),
        };

        Ok(
            match unit.stage(row.number(), StagedEntity::UserApplication(assignment)) {
                Ok(()) => SaveOutcome::Staged,
                Err(_) => SaveOutcome::Rejected(format!(
                    "User '{username}' is assigned to application '{application}' more than once in this import"
                )),
            },
        )
    }
}
