use super::checks;
use super::{
    BatchMapper, ColumnSpec, ColumnType, RowIssues, RowValidationResult, SaveOutcome,
    StagedBatch, TableDescriptor, TableMapper, TableType, ValidationResultMap, ensure_active,
    is_eligible,
};
use crate::dataset::{Dataset, Row};
use crate::error::ImportResult;
use crate::models::Role;
use crate::store::{LookupKey, StagedEntity, StoreSession, UnitOfWork};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NAME: ColumnSpec =
    ColumnSpec::required("Name", ColumnType::Text, "Unique role name").with_max_length(100);
const DESCRIPTION: ColumnSpec =
    ColumnSpec::optional("Description", ColumnType::Text, "What the role grants")
        .with_max_length(500);

pub struct RoleMapper {
    descriptor: TableDescriptor,
}

impl RoleMapper {
    pub fn new() -> Self {
        Self {
            descriptor: TableDescriptor {
                table_type: TableType::Roles,
                columns: vec![NAME, DESCRIPTION],
                example_rows: vec![
                    vec!["Administrator", "Full access to every application"],
                    vec!["Auditor", "Read-only access for compliance reviews"],
                ],
            },
        }
    }
}

impl Default for RoleMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn build_role(row: &Row<'_>, acting_user: Uuid) -> Result<Role, String> {
    let name = row
        .optional(NAME.name)
        .ok_or_else(|| format!("{} is required", NAME.name))?;

    Ok(Role {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: checks::stored_text(row, &DESCRIPTION),
        created_by: acting_user,
        created_at: Utc::now(),
    })
}

fn stage(row: &Row<'_>, acting_user: Uuid, unit: &mut UnitOfWork) -> Result<(), String> {
    let role = build_role(row, acting_user)?;
    unit.stage(row.number(), StagedEntity::Role(role))
}

#[async_trait]
impl TableMapper for RoleMapper {
    fn table_type(&self) -> TableType {
        TableType::Roles
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
        let name = checks::required(&row, &NAME, &mut issues);
        checks::optional_text(&row, &DESCRIPTION, &mut issues);

        if let Some(name) = name {
            let found = session
                .resolve(LookupKey::RoleName, &[name.to_string()])
                .await?;
            if found.contains_key(&name.to_lowercase()) {
                issues.blocking(format!("Role '{name}' already exists"));
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
impl BatchMapper for RoleMapper {
    async fn validate_batch(
        &self,
        dataset: &Dataset,
        session: &mut dyn StoreSession,
        cancel: &CancellationToken,
    ) -> ImportResult<ValidationResultMap> {
        ensure_active(cancel)?;

        let names: Vec<String> = dataset
            .rows()
            .map(|row| row.get(NAME.name).to_string())
            .collect();
        let existing = session.resolve(LookupKey::RoleName, &names).await?;

        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let mut results = ValidationResultMap::new();
        for row in dataset.rows() {
            let mut issues = RowIssues::new(row.number());
            let name = checks::required(&row, &NAME, &mut issues);
            checks::optional_text(&row, &DESCRIPTION, &mut issues);

            if let Some(name) = name {
                let key = name.to_lowercase();
                if existing.contains_key(&key) {
                    issues.blocking(format!("Role '{name}' already exists"));
                } else if let Some(first) = first_seen.get(&key) {
                    issues.blocking(format!("Role '{name}' is duplicated in row {first}"));
                } else {
                    first_seen.insert(key, row.number());
                }
            }

            results.insert(row.number(), issues.finish());
        }
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
