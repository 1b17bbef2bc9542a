use super::checks;
use super::{
    ColumnSpec, ColumnType, RowIssues, RowValidationResult, SaveOutcome, TableDescriptor,
    TableMapper, TableType, ensure_active,
};
use crate::dataset::Row;
use crate::error::ImportResult;
use crate::models::{Application, ApplicationStatus};
use crate::store::{LookupKey, StagedEntity, StoreSession, UnitOfWork};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ID: ColumnSpec = ColumnSpec::optional(
    "Id",
    ColumnType::Identifier,
    "Fixed identifier; generated when blank",
);
const NAME: ColumnSpec =
    ColumnSpec::required("Name", ColumnType::Text, "Unique application name").with_max_length(100);
const DESCRIPTION: ColumnSpec =
    ColumnSpec::optional("Description", ColumnType::Text, "Short summary").with_max_length(500);
const URL: ColumnSpec =
    ColumnSpec::optional("Url", ColumnType::Url, "Launch address").with_max_length(2048);
const STATUS: ColumnSpec = ColumnSpec::optional(
    "Status",
    ColumnType::Enumerated(ApplicationStatus::LABELS),
    "Lifecycle status",
)
.with_default("Active");

/// Imports applications one row at a time.
pub struct ApplicationMapper {
    descriptor: TableDescriptor,
}

impl ApplicationMapper {
    pub fn new() -> Self {
        Self {
            descriptor: TableDescriptor {
                table_type: TableType::Applications,
                columns: vec![ID, NAME, DESCRIPTION, URL, STATUS],
                example_rows: vec![
                    vec![
                        "",
                        "Payroll",
                        "Salary and payslip processing",
                        "https://payroll.example.com",
                        "Active",
                    ],
                    vec![
                        "3f2504e0-4f89-41d3-9a0c-0305e82c3301",
                        "Wiki",
                        "Internal knowledge base",
                        "https://wiki.example.com",
                        "Inactive",
                    ],
                ],
            },
        }
    }
}

impl Default for ApplicationMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn build_application(row: &Row<'_>, acting_user: Uuid) -> Result<Application, String> {
    let name = row
        .optional(NAME.name)
        .ok_or_else(|| format!("{} is required", NAME.name))?;
    let id = match row.optional(ID.name) {
        Some(value) => Uuid::parse_str(value)
            .map_err(|_| format!("Id '{value}' is not a valid identifier"))?,
        None => Uuid::new_v4(),
    };

    let url = checks::stored_text(row, &URL).filter(|url| checks::is_url(url));
    let status = row
        .optional(STATUS.name)
        .and_then(|value| value.parse::<ApplicationStatus>().ok())
        .unwrap_or_default();

    Ok(Application {
        id,
        name: name.to_string(),
        description: checks::stored_text(row, &DESCRIPTION),
        url,
        status,
        created_by: acting_user,
        created_at: Utc::now(),
    })
}

#[async_trait]
impl TableMapper for ApplicationMapper {
    fn table_type(&self) -> TableType {
        TableType::Applications
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

        let id = row.optional(ID.name).and_then(|value| match Uuid::parse_str(value) {
            Ok(id) => Some(id),
            Err(_) => {
                issues.blocking(format!("Id '{value}' is not a valid identifier"));
                None
            }
        });
        let name = checks::required(&row, &NAME, &mut issues);
        checks::optional_text(&row, &DESCRIPTION, &mut issues);

        if let Some(url) = checks::optional_text(&row, &URL, &mut issues) {
            if !checks::is_url(url) {
                issues.soft(format!("Url '{url}' is not a valid http(s) address"));
            }
        }
        if let Some(status) = row.optional(STATUS.name) {
            if status.parse::<ApplicationStatus>().is_err() {
                issues.soft(format!(
                    "Status '{status}' must be one of {}",
                    ApplicationStatus::LABELS.join(", ")
                ));
            }
        }

        if let Some(name) = name {
            let found = session
                .resolve(LookupKey::ApplicationName, &[name.to_string()])
                .await?;
            if found.contains_key(&name.to_lowercase()) {
                issues.blocking(format!("Application '{name}' already exists"));
            }
        }
        if let Some(id) = id {
            let found = session
                .resolve(LookupKey::ApplicationId, &[id.to_string()])
                .await?;
            if !found.is_empty() {
                issues.blocking(format!("Application id '{id}' already exists"));
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

        let staged = build_application(&row, acting_user).and_then(|application| {
            unit.stage(row.number(), StagedEntity::Application(application))
        });
        Ok(match staged {
            Ok(()) => SaveOutcome::Staged,
            Err(reason) => SaveOutcome::Rejected(reason),
        })
    }
}
