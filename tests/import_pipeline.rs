use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use identity_import::history::UploadEvent;
use identity_import::import::{ValidationOrchestrator, ValidationStrategy};
use identity_import::mappers::BatchMapper;
use identity_import::models::{Application, ApplicationStatus, User};
use identity_import::store::{LookupKey, StagedEntity, StoreResult, StoreSession, UnitOfWork};
use identity_import::{
    BulkImportService, CommitStrategy, Dataset, ImportConfig, ImportError, ImportOptions,
    ImportRequest, ImportStatus, MapperRegistry, MemoryStore, RecordingUploadHistory, Store,
    StoreError, TableMapper, TableType, UploadedFile, ValidationMode,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn config() -> ImportConfig {
    ImportConfig {
        row_commit_threshold: 1000,
        min_batch_size: 1,
        max_batch_size: 500,
        memory_budget_bytes: 64 * 1024 * 1024,
        max_validation_workers: 4,
        parallel_threshold: 500,
        max_file_bytes: 1024 * 1024,
    }
}

fn service(store: &MemoryStore) -> BulkImportService {
    BulkImportService::new(Arc::new(store.clone()), config())
}

fn options(ignore_errors: bool) -> ImportOptions {
    ImportOptions {
        ignore_errors,
        ..ImportOptions::default()
    }
}

fn user(username: &str, email: &str) -> StagedEntity {
    StagedEntity::User(User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: email.to_string(),
        first_name: None,
        last_name: None,
        is_active: true,
        created_by: Uuid::nil(),
        created_at: Utc::now(),
    })
}

fn application(name: &str) -> StagedEntity {
    StagedEntity::Application(Application {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: None,
        url: None,
        status: ApplicationStatus::Active,
        created_by: Uuid::nil(),
        created_at: Utc::now(),
    })
}

fn three_users() -> Dataset {
    Dataset::from_rows(
        ["Username", "Email", "FirstName", "LastName", "IsActive"],
        [
            vec!["jdoe", "jdoe@example.com", "John", "Doe", "true"],
            vec!["asmith", "asmith@example.com", "Alice", "Smith", "true"],
            vec!["bwayne", "bwayne@example.com", "Bruce", "Wayne", "false"],
        ],
    )
}

#[tokio::test]
async fn existing_username_fails_the_run_unless_errors_are_ignored() {
    let store = MemoryStore::new();
    store.seed([user("asmith", "alice@elsewhere.com")]);
    let cancel = CancellationToken::new();

    let strict = service(&store)
        .import_dataset(
            "users.csv",
            TableType::Users,
            three_users(),
            Uuid::nil(),
            &options(false),
            &cancel,
        )
        .await
        .expect("run completes");

    assert_eq!(strict.status, ImportStatus::Failed);
    assert_eq!(strict.total_rows, 3);
    assert_eq!(strict.valid_rows, 2);
    assert_eq!(strict.invalid_rows, 1);
    assert_eq!(strict.processed_rows, 0);
    assert_eq!(strict.succeeded_rows, 0);
    assert_eq!(strict.strategy, None);
    assert_eq!(strict.errors.len(), 1);
    assert_eq!(strict.errors[0].row_number, 2);
    assert_eq!(strict.errors[0].messages, vec!["Username 'asmith' already exists"]);
    assert_eq!(store.users().len(), 1);

    let lenient = service(&store)
        .import_dataset(
            "users.csv",
            TableType::Users,
            three_users(),
            Uuid::nil(),
            &options(true),
            &cancel,
        )
        .await
        .expect("run completes");

    assert_eq!(lenient.status, ImportStatus::CompletedWithErrors);
    assert_eq!(lenient.strategy, Some(CommitStrategy::SingleBatch));
    assert_eq!(lenient.processed_rows, 3);
    assert_eq!(lenient.succeeded_rows, 2);
    assert_eq!(lenient.failed_rows, 1);
    assert_eq!(store.users().len(), 3);
    assert_eq!(store.commit_count(), 1);
}

#[tokio::test]
async fn validation_strategies_agree() {
    let store = MemoryStore::new();
    store.seed([user("taken", "taken@example.com")]);
    let dataset = Arc::new(Dataset::from_rows(
        ["Username", "Email", "IsActive"],
        [
            vec!["alpha", "alpha@example.com", "yes"],
            vec!["", "blank@example.com", ""],
            vec!["TAKEN", "new@example.com", ""],
            vec!["gamma", "not-an-email", ""],
            vec!["delta", "delta@example.com", "perhaps"],
            vec!["bad name", "bad@example.com", ""],
            vec!["omega", "TAKEN@example.com", "0"],
        ],
    ));
    let mapper = MapperRegistry::new().get(TableType::Users);
    let orchestrator = ValidationOrchestrator::new(Arc::new(store), config());
    let cancel = CancellationToken::new();

    let mut reports = Vec::new();
    for mode in [
        ValidationMode::Sequential,
        ValidationMode::Batch,
        ValidationMode::Parallel,
    ] {
        reports.push(
            orchestrator
                .validate(Arc::clone(&mapper), Arc::clone(&dataset), mode, &cancel)
                .await
                .expect("validation runs"),
        );
    }

    assert_eq!(reports[1].strategy, ValidationStrategy::Batch);
    for report in &reports {
        let keys: Vec<usize> = report.results.keys().copied().collect();
        assert_eq!(keys, (1..=7).collect::<Vec<_>>());
        let validity: Vec<bool> = report.results.values().map(|r| r.is_valid()).collect();
        assert_eq!(validity, vec![true, false, false, false, false, false, false]);
        assert_eq!(report.results, reports[0].results);
    }
}

#[tokio::test]
async fn within_batch_duplicates_differing_in_case_are_flagged() {
    let store = MemoryStore::new();
    let mapper = MapperRegistry::new().get(TableType::Users);
    let batch = mapper.as_batch().expect("users validate in batch");
    let dataset = Dataset::from_rows(
        ["Username", "Email"],
        [
            vec!["JDoe", "john@example.com"],
            vec!["jdoe", "other@example.com"],
        ],
    );

    let mut session = store.session().await.expect("session");
    let results = batch
        .validate_batch(&dataset, session.as_mut(), &CancellationToken::new())
        .await
        .expect("validates");

    assert!(results[&1].is_valid());
    assert_eq!(
        results[&2].errors(),
        ["Username 'jdoe' is duplicated in row 1"]
    );
    assert!(results[&2].is_blocking());
}

#[tokio::test]
async fn ignore_errors_skips_exactly_the_rows_missing_required_fields() {
    let store = MemoryStore::new();
    let rows: Vec<Vec<String>> = (1..=10)
        .map(|n| {
            let name = if n % 4 == 0 { String::new() } else { format!("Role {n}") };
            vec![name, format!("description {n}")]
        })
        .collect();
    let dataset = Dataset::from_rows(["Name", "Description"], rows);

    let outcome = service(&store)
        .import_dataset(
            "roles.csv",
            TableType::Roles,
            dataset,
            Uuid::nil(),
            &options(true),
            &CancellationToken::new(),
        )
        .await
        .expect("run completes");

    assert_eq!(outcome.invalid_rows, 2);
    assert_eq!(outcome.succeeded_rows, 8);
    assert_eq!(outcome.failed_rows, 2);
    let stored: Vec<String> = store.roles().into_iter().map(|role| role.name).collect();
    assert_eq!(stored.len(), 8);
    assert!(!stored.iter().any(|name| name.is_empty()));
    let failed_rows: Vec<usize> = outcome.errors.iter().map(|e| e.row_number).collect();
    assert_eq!(failed_rows, vec![4, 8]);
}

#[tokio::test]
async fn soft_errors_are_repaired_when_ignored() {
    let store = MemoryStore::new();
    let dataset = Dataset::from_rows(
        ["Name", "Url", "Status"],
        [vec!["Portal", "ftp://portal", "retired"]],
    );

    let outcome = service(&store)
        .import_dataset(
            "applications.csv",
            TableType::Applications,
            dataset,
            Uuid::nil(),
            &options(true),
            &CancellationToken::new(),
        )
        .await
        .expect("run completes");

    assert_eq!(outcome.invalid_rows, 1);
    assert_eq!(outcome.succeeded_rows, 1);
    assert_eq!(outcome.status, ImportStatus::CompletedWithErrors);
    let stored = store.applications();
    assert_eq!(stored[0].url, None);
    assert_eq!(stored[0].status.label(), "Active");
}

#[tokio::test]
async fn example_rows_import_cleanly() {
    let store = MemoryStore::new();
    let service = service(&store);
    let registry = MapperRegistry::new();
    let cancel = CancellationToken::new();

    for table_type in [
        TableType::Users,
        TableType::Roles,
        TableType::Applications,
        TableType::UserApplications,
    ] {
        let examples = registry.get(table_type).descriptor().example_dataset();
        let outcome = service
            .import_dataset(
                "examples",
                table_type,
                examples,
                Uuid::nil(),
                &options(false),
                &cancel,
            )
            .await
            .expect("run completes");
        assert_eq!(outcome.status, ImportStatus::Completed, "{table_type}: {outcome:?}");
        assert_eq!(outcome.succeeded_rows, 2);
    }

    let assignments = store.assignments();
    assert_eq!(assignments.len(), 2);
    assert!(assignments.iter().all(|a| a.role_id.is_some()));
    assert_eq!(
        assignments.iter().filter(|a| a.expires_at.is_some()).count(),
        1
    );
}

#[tokio::test]
async fn row_only_mapper_rejects_repeated_key_within_run() {
    let store = MemoryStore::new();
    let dataset = Dataset::from_rows(["Name"], [vec!["Portal"], vec!["PORTAL"], vec!["Docs"]]);

    let outcome = service(&store)
        .import_dataset(
            "applications.csv",
            TableType::Applications,
            dataset,
            Uuid::nil(),
            &options(false),
            &CancellationToken::new(),
        )
        .await
        .expect("run completes");

    assert_eq!(outcome.strategy, Some(CommitStrategy::PerRow));
    assert_eq!(outcome.invalid_rows, 0);
    assert_eq!(outcome.processed_rows, 3);
    assert_eq!(outcome.succeeded_rows, 2);
    assert_eq!(outcome.failed_rows, 1);
    assert_eq!(outcome.status, ImportStatus::CompletedWithErrors);
    assert_eq!(outcome.errors[0].row_number, 2);
    assert_eq!(
        outcome.errors[0].messages,
        vec!["Application 'PORTAL' appears more than once in this import"]
    );
    assert_eq!(store.commit_count(), 2);
}

#[tokio::test]
async fn large_row_only_imports_commit_in_chunks() {
    let store = MemoryStore::new();
    let service = BulkImportService::new(
        Arc::new(store.clone()),
        ImportConfig {
            row_commit_threshold: 2,
            ..config()
        },
    );
    let rows: Vec<Vec<String>> = (1..=5).map(|n| vec![format!("App {n}")]).collect();

    let outcome = service
        .import_dataset(
            "applications.json",
            TableType::Applications,
            Dataset::from_rows(["Name"], rows),
            Uuid::nil(),
            &ImportOptions {
                batch_size: Some(2),
                ..ImportOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("run completes");

    assert_eq!(
        outcome.strategy,
        Some(CommitStrategy::ChunkedRows { batch_size: 2 })
    );
    assert_eq!(outcome.succeeded_rows, 5);
    assert_eq!(outcome.status, ImportStatus::Completed);
    assert_eq!(store.commit_count(), 3);
}

#[tokio::test]
async fn cancelled_before_start_persists_nothing() {
    let store = MemoryStore::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = service(&store)
        .import_dataset(
            "users.csv",
            TableType::Users,
            three_users(),
            Uuid::nil(),
            &options(false),
            &cancel,
        )
        .await
        .expect("cancellation is reported, not raised");

    assert_eq!(outcome.status, ImportStatus::Cancelled);
    assert_eq!(outcome.processed_rows, 0);
    assert!(store.users().is_empty());
}

/// Cancels the run's token after the first successful commit.
struct CancelAfterCommit {
    inner: MemoryStore,
    cancel: CancellationToken,
}

#[async_trait]
impl Store for CancelAfterCommit {
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>> {
        self.inner.session().await
    }

    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize> {
        let written = self.inner.commit(unit).await?;
        self.cancel.cancel();
        Ok(written)
    }
}

#[tokio::test]
async fn cancellation_keeps_committed_rows() {
    let store = MemoryStore::new();
    let cancel = CancellationToken::new();
    let service = BulkImportService::new(
        Arc::new(CancelAfterCommit {
            inner: store.clone(),
            cancel: cancel.clone(),
        }),
        config(),
    );
    let dataset = Dataset::from_rows(["Name"], [vec!["One"], vec!["Two"], vec!["Three"]]);

    let outcome = service
        .import_dataset(
            "applications.csv",
            TableType::Applications,
            dataset,
            Uuid::nil(),
            &options(false),
            &cancel,
        )
        .await
        .expect("cancellation is reported, not raised");

    assert_eq!(outcome.status, ImportStatus::Cancelled);
    assert_eq!(outcome.processed_rows, 1);
    assert_eq!(outcome.succeeded_rows, 1);
    assert_eq!(store.applications().len(), 1);
    assert_eq!(store.applications()[0].name, "One");
}

#[tokio::test]
async fn commit_failure_is_recorded_before_propagating() {
    let store = MemoryStore::new();
    store.fail_next_commit();
    let history = Arc::new(RecordingUploadHistory::new());
    let service = service(&store).with_history(history.clone());

    let err = service
        .import_dataset(
            "users.csv",
            TableType::Users,
            three_users(),
            Uuid::nil(),
            &options(false),
            &CancellationToken::new(),
        )
        .await
        .expect_err("store outage ends the run");

    assert!(matches!(err, ImportError::Store(StoreError::Unavailable(_))));
    assert!(store.users().is_empty());

    let events = history.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], UploadEvent::Started { .. }));
    assert!(matches!(
        &events[1],
        UploadEvent::Failed { processed_rows: Some(3), file_name, .. } if file_name == "users.csv"
    ));
}

#[tokio::test]
async fn unparseable_files_do_not_stop_siblings() {
    let store = MemoryStore::new();
    let history = Arc::new(RecordingUploadHistory::new());
    let service = service(&store).with_history(history.clone());
    let request = ImportRequest {
        files: vec![
            UploadedFile::new("broken.json", b"[{\"Name\": ".to_vec()),
            UploadedFile::new("roles.csv", b"Name,Description\nAuditor,Reads logs\n".to_vec()),
            UploadedFile::new("roles.txt", b"Name\nViewer\n".to_vec()),
        ],
        table_type: TableType::Roles,
        acting_user: Uuid::nil(),
        options: ImportOptions::default(),
    };

    let report = service
        .import_files(&request, &CancellationToken::new())
        .await
        .expect("request completes");

    let statuses: Vec<ImportStatus> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![ImportStatus::Failed, ImportStatus::Completed, ImportStatus::Failed]
    );
    assert!(report.outcomes[0].message.starts_with("failed to parse 'broken.json'"));
    assert!(report.has_failures());
    assert_eq!(report.succeeded_rows(), 1);
    assert_eq!(store.roles()[0].name, "Auditor");

    let completed = history
        .events()
        .into_iter()
        .filter(|event| matches!(event, UploadEvent::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn assignments_report_unknown_references() {
    let store = MemoryStore::new();
    store.seed([user("jdoe", "jdoe@example.com")]);
    let dataset = Dataset::from_rows(
        ["Username", "ApplicationName", "RoleName", "ExpiresAt"],
        [vec!["jdoe", "Nowhere", "Ghost", "someday"]],
    );

    let outcome = service(&store)
        .import_dataset(
            "assignments.csv",
            TableType::UserApplications,
            dataset,
            Uuid::nil(),
            &options(true),
            &CancellationToken::new(),
        )
        .await
        .expect("run completes");

    assert_eq!(outcome.status, ImportStatus::Failed);
    assert_eq!(outcome.processed_rows, 1);
    assert_eq!(outcome.failed_rows, 1);
    assert_eq!(
        outcome.errors[0].messages,
        vec![
            "ExpiresAt 'someday' is not a valid timestamp",
            "Application 'Nowhere' does not exist",
            "Role 'Ghost' does not exist",
        ]
    );
    assert!(store.assignments().is_empty());
}

#[tokio::test]
async fn zero_worker_config_still_imports() {
    let store = MemoryStore::new();
    let service = BulkImportService::new(
        Arc::new(store.clone()),
        ImportConfig {
            max_validation_workers: 0,
            ..config()
        },
    );
    assert_eq!(service.config().max_validation_workers, 1);

    for mode in [ValidationMode::Batch, ValidationMode::Parallel] {
        let outcome = service
            .import_dataset(
                "roles.csv",
                TableType::Roles,
                Dataset::from_rows(["Name"], [vec![format!("Role {mode}")]]),
                Uuid::nil(),
                &ImportOptions {
                    mode,
                    ..ImportOptions::default()
                },
                &CancellationToken::new(),
            )
            .await
            .expect("run completes");
        assert_eq!(outcome.status, ImportStatus::Completed);
    }
    assert_eq!(store.roles().len(), 2);
}

/// Hands out one session at a time and refuses to commit while one is open,
/// the way a pool with a single connection behaves.
struct SingleConnection {
    inner: MemoryStore,
    open: Arc<AtomicUsize>,
}

struct CountedSession {
    inner: Box<dyn StoreSession>,
    open: Arc<AtomicUsize>,
}

impl Drop for CountedSession {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreSession for CountedSession {
    async fn resolve(
        &mut self,
        key: LookupKey,
        candidates: &[String],
    ) -> StoreResult<HashMap<String, Uuid>> {
        self.inner.resolve(key, candidates).await
    }

    async fn existing_assignments(
        &mut self,
        pairs: &[(Uuid, Uuid)],
    ) -> StoreResult<HashSet<(Uuid, Uuid)>> {
        self.inner.existing_assignments(pairs).await
    }
}

#[async_trait]
impl Store for SingleConnection {
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>> {
        let inner = self.inner.session().await?;
        if self.open.fetch_add(1, Ordering::SeqCst) > 0 {
            self.open.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection already checked out".into()));
        }
        Ok(Box::new(CountedSession {
            inner,
            open: Arc::clone(&self.open),
        }))
    }

    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize> {
        if self.open.load(Ordering::SeqCst) > 0 {
            unit.take_pending();
            return Err(StoreError::Unavailable("connection already checked out".into()));
        }
        self.inner.commit(unit).await
    }
}

#[tokio::test]
async fn row_only_commits_need_no_second_connection() {
    let rows: Vec<Vec<String>> = (1..=5).map(|n| vec![format!("App {n}")]).collect();

    for (threshold, strategy) in [
        (1000, CommitStrategy::PerRow),
        (2, CommitStrategy::ChunkedRows { batch_size: 2 }),
    ] {
        let store = MemoryStore::new();
        let service = BulkImportService::new(
            Arc::new(SingleConnection {
                inner: store.clone(),
                open: Arc::new(AtomicUsize::new(0)),
            }),
            ImportConfig {
                row_commit_threshold: threshold,
                ..config()
            },
        );
        let outcome = service
            .import_dataset(
                "applications.csv",
                TableType::Applications,
                Dataset::from_rows(["Name"], rows.clone()),
                Uuid::nil(),
                &ImportOptions {
                    batch_size: Some(2),
                    ..ImportOptions::default()
                },
                &CancellationToken::new(),
            )
            .await
            .expect("run completes");

        assert_eq!(outcome.strategy, Some(strategy));
        assert_eq!(outcome.status, ImportStatus::Completed, "{outcome:?}");
        assert_eq!(outcome.succeeded_rows, 5);
        assert_eq!(store.applications().len(), 5);
    }
}

/// Rejects one commit, by 1-based position, as a constraint conflict on its
/// first entity.
struct ConflictOnCommit {
    inner: MemoryStore,
    reject: usize,
    attempts: AtomicUsize,
}

#[async_trait]
impl Store for ConflictOnCommit {
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>> {
        self.inner.session().await
    }

    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) + 1 == self.reject {
            let pending = unit.take_pending();
            let description = pending
                .first()
                .and_then(|entity| entity.natural_keys().into_iter().next())
                .map(|(_, description)| description)
                .unwrap_or_default();
            return Err(StoreError::Conflict(description));
        }
        self.inner.commit(unit).await
    }
}

#[tokio::test]
async fn conflicting_commit_fails_only_its_rows() {
    let store = MemoryStore::new();
    let service = BulkImportService::new(
        Arc::new(ConflictOnCommit {
            inner: store.clone(),
            reject: 2,
            attempts: AtomicUsize::new(0),
        }),
        config(),
    );
    let dataset = Dataset::from_rows(
        ["Name"],
        [vec!["One"], vec!["Two"], vec!["Three"], vec!["TWO"]],
    );

    let outcome = service
        .import_dataset(
            "applications.csv",
            TableType::Applications,
            dataset,
            Uuid::nil(),
            &options(false),
            &CancellationToken::new(),
        )
        .await
        .expect("a conflict does not end the run");

    assert_eq!(outcome.strategy, Some(CommitStrategy::PerRow));
    assert_eq!(outcome.status, ImportStatus::CompletedWithErrors);
    assert_eq!(outcome.processed_rows, 4);
    assert_eq!(outcome.succeeded_rows, 3);
    assert_eq!(outcome.failed_rows, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].row_number, 2);
    assert_eq!(
        outcome.errors[0].messages,
        vec!["Application 'Two' conflicts with an existing record"]
    );

    let stored: Vec<String> = store.applications().into_iter().map(|a| a.name).collect();
    assert_eq!(stored, vec!["One", "Three", "TWO"]);
    assert_eq!(store.commit_count(), 3);
}

/// Cancels the run's token on the first lookup made while armed. The store
/// either starts armed or arms itself after its first successful commit.
struct CancelOnLookup {
    inner: MemoryStore,
    cancel: CancellationToken,
    armed: Arc<AtomicBool>,
}

impl CancelOnLookup {
    fn armed(inner: MemoryStore, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    fn after_first_commit(inner: MemoryStore, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct CancellingSession {
    inner: Box<dyn StoreSession>,
    cancel: CancellationToken,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl StoreSession for CancellingSession {
    async fn resolve(
        &mut self,
        key: LookupKey,
        candidates: &[String],
    ) -> StoreResult<HashMap<String, Uuid>> {
        if self.armed.load(Ordering::SeqCst) {
            self.cancel.cancel();
        }
        self.inner.resolve(key, candidates).await
    }

    async fn existing_assignments(
        &mut self,
        pairs: &[(Uuid, Uuid)],
    ) -> StoreResult<HashSet<(Uuid, Uuid)>> {
        self.inner.existing_assignments(pairs).await
    }
}

#[async_trait]
impl Store for CancelOnLookup {
    async fn session(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(CancellingSession {
            inner: self.inner.session().await?,
            cancel: self.cancel.clone(),
            armed: Arc::clone(&self.armed),
        }))
    }

    async fn commit(&self, unit: &mut UnitOfWork) -> StoreResult<usize> {
        let written = self.inner.commit(unit).await?;
        self.armed.store(true, Ordering::SeqCst);
        Ok(written)
    }
}

#[tokio::test]
async fn cancellation_during_parallel_validation_keeps_finished_rows() {
    let cancel = CancellationToken::new();
    let store = CancelOnLookup::armed(MemoryStore::new(), cancel.clone());
    let orchestrator = ValidationOrchestrator::new(
        Arc::new(store),
        ImportConfig {
            max_validation_workers: 2,
            ..config()
        },
    );
    let rows: Vec<Vec<String>> = (1..=6).map(|n| vec![format!("Role {n}")]).collect();
    let mapper = MapperRegistry::new().get(TableType::Roles);

    let report = orchestrator
        .validate(
            mapper,
            Arc::new(Dataset::from_rows(["Name"], rows)),
            ValidationMode::Parallel,
            &cancel,
        )
        .await
        .expect("cancellation is reported, not raised");

    assert!(report.cancelled);
    assert!(matches!(report.strategy, ValidationStrategy::Parallel { .. }));
    // Each worker finishes the row it was validating, then stops.
    assert!((1..=2).contains(&report.results.len()), "{:?}", report.results);
    for (row_number, result) in &report.results {
        assert!((1..=6).contains(row_number));
        assert_eq!(result.row_number(), *row_number);
        assert!(result.is_valid());
    }
}

#[tokio::test]
async fn cancellation_during_validation_persists_nothing() {
    let memory = MemoryStore::new();
    let cancel = CancellationToken::new();
    let service = BulkImportService::new(
        Arc::new(CancelOnLookup::armed(memory.clone(), cancel.clone())),
        config(),
    );
    let rows: Vec<Vec<String>> = (1..=4).map(|n| vec![format!("App {n}")]).collect();

    let outcome = service
        .import_dataset(
            "applications.csv",
            TableType::Applications,
            Dataset::from_rows(["Name"], rows),
            Uuid::nil(),
            &options(false),
            &cancel,
        )
        .await
        .expect("cancellation is reported, not raised");

    assert_eq!(outcome.status, ImportStatus::Cancelled);
    assert_eq!(outcome.valid_rows, 1);
    assert_eq!(outcome.processed_rows, 0);
    assert_eq!(outcome.strategy, None);
    assert!(memory.applications().is_empty());
}

#[tokio::test]
async fn cancellation_mid_chunk_discards_the_partial_chunk() {
    let memory = MemoryStore::new();
    memory.seed([application("Payroll")]);
    memory.seed((1..=5).map(|n| user(&format!("user{n}"), &format!("user{n}@example.com"))));
    let cancel = CancellationToken::new();
    let service = BulkImportService::new(
        Arc::new(CancelOnLookup::after_first_commit(
            memory.clone(),
            cancel.clone(),
        )),
        ImportConfig {
            row_commit_threshold: 2,
            ..config()
        },
    );
    let rows: Vec<Vec<String>> = (1..=5)
        .map(|n| vec![format!("user{n}"), "Payroll".to_string()])
        .collect();

    let outcome = service
        .import_dataset(
            "assignments.csv",
            TableType::UserApplications,
            Dataset::from_rows(["Username", "ApplicationName"], rows),
            Uuid::nil(),
            &ImportOptions {
                batch_size: Some(2),
                ..ImportOptions::default()
            },
            &cancel,
        )
        .await
        .expect("cancellation is reported, not raised");

    assert_eq!(
        outcome.strategy,
        Some(CommitStrategy::ChunkedRows { batch_size: 2 })
    );
    assert_eq!(outcome.status, ImportStatus::Cancelled);
    assert_eq!(outcome.valid_rows, 5);
    assert_eq!(outcome.processed_rows, 2);
    assert_eq!(outcome.succeeded_rows, 2);
    assert_eq!(outcome.failed_rows, 0);

    let users = memory.users();
    let assigned: HashSet<Uuid> = memory.assignments().iter().map(|a| a.user_id).collect();
    let expected: HashSet<Uuid> = users
        .iter()
        .filter(|u| u.username == "user1" || u.username == "user2")
        .map(|u| u.id)
        .collect();
    assert_eq!(assigned, expected);
}
