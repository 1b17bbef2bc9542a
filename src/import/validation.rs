//! Validation orchestration.
//!
//! Runs a mapper's checks over a whole dataset in one of three ways and
//! hands back a map keyed by row number. The orchestrator never decides
//! whether a run may persist; that is the bulk service's job.

use super::outcome::{RowError, row_errors};
use crate::config::ImportConfig;
use crate::dataset::Dataset;
use crate::error::{ImportError, ImportResult};
use crate::mappers::{RowValidationResult, TableMapper, ValidationResultMap};
use crate::store::Store;
use serde::Serialize;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Requested validation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationMode {
    #[default]
    Auto,
    Sequential,
    Batch,
    Parallel,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Auto => "auto",
            ValidationMode::Sequential => "sequential",
            ValidationMode::Batch => "batch",
            ValidationMode::Parallel => "parallel",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ValidationMode::Auto),
            "sequential" => Ok(ValidationMode::Sequential),
            "batch" => Ok(ValidationMode::Batch),
            "parallel" => Ok(ValidationMode::Parallel),
            other => Err(format!(
                "unknown validation mode '{other}', expected auto, sequential, batch or parallel"
            )),
        }
    }
}

/// The strategy that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationStrategy {
    Sequential,
    Batch,
    Parallel { workers: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub results: ValidationResultMap,
    pub strategy: ValidationStrategy,
    /// True when cancellation cut the run short; `results` then only holds
    /// the rows validated before that.
    pub cancelled: bool,
}

impl ValidationReport {
    /// Invalid rows with their messages, ordered by row number.
    pub fn errors(&self) -> Vec<RowError> {
        row_errors(&self.results)
    }

    pub fn valid_count(&self) -> usize {
        self.results.values().filter(|result| result.is_valid()).count()
    }

    pub fn invalid_count(&self) -> usize {
        self.results.len() - self.valid_count()
    }
}

pub struct ValidationOrchestrator {
    store: Arc<dyn Store>,
    config: ImportConfig,
}

impl ValidationOrchestrator {
    pub fn new(store: Arc<dyn Store>, config: ImportConfig) -> Self {
        Self {
            store,
            config: config.normalized(),
        }
    }

    /// Pick the strategy for `mode`, `mapper` and a dataset of `rows` rows.
    pub fn choose(
        &self,
        mode: ValidationMode,
        mapper: &dyn TableMapper,
        rows: usize,
    ) -> ValidationStrategy {
        let batch_capable = mapper.as_batch().is_some();
        let parallel = ValidationStrategy::Parallel {
            workers: self.config.validation_workers().min(rows.max(1)),
        };
        match mode {
            ValidationMode::Auto if batch_capable => ValidationStrategy::Batch,
            ValidationMode::Auto if rows > self.config.parallel_threshold => parallel,
            ValidationMode::Auto => ValidationStrategy::Sequential,
            ValidationMode::Batch if batch_capable => ValidationStrategy::Batch,
            ValidationMode::Batch | ValidationMode::Sequential => ValidationStrategy::Sequential,
            ValidationMode::Parallel => parallel,
        }
    }

    pub async fn validate(
        &self,
        mapper: Arc<dyn TableMapper>,
        dataset: Arc<Dataset>,
        mode: ValidationMode,
        cancel: &CancellationToken,
    ) -> ImportResult<ValidationReport> {
        let strategy = self.choose(mode, mapper.as_ref(), dataset.len());
        log::debug!(
            "validating {} rows of {} ({:?})",
            dataset.len(),
            mapper.table_type(),
            strategy
        );

        let (results, cancelled) = match strategy {
            ValidationStrategy::Sequential => {
                self.sequential(mapper.as_ref(), &dataset, cancel).await?
            }
            ValidationStrategy::Batch => self.batch(mapper.as_ref(), &dataset, cancel).await?,
            ValidationStrategy::Parallel { workers } => {
                self.parallel(mapper, dataset, workers, cancel).await?
            }
        };

        if cancelled {
            log::info!("validation cancelled after {} rows", results.len());
        }
        Ok(ValidationReport {
            results,
            strategy,
            cancelled,
        })
    }

    async fn sequential(
        &self,
        mapper: &dyn TableMapper,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> ImportResult<(ValidationResultMap, bool)> {
        let mut session = self.store.session().await?;
        let mut results = ValidationResultMap::new();

        for row in dataset.rows() {
            if cancel.is_cancelled() {
                return Ok((results, true));
            }
            match mapper.validate_row(row, session.as_mut(), cancel).await {
                Ok(result) => {
                    results.insert(result.row_number(), result);
                }
                Err(ImportError::Cancelled) => return Ok((results, true)),
                Err(err) => return Err(err),
            }
        }
        Ok((results, false))
    }

    async fn batch(
        &self,
        mapper: &dyn TableMapper,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> ImportResult<(ValidationResultMap, bool)> {
        let Some(batch) = mapper.as_batch() else {
            return self.sequential(mapper, dataset, cancel).await;
        };
        if cancel.is_cancelled() {
            return Ok((ValidationResultMap::new(), true));
        }

        let mut session = self.store.session().await?;
        match batch.validate_batch(dataset, session.as_mut(), cancel).await {
            Ok(results) => Ok((results, false)),
            Err(ImportError::Cancelled) => Ok((ValidationResultMap::new(), true)),
            Err(err) => Err(err),
        }
    }

    async fn parallel(
        &self,
        mapper: Arc<dyn TableMapper>,
        dataset: Arc<Dataset>,
        workers: usize,
        cancel: &CancellationToken,
    ) -> ImportResult<(ValidationResultMap, bool)> {
        let mut tasks: JoinSet<ImportResult<(Vec<RowValidationResult>, bool)>> = JoinSet::new();

        for range in partition(dataset.len(), workers) {
            let store = Arc::clone(&self.store);
            let mapper = Arc::clone(&mapper);
            let dataset = Arc::clone(&dataset);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let mut session = store.session().await?;
                let mut produced = Vec::with_capacity(range.clone().count());
                for number in range {
                    if cancel.is_cancelled() {
                        return Ok((produced, true));
                    }
                    let Some(row) = dataset.row(number) else {
                        break;
                    };
                    match mapper.validate_row(row, session.as_mut(), &cancel).await {
                        Ok(result) => produced.push(result),
                        Err(ImportError::Cancelled) => return Ok((produced, true)),
                        Err(err) => return Err(err),
                    }
                }
                Ok((produced, false))
            });
        }

        let mut results = ValidationResultMap::new();
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            let (produced, worker_cancelled) = joined??;
            cancelled |= worker_cancelled;
            for result in produced {
                results.insert(result.row_number(), result);
            }
        }
        Ok((results, cancelled))
    }
}

/// Split row numbers `1..=rows` into at most `workers` contiguous ranges.
fn partition(rows: usize, workers: usize) -> Vec<RangeInclusive<usize>> {
    if rows == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, rows);
    let chunk = rows.div_ceil(workers);
    (0..workers)
        .map(|index| index * chunk + 1..=((index + 1) * chunk).min(rows))
        .filter(|range| !range.is_empty())
        .collect()
}
