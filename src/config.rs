use std::env;

/// Workers never exceed this, whatever the environment says.
pub const VALIDATION_WORKER_CEILING: usize = 16;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

const MIB: u64 = 1024 * 1024;

/// Mebibytes to bytes, saturating instead of overflowing.
fn mebibytes(value: u64) -> u64 {
    value.saturating_mul(MIB)
}

/// Tuning for bulk import runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Row-only mappers above this many rows commit in batches instead of per row.
    pub row_commit_threshold: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub memory_budget_bytes: u64,
    pub max_validation_workers: usize,
    /// Row count above which `Auto` validation goes parallel.
    pub parallel_threshold: usize,
    pub max_file_bytes: usize,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            row_commit_threshold: env_usize("IMPORT_ROW_COMMIT_THRESHOLD", 1000),
            min_batch_size: env_usize("IMPORT_MIN_BATCH_SIZE", 100),
            max_batch_size: env_usize("IMPORT_MAX_BATCH_SIZE", 5000),
            memory_budget_bytes: mebibytes(env_u64("IMPORT_MEMORY_BUDGET_MB", 256)),
            max_validation_workers: env_usize("IMPORT_MAX_VALIDATION_WORKERS", 8),
            parallel_threshold: env_usize("IMPORT_PARALLEL_THRESHOLD", 500),
            max_file_bytes: env_usize("IMPORT_MAX_FILE_SIZE_MB", 50)
                .saturating_mul(MIB as usize),
        }
        .normalized()
    }

    /// Repair inconsistent bounds: batch sizes are at least 1 with
    /// `min <= max`, and the worker count stays within `1..=16`.
    pub fn normalized(mut self) -> Self {
        self.max_batch_size = self.max_batch_size.max(1);
        self.min_batch_size = self.min_batch_size.clamp(1, self.max_batch_size);
        self.max_validation_workers = self
            .max_validation_workers
            .clamp(1, VALIDATION_WORKER_CEILING);
        self
    }

    /// Worker pool size for parallel validation: CPU count, capped.
    pub fn validation_workers(&self) -> usize {
        num_cpus::get().min(self.max_validation_workers).max(1)
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Connection settings used by the command-line tool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            max_connections: env_usize("IMPORT_DB_MAX_CONNECTIONS", 10)
                .clamp(1, u32::MAX as usize) as u32,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
