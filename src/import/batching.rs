//! Commit batch sizing for row-only mappers.

use crate::config::ImportConfig;
use crate::dataset::Dataset;

/// In-memory cost of a staged entity relative to its encoded row.
pub const ROW_OVERHEAD_FACTOR: usize = 4;

/// `clamp(budget / footprint, min, max)`; a zero footprint yields `max`.
pub fn compute_batch_size(
    memory_budget_bytes: u64,
    row_footprint_bytes: usize,
    min_batch: usize,
    max_batch: usize,
) -> usize {
    let max_batch = max_batch.max(1);
    let min_batch = min_batch.clamp(1, max_batch);
    if row_footprint_bytes == 0 {
        return max_batch;
    }

    let fits = memory_budget_bytes / row_footprint_bytes as u64;
    let fits = usize::try_from(fits).unwrap_or(usize::MAX);
    fits.clamp(min_batch, max_batch)
}

/// Estimated bytes one staged row occupies; zero for an empty dataset.
pub fn estimate_row_footprint(dataset: &Dataset) -> usize {
    dataset
        .average_row_bytes()
        .saturating_mul(ROW_OVERHEAD_FACTOR)
}

/// Batch size for a run. An explicit request is honoured but kept within
/// `1..=max_batch_size`.
pub fn resolve_batch_size(
    requested: Option<usize>,
    dataset: &Dataset,
    config: &ImportConfig,
) -> usize {
    match requested {
        Some(size) => size.clamp(1, config.max_batch_size.max(1)),
        None => compute_batch_size(
            config.memory_budget_bytes,
            estimate_row_footprint(dataset),
            config.min_batch_size,
            config.max_batch_size,
        ),
    }
}
