//! Fixed-size batching over an ordered slice of records

use std::iter::FusedIterator;
use std::slice::Chunks;

use crate::error::{Result, SurprisalError};

/// Lazy, restartable sequence of consecutive batches.
///
/// Every record lands in exactly one batch, in source order; only the last
/// batch may be shorter than `batch_size`. Cloning restarts iteration from
/// the current position.
#[derive(Debug, Clone)]
pub struct Batches<'a, T> {
    chunks: Chunks<'a, T>,
    batch_size: usize,
}

impl<'a, T> Batches<'a, T> {
    /// Configured upper bound on batch length
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<'a, T> Iterator for Batches<'a, T> {
    type Item = &'a [T];

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl<T> ExactSizeIterator for Batches<'_, T> {}

impl<T> FusedIterator for Batches<'_, T> {}

/// Partition `records` into batches of at most `batch_size` elements.
pub fn make_batches<T>(records: &[T], batch_size: usize) -> Result<Batches<'_, T>> {
    if batch_size == 0 {
        return Err(SurprisalError::Configuration(
            "batch_size must be a positive integer".to_string(),
        ));
    }
    Ok(Batches {
        chunks: records.chunks(batch_size),
        batch_size,
    })
}
