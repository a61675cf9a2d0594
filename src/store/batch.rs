//! Bounded batch sources for streaming producers.

use super::value::{Batch, Schema};
use crate::error::StepError;

/// A producer that hands out rows one bounded batch at a time.
///
/// `next_batch` never returns more than `max_rows` rows and returns
/// `Ok(None)` once exhausted, so a consumer holds at most one batch.
pub trait BatchSource {
    fn schema(&self) -> Schema;

    fn next_batch(&mut self, max_rows: usize) -> Result<Option<Batch>, StepError>;
}

/// Serves an already materialized batch in slices. Useful for small
/// lookups and tests.
pub struct VecSource {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<super::Value>>,
    schema: Schema,
    max_batch_seen: usize,
}

impl VecSource {
    pub fn new(batch: Batch) -> Self {
        Self::with_schema(batch, Schema::default())
    }

    pub fn with_schema(batch: Batch, schema: Schema) -> Self {
        Self {
            columns: batch.columns,
            rows: batch.rows.into_iter(),
            schema,
            max_batch_seen: 0,
        }
    }

    /// Largest batch handed out so far.
    pub fn max_batch_seen(&self) -> usize {
        self.max_batch_seen
    }
}

impl BatchSource for VecSource {
    fn schema(&self) -> Schema {
        self.schema.clone()
    }

    fn next_batch(&mut self, max_rows: usize) -> Result<Option<Batch>, StepError> {
        let mut batch = Batch::with_capacity(self.columns.clone(), max_rows);
        batch.rows.extend(self.rows.by_ref().take(max_rows));
        if batch.is_empty() {
            return Ok(None);
        }
        self.max_batch_seen = self.max_batch_seen.max(batch.len());
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;

    #[test]
    fn test_vec_source_slices() {
        let mut batch = Batch::new(vec!["n".into()]);
        for i in 0..7 {
            batch.push_row(vec![Value::Integer(i)]);
        }
        let mut source = VecSource::new(batch);

        let mut sizes = Vec::new();
        while let Some(b) = source.next_batch(3).unwrap() {
            sizes.push(b.len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(source.max_batch_seen(), 3);
    }
}
