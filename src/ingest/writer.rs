use crate::error::IngestError;
use crate::models::Measurement;
use crate::storage::MeasurementStore;

/// Buffers measurements and upserts them in bounded transactions.
///
/// One writer per file. A failed flush leaves earlier batches committed and
/// returns `IngestError::Persistence`; nothing is retried.
pub struct BatchWriter<'a> {
    store: &'a dyn MeasurementStore,
    batch_size: usize,
    buffer: Vec<Measurement>,
    batches: usize,
    written: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn MeasurementStore, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            buffer: Vec::with_capacity(batch_size.min(16_384)),
            batches: 0,
            written: 0,
        }
    }

    pub async fn push(&mut self, measurement: Measurement) -> Result<(), IngestError> {
        self.buffer.push(measurement);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), IngestError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let rows = self.buffer.len();
        self.store
            .upsert_measurements(&self.buffer)
            .await
            .map_err(|source| IngestError::Persistence { rows, source })?;

        self.batches += 1;
        self.written += rows;
        self.buffer.clear();
        tracing::debug!(rows, batches = self.batches, "Batch committed");
        Ok(())
    }

    /// Flush the remainder. Returns (batches committed, measurements written).
    pub async fn finish(mut self) -> Result<(usize, usize), IngestError> {
        self.flush().await?;
        Ok((self.batches, self.written))
    }
}

/// Refresh derived views in the given order.
///
/// Every view is attempted even when an earlier one fails. Returns the names
/// that failed; already written measurements are never touched.
pub async fn refresh_views(store: &dyn MeasurementStore, views: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    for view in views {
        match store.refresh_view(view).await {
            Ok(()) => tracing::info!(view = %view, "View refreshed"),
            Err(e) => {
                tracing::error!(view = %view, error = %e, "View refresh failed");
                failed.push(view.clone());
            }
        }
    }
    failed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::TagDescriptor;
    use crate::storage::sqlite::Result as StorageResult;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Records every call; fails upserts after `fail_after` successful ones
    /// and refreshes for names listed in `failing_views`.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub fail_after: Option<usize>,
        pub failing_views: Vec<String>,
        pub batches: Mutex<Vec<usize>>,
        pub refreshed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MeasurementStore for RecordingStore {
        async fn load_tags(&self) -> StorageResult<Vec<TagDescriptor>> {
            Ok(Vec::new())
        }

        async fn upsert_measurements(&self, batch: &[Measurement]) -> StorageResult<u64> {
            let mut batches = self.batches.lock().unwrap();
            if self.fail_after.is_some_and(|n| batches.len() >= n) {
                return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
            }
            batches.push(batch.len());
            Ok(batch.len() as u64)
        }

        async fn refresh_view(&self, name: &str) -> StorageResult<()> {
            self.refreshed.lock().unwrap().push(name.to_string());
            if self.failing_views.iter().any(|v| v == name) {
                return Err(StorageError::UnknownView(name.to_string()));
            }
            Ok(())
        }
    }

    fn measurement(i: i64) -> Measurement {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(i);
        Measurement::new(ts, 1, i as f64).unwrap()
    }

    #[tokio::test]
    async fn test_flushes_at_threshold_and_remainder() {
        let store = RecordingStore::default();
        let mut writer = BatchWriter::new(&store, 3);
        for i in 0..7 {
            writer.push(measurement(i)).await.unwrap();
        }
        let (batches, written) = writer.finish().await.unwrap();

        assert_eq!(batches, 3);
        assert_eq!(written, 7);
        assert_eq!(*store.batches.lock().unwrap(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_finish_without_data_writes_nothing() {
        let store = RecordingStore::default();
        let (batches, written) = BatchWriter::new(&store, 10).finish().await.unwrap();
        assert_eq!((batches, written), (0, 0));
        assert!(store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_is_persistence_failure() {
        let store = RecordingStore {
            fail_after: Some(1),
            ..Default::default()
        };
        let mut writer = BatchWriter::new(&store, 2);
        writer.push(measurement(0)).await.unwrap();
        writer.push(measurement(1)).await.unwrap();
        writer.push(measurement(2)).await.unwrap();

        let err = writer.push(measurement(3)).await.unwrap_err();
        assert!(matches!(err, IngestError::Persistence { rows: 2, .. }));
        assert_eq!(*store.batches.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_refresh_continues_past_failing_view() {
        let store = RecordingStore {
            failing_views: vec!["mv_b".to_string()],
            ..Default::default()
        };
        let views: Vec<String> = ["mv_a", "mv_b", "mv_c"].iter().map(|s| s.to_string()).collect();

        let failed = refresh_views(&store, &views).await;

        assert_eq!(failed, vec!["mv_b".to_string()]);
        assert_eq!(*store.refreshed.lock().unwrap(), views);
    }
}
