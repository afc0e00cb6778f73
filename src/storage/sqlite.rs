use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::MeasurementStore;
use crate::models::{CatalogSeed, Measurement, TagDescriptor};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown derived view: {0}")]
    UnknownView(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Rows per INSERT statement. Three bind parameters per row keeps each
/// statement below SQLite's 32766 variable limit.
const UPSERT_CHUNK_ROWS: usize = 5_000;

/// Format used for the `measurements.timestamp` column
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Query performance metrics
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: Arc<AtomicU64>,
    pub slow_queries: Arc<AtomicU64>,
    pub total_query_time_ms: Arc<AtomicU64>,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, duration_ms: u64) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.total_query_time_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        // Bulk upserts of a full batch land well under a second on local disk
        if duration_ms > 1_000 {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(duration_ms, "Slow query detected");
        }
    }

    pub fn get_stats(&self) -> (u64, u64, u64) {
        (
            self.total_queries.load(Ordering::Relaxed),
            self.slow_queries.load(Ordering::Relaxed),
            self.total_query_time_ms.load(Ordering::Relaxed),
        )
    }
}

/// SQLite-backed measurement store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    metrics: QueryMetrics,
}

impl SqliteStore {
    /// Open (or create) the database file and build the connection pool
    pub async fn new(db_path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            metrics: QueryMetrics::new(),
        })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        tracing::info!("SQLite migrations completed");
        Ok(())
    }

    /// Quick connectivity check, runs SELECT 1
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close every pooled connection, waiting for checked-out ones to return
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Replace the whole catalog in one transaction.
    ///
    /// Children are deleted before parents and inserted after them. Existing
    /// measurements are kept.
    pub async fn replace_catalog(&self, seed: &CatalogSeed) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for table in ["tags", "locations", "buildings", "measure_types"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }

        for row in &seed.measure_types {
            sqlx::query(
                "INSERT INTO measure_types (measure_type_id, measure_type_name, unit) VALUES (?, ?, ?)",
            )
            .bind(row.measure_type_id)
            .bind(&row.measure_type_name)
            .bind(&row.unit)
            .execute(&mut *tx)
            .await?;
        }

        for row in &seed.buildings {
            sqlx::query("INSERT INTO buildings (building_id, building_name) VALUES (?, ?)")
                .bind(row.building_id)
                .bind(&row.building_name)
                .execute(&mut *tx)
                .await?;
        }

        for row in &seed.locations {
            sqlx::query(
                r#"
                INSERT INTO locations (location_id, building_id, location_name, floor, is_active)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.location_id)
            .bind(row.building_id)
            .bind(&row.location_name)
            .bind(&row.floor)
            .bind(row.is_active)
            .execute(&mut *tx)
            .await?;
        }

        for row in &seed.tags {
            sqlx::query(
                r#"
                INSERT INTO tags (
                    tag_id, building_id, location_id, measure_type_id,
                    tag_code, min_value, max_value
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.tag_id)
            .bind(row.building_id)
            .bind(row.location_id)
            .bind(row.measure_type_id)
            .bind(&row.tag_code)
            .bind(row.min_value)
            .bind(row.max_value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// View names are interpolated into SQL, so only plain identifiers pass
fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

#[async_trait]
impl MeasurementStore for SqliteStore {
    async fn load_tags(&self) -> Result<Vec<TagDescriptor>> {
        let tags = sqlx::query_as::<_, TagDescriptor>(
            r#"
            SELECT tag_id, tag_code, min_value, max_value
            FROM tags
            WHERE tag_code IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(tags)
    }

    async fn upsert_measurements(&self, batch: &[Measurement]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in batch.chunks(UPSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO measurements (timestamp, tag_id, value) ");
            builder.push_values(chunk, |mut row, m| {
                row.push_bind(format_timestamp(m.timestamp()))
                    .push_bind(m.tag_id())
                    .push_bind(m.value());
            });
            builder.push(" ON CONFLICT(timestamp, tag_id) DO UPDATE SET value = excluded.value");

            affected += builder
                .build()
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        // Dropping `tx` on any early return above rolls the batch back
        tx.commit().await?;
        self.metrics
            .record_query(start.elapsed().as_millis() as u64);

        Ok(affected)
    }

    async fn refresh_view(&self, name: &str) -> Result<()> {
        if !is_plain_identifier(name) {
            return Err(StorageError::UnknownView(name.to_string()));
        }

        let definition: Option<(String,)> =
            sqlx::query_as("SELECT definition FROM derived_views WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((definition,)) = definition else {
            return Err(StorageError::UnknownView(name.to_string()));
        };

        let start = Instant::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {name}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("INSERT INTO {name} {definition}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.metrics
            .record_query(start.elapsed().as_millis() as u64);

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{BuildingRow, LocationRow, MeasureTypeRow, TagRow};
    use chrono::TimeZone;
    use tempfile::TempDir;

    pub(crate) async fn create_test_store() -> (SqliteStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, 4).await.unwrap();
        store.migrate().await.unwrap();
        (store, temp_dir)
    }

    pub(crate) fn tag_row(tag_id: i64, code: &str, min: Option<f64>, max: Option<f64>) -> TagRow {
        TagRow {
            tag_id,
            building_id: 1,
            location_id: 1,
            measure_type_id: 1,
            tag_code: code.to_string(),
            min_value: min,
            max_value: max,
        }
    }

    /// One building, one location, one "power" measure type plus the given tags
    pub(crate) fn seed_with_tags(tags: Vec<TagRow>) -> CatalogSeed {
        CatalogSeed {
            measure_types: vec![MeasureTypeRow {
                measure_type_id: 1,
                measure_type_name: "power".to_string(),
                unit: Some("kW".to_string()),
            }],
            buildings: vec![BuildingRow {
                building_id: 1,
                building_name: "Main".to_string(),
            }],
            locations: vec![LocationRow {
                location_id: 1,
                building_id: 1,
                location_name: "Substation".to_string(),
                floor: Some("B1".to_string()),
                is_active: true,
            }],
            tags,
        }
    }

    pub(crate) async fn stored_rows(store: &SqliteStore) -> Vec<(String, i64, f64)> {
        sqlx::query_as("SELECT timestamp, tag_id, value FROM measurements ORDER BY timestamp, tag_id")
            .fetch_all(store.pool())
            .await
            .unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_store_creation() {
        let (store, _temp) = create_test_store().await;
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let (store, _temp) = create_test_store().await;
        assert!(store.migrate().await.is_ok());
    }

    #[tokio::test]
    async fn test_load_tags_skips_rows_without_code() {
        let (store, _temp) = create_test_store().await;
        store
            .replace_catalog(&seed_with_tags(vec![
                tag_row(1, "T1", Some(0.0), Some(100.0)),
                tag_row(2, "T2", None, None),
            ]))
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tags (tag_id, building_id, location_id, measure_type_id, tag_code) VALUES (3, 1, 1, 1, NULL)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let mut tags = store.load_tags().await.unwrap();
        tags.sort_by_key(|t| t.tag_id);

        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag_code, "T1");
        assert_eq!(tags[0].min_value, Some(0.0));
        assert_eq!(tags[0].max_value, Some(100.0));
        assert_eq!(tags[1].min_value, None);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_existing_value() {
        let (store, _temp) = create_test_store().await;

        let first = vec![
            Measurement::new(at(0, 0), 1, 10.0).unwrap(),
            Measurement::new(at(0, 1), 1, 11.0).unwrap(),
        ];
        store.upsert_measurements(&first).await.unwrap();

        let second = vec![Measurement::new(at(0, 0), 1, 99.5).unwrap()];
        store.upsert_measurements(&second).await.unwrap();

        let rows = stored_rows(&store).await;
        assert_eq!(
            rows,
            vec![
                ("2024-03-01 00:00:00".to_string(), 1, 99.5),
                ("2024-03-01 00:01:00".to_string(), 1, 11.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_upsert_spans_multiple_statements() {
        let (store, _temp) = create_test_store().await;

        let base = at(0, 0);
        let batch: Vec<Measurement> = (0..(UPSERT_CHUNK_ROWS as i64 + 10))
            .map(|i| Measurement::new(base + chrono::Duration::seconds(i), 7, i as f64).unwrap())
            .collect();
        store.upsert_measurements(&batch).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM measurements")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, batch.len() as i64);
    }

    #[tokio::test]
    async fn test_refresh_view_rebuilds_aggregate() {
        let (store, _temp) = create_test_store().await;
        store
            .replace_catalog(&seed_with_tags(vec![tag_row(1, "P1", None, None)]))
            .await
            .unwrap();

        let batch = vec![
            Measurement::new(at(10, 0), 1, 2.0).unwrap(),
            Measurement::new(at(10, 0) + chrono::Duration::seconds(30), 1, 4.0).unwrap(),
        ];
        store.upsert_measurements(&batch).await.unwrap();
        store.refresh_view("mv_power_1min").await.unwrap();
        // A second refresh replaces rather than duplicates
        store.refresh_view("mv_power_1min").await.unwrap();

        let rows: Vec<(String, i64, f64, i64)> = sqlx::query_as(
            "SELECT bucket, tag_id, avg_value, sample_count FROM mv_power_1min",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(rows, vec![("2024-03-01 10:00:00".to_string(), 1, 3.0, 2)]);
    }

    #[tokio::test]
    async fn test_refresh_unknown_view_fails() {
        let (store, _temp) = create_test_store().await;

        let err = store.refresh_view("mv_missing").await.unwrap_err();
        assert!(matches!(err, StorageError::UnknownView(name) if name == "mv_missing"));

        let err = store.refresh_view("mv; DROP TABLE tags").await.unwrap_err();
        assert!(matches!(err, StorageError::UnknownView(_)));
    }

    #[tokio::test]
    async fn test_replace_catalog_discards_previous_rows() {
        let (store, _temp) = create_test_store().await;
        store
            .replace_catalog(&seed_with_tags(vec![tag_row(1, "OLD", None, None)]))
            .await
            .unwrap();
        store
            .replace_catalog(&seed_with_tags(vec![tag_row(5, "NEW", None, Some(3.0))]))
            .await
            .unwrap();

        let tags = store.load_tags().await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag_code, "NEW");
    }

    #[tokio::test]
    async fn test_replace_catalog_rolls_back_on_failure() {
        let (store, _temp) = create_test_store().await;
        store
            .replace_catalog(&seed_with_tags(vec![tag_row(1, "KEEP", None, None)]))
            .await
            .unwrap();

        // Duplicate tag codes violate the UNIQUE constraint
        let broken = seed_with_tags(vec![tag_row(2, "DUP", None, None), tag_row(3, "DUP", None, None)]);
        assert!(store.replace_catalog(&broken).await.is_err());

        let tags = store.load_tags().await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag_code, "KEEP");
    }
}
