//! Service configuration loaded from a TOML file.
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration for the standard monitoring export layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub ingest: PipelineConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/iot_monitor.db")
}
fn default_max_connections() -> u32 {
    8
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DirectoriesConfig {
    #[serde(default = "default_watch_dir")]
    pub watch: PathBuf,
    #[serde(default = "default_processed_dir")]
    pub processed: PathBuf,
    #[serde(default = "default_error_dir")]
    pub error: PathBuf,
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("./data/incoming")
}
fn default_processed_dir() -> PathBuf {
    PathBuf::from("./data/processed")
}
fn default_error_dir() -> PathBuf {
    PathBuf::from("./data/error")
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            watch: default_watch_dir(),
            processed: default_processed_dir(),
            error: default_error_dir(),
        }
    }
}

impl DirectoriesConfig {
    /// Create watch, processed and error directories if absent
    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [&self.watch, &self.processed, &self.error] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Extensions picked up by the watcher, with leading dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Measurements per upsert transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Files processed at the same time
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// Derived views refreshed after each file, in priority order
    #[serde(default = "default_views")]
    pub views: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    vec![".xlsx".to_string(), ".csv".to_string()]
}
fn default_batch_size() -> usize {
    10_000
}
fn default_max_concurrent_files() -> usize {
    4
}
fn default_views() -> Vec<String> {
    [
        "mv_power_1min",
        "mv_temp_1min",
        "mv_humid_5min",
        "mv_temp_5min",
        "mv_integrated_power_30min",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            batch_size: default_batch_size(),
            max_concurrent_files: default_max_concurrent_files(),
            views: default_views(),
        }
    }
}

/// Spreadsheet layout. Rows are 1-based, columns are letters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LayoutConfig {
    #[serde(default = "default_tag_row")]
    pub tag_row: u32,
    #[serde(default = "default_data_start_row")]
    pub data_start_row: u32,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default = "default_tag_start_column")]
    pub tag_start_column: String,
    #[serde(default = "default_tag_column_stride")]
    pub tag_column_stride: u32,
}

fn default_tag_row() -> u32 {
    36
}
fn default_data_start_row() -> u32 {
    40
}
fn default_date_column() -> String {
    "A".to_string()
}
fn default_time_column() -> String {
    "B".to_string()
}
fn default_tag_start_column() -> String {
    "D".to_string()
}
fn default_tag_column_stride() -> u32 {
    2
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            tag_row: default_tag_row(),
            data_start_row: default_data_start_row(),
            date_column: default_date_column(),
            time_column: default_time_column(),
            tag_start_column: default_tag_start_column(),
            tag_column_stride: default_tag_column_stride(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Wait after a creation event before looking at the file
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Interval between size checks once settled
    #[serde(default = "default_stability_poll_ms")]
    pub stability_poll_ms: u64,
    /// Consecutive unchanged sizes required before submission
    #[serde(default = "default_stability_checks")]
    pub stability_checks: u32,
}

fn default_settle_delay_ms() -> u64 {
    2_000
}
fn default_stability_poll_ms() -> u64 {
    500
}
fn default_stability_checks() -> u32 {
    2
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            stability_poll_ms: default_stability_poll_ms(),
            stability_checks: default_stability_checks(),
        }
    }
}

impl WatchConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms)
    }
}

/// Load configuration from `path`.
///
/// A missing file falls back to defaults; a file that exists but does not
/// parse is an error.
pub fn load_config(path: &Path) -> anyhow::Result<IngestConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(IngestConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: IngestConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

/// Render the default configuration as TOML
pub fn default_config_toml() -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(&IngestConfig::default())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_export_layout() {
        let config = IngestConfig::default();
        assert_eq!(config.layout.tag_row, 36);
        assert_eq!(config.layout.data_start_row, 40);
        assert_eq!(config.layout.date_column, "A");
        assert_eq!(config.layout.time_column, "B");
        assert_eq!(config.layout.tag_start_column, "D");
        assert_eq!(config.layout.tag_column_stride, 2);
        assert_eq!(config.ingest.batch_size, 10_000);
        assert_eq!(config.ingest.extensions, vec![".xlsx", ".csv"]);
        assert_eq!(config.watch.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.ingest.views.first().map(String::as_str), Some("mv_power_1min"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(
            &path,
            r#"
            [layout]
            tag_row = 5
            tag_start_column = "F"

            [ingest]
            batch_size = 500
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.layout.tag_row, 5);
        assert_eq!(config.layout.tag_start_column, "F");
        assert_eq!(config.layout.data_start_row, 40);
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.ingest.max_concurrent_files, 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.layout.tag_row, 36);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(&path, "[layout\ntag_row = ").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = default_config_toml().unwrap();
        let parsed: IngestConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.ingest.views.len(), 5);
    }
}
