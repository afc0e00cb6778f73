//! Per-file state machine: discovered → in-flight → completed | errored.
//!
//! The in-flight set is the only shared mutable state in the pipeline. A
//! file's outcome is recorded by where it ends up: the processed directory
//! or the error directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Local;
use tokio::sync::mpsc;

use super::catalog::TagCatalog;
use super::decoder::{decode_file, DecodeError, DecodeEvent, DecodeSkip, SheetLayout};
use super::filter::QualityFilter;
use super::writer::{refresh_views, BatchWriter};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::models::FileReport;
use crate::storage::MeasurementStore;

/// Decoded chunks buffered ahead of the writer
const DECODE_QUEUE: usize = 4;

/// Paths currently being processed
#[derive(Debug, Default)]
pub struct InFlightSet {
    paths: Mutex<HashSet<PathBuf>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set stays consistent even if a holder panicked mid-insert
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `path`. Returns false when it is already in flight.
    pub fn try_acquire(&self, path: &Path) -> bool {
        self.lock().insert(path.to_path_buf())
    }

    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    #[cfg(test)]
    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Releases the claim on drop, whatever the outcome
struct InFlightClaim<'a> {
    set: &'a InFlightSet,
    path: &'a Path,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.set.release(self.path);
    }
}

#[derive(Debug)]
pub enum FileOutcome {
    Completed {
        report: FileReport,
        destination: Option<PathBuf>,
    },
    Errored {
        error: IngestError,
        destination: Option<PathBuf>,
    },
    /// Another handler already owns this path
    AlreadyInFlight,
    /// The file was gone before processing started
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Processed,
    Errored,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub layout: SheetLayout,
    pub batch_size: usize,
    pub views: Vec<String>,
    pub processed_dir: PathBuf,
    pub error_dir: PathBuf,
}

impl ProcessorSettings {
    pub fn from_config(config: &IngestConfig) -> Result<Self, DecodeError> {
        Ok(Self {
            layout: SheetLayout::from_config(&config.layout)?,
            batch_size: config.ingest.batch_size,
            views: config.ingest.views.clone(),
            processed_dir: config.directories.processed.clone(),
            error_dir: config.directories.error.clone(),
        })
    }
}

/// Drives one file through decode → filter → write → view refresh → relocation
pub struct FileProcessor {
    store: Arc<dyn MeasurementStore>,
    catalog: Arc<TagCatalog>,
    filter: QualityFilter,
    settings: ProcessorSettings,
    in_flight: InFlightSet,
}

impl FileProcessor {
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        catalog: Arc<TagCatalog>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            filter: QualityFilter::new(catalog.clone()),
            catalog,
            settings,
            in_flight: InFlightSet::new(),
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    /// Handle one discovery event for `path`
    pub async fn handle(&self, path: &Path) -> FileOutcome {
        // Watcher events and the backlog scan may spell the same file differently
        let path = match tokio::fs::canonicalize(path).await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "File vanished before processing");
                return FileOutcome::Vanished;
            }
        };

        if !self.in_flight.try_acquire(&path) {
            tracing::info!(path = %path.display(), "File already in flight, ignoring duplicate discovery");
            return FileOutcome::AlreadyInFlight;
        }
        let _claim = InFlightClaim {
            set: &self.in_flight,
            path: &path,
        };

        tracing::info!(path = %path.display(), "Processing file");
        let started = Instant::now();

        match self.ingest(&path).await {
            Ok(report) => {
                tracing::info!(
                    path = %path.display(),
                    rows = report.rows_seen,
                    rows_skipped = report.rows_skipped,
                    cells_skipped = report.cells_skipped,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    batches = report.batches,
                    views_failed = report.views_failed.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "File processed"
                );
                let destination = self.relocate(&path, Disposition::Processed).await;
                FileOutcome::Completed {
                    report,
                    destination,
                }
            }
            Err(error) => {
                tracing::error!(
                    path = %path.display(),
                    kind = error.kind(),
                    error = %error,
                    "File processing failed"
                );
                let destination = self.relocate(&path, Disposition::Errored).await;
                FileOutcome::Errored { error, destination }
            }
        }
    }

    async fn ingest(&self, path: &Path) -> Result<FileReport, IngestError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        // CSV exports are recognized by the watcher but have no decoder yet
        if !matches!(extension.as_deref(), Some("xlsx" | "xlsm")) {
            return Err(IngestError::UnsupportedFormat(path.to_path_buf()));
        }

        // Decoding is CPU-bound; it runs on the blocking pool and streams chunks back
        let (tx, mut rx) = mpsc::channel(DECODE_QUEUE);
        let owned = path.to_path_buf();
        let layout = self.settings.layout;
        let catalog = self.catalog.clone();
        let decode = tokio::task::spawn_blocking(move || decode_file(&owned, layout, &catalog, tx));

        let mut report = FileReport::default();
        let mut writer = BatchWriter::new(self.store.as_ref(), self.settings.batch_size);

        while let Some(event) = rx.recv().await {
            let items = match event {
                DecodeEvent::Header {
                    columns,
                    unrecognized,
                } => {
                    for (column, code) in unrecognized {
                        tracing::warn!(
                            path = %path.display(),
                            column,
                            tag = %code,
                            "Unregistered tag code, column skipped"
                        );
                        report.unrecognized_tags.push(code);
                    }
                    tracing::debug!(path = %path.display(), tags = columns, "Tag columns recognized");
                    continue;
                }
                DecodeEvent::Items(items) => items,
            };

            for item in items {
                match item {
                    Ok(reading) => {
                        report.readings += 1;
                        match self.filter.apply(&reading) {
                            Ok(measurement) => {
                                report.accepted += 1;
                                writer.push(measurement).await?;
                            }
                            Err(rejection) => {
                                report.rejected += 1;
                                tracing::warn!(
                                    path = %path.display(),
                                    tag = %reading.tag_code,
                                    timestamp = %reading.timestamp,
                                    reason = %rejection,
                                    "Reading rejected"
                                );
                            }
                        }
                    }
                    Err(DecodeSkip::Row { row, reason }) => {
                        report.rows_skipped += 1;
                        tracing::warn!(
                            path = %path.display(),
                            row,
                            reason = %reason,
                            "Row skipped, timestamp could not be built"
                        );
                    }
                    Err(DecodeSkip::Cell {
                        row,
                        column,
                        tag_code,
                        reason,
                    }) => {
                        report.cells_skipped += 1;
                        tracing::debug!(
                            path = %path.display(),
                            row,
                            column,
                            tag = %tag_code,
                            reason = %reason,
                            "Cell skipped"
                        );
                    }
                }
            }
        }

        report.rows_seen = decode.await?.map_err(|source| IngestError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

        let (batches, _) = writer.finish().await?;
        report.batches = batches;
        report.views_failed = refresh_views(self.store.as_ref(), &self.settings.views).await;

        Ok(report)
    }

    /// Move the file to its terminal directory. Failures are logged only.
    async fn relocate(&self, path: &Path, disposition: Disposition) -> Option<PathBuf> {
        let file_name = path.file_name()?.to_string_lossy().into_owned();
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let (dir, name) = match disposition {
            Disposition::Processed => (&self.settings.processed_dir, format!("{stamp}_{file_name}")),
            Disposition::Errored => (&self.settings.error_dir, format!("ERROR_{stamp}_{file_name}")),
        };
        let destination = unique_destination(dir, &name);

        match move_file(path, &destination).await {
            Ok(()) => {
                match disposition {
                    Disposition::Processed => tracing::info!(
                        from = %path.display(),
                        to = %destination.display(),
                        "File moved to processed"
                    ),
                    Disposition::Errored => tracing::warn!(
                        from = %path.display(),
                        to = %destination.display(),
                        "File moved to error"
                    ),
                }
                Some(destination)
            }
            Err(e) => {
                tracing::error!(
                    from = %path.display(),
                    to = %destination.display(),
                    error = %e,
                    "Failed to relocate file"
                );
                None
            }
        }
    }
}

/// `dir/name`, or `dir/<stem>_<n>.<ext>` if two files land in the same second
fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1..)
        .map(|n| dir.join(format!("{stem}_{n}{extension}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}
