pub mod catalog;
pub mod cell;
pub mod decoder;
pub mod filter;
pub mod lifecycle;
pub mod service;
pub mod watcher;
pub mod writer;

pub use catalog::TagCatalog;
pub use lifecycle::{FileOutcome, FileProcessor, ProcessorSettings};
pub use service::{IngestService, ServiceSummary};
pub use watcher::{start_watcher, SettlePolicy};
