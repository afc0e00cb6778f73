use std::collections::HashMap;

use crate::error::IngestError;
use crate::models::TagDescriptor;
use crate::storage::MeasurementStore;

/// Tag code → descriptor map, loaded once per store session.
///
/// Never refreshed while the service runs; catalog edits are picked up on
/// restart. Shared read-only behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct TagCatalog {
    by_code: HashMap<String, TagDescriptor>,
}

impl TagCatalog {
    pub async fn load(store: &dyn MeasurementStore) -> Result<Self, IngestError> {
        let tags = store
            .load_tags()
            .await
            .map_err(IngestError::CatalogUnavailable)?;
        let catalog = Self::from_descriptors(tags);

        tracing::info!(tags = catalog.len(), "Tag catalog loaded");
        Ok(catalog)
    }

    pub fn from_descriptors(tags: impl IntoIterator<Item = TagDescriptor>) -> Self {
        Self {
            by_code: tags
                .into_iter()
                .map(|tag| (tag.tag_code.clone(), tag))
                .collect(),
        }
    }

    pub fn lookup(&self, tag_code: &str) -> Option<&TagDescriptor> {
        self.by_code.get(tag_code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}
