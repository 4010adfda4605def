use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use bulklabel_core::SourceRef;

use crate::result::SourceError;

/// Opaque resume token handed back by a content source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One text item with its source metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl SourceItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: JsonValue::Null,
        }
    }
}

/// One page of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<SourceItem>,
    /// `None` once the sequence is exhausted.
    pub next_cursor: Option<Cursor>,
    /// Approximate total; may be refined by later pages.
    pub total_estimate: Option<u64>,
}

/// External provider of paginated, ordered text items.
///
/// Must be resumable: fetching with a cursor returned earlier yields the same
/// continuation of the sequence.
pub trait ContentSource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        source_ref: &SourceRef,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page, SourceError>;
}

impl<T: ContentSource + ?Sized> ContentSource for Arc<T> {
    fn fetch_page(
        &self,
        source_ref: &SourceRef,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        (**self).fetch_page(source_ref, cursor, page_size)
    }
}

/// In-memory content source for tests/dev. Cursors are decimal offsets.
#[derive(Debug, Default)]
pub struct InMemoryContentSource {
    sources: RwLock<HashMap<SourceRef, Vec<SourceItem>>>,
}

impl InMemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source_ref: SourceRef, items: Vec<SourceItem>) {
        if let Ok(mut sources) = self.sources.write() {
            sources.insert(source_ref, items);
        }
    }

    /// Convenience: `count` items with ids `{prefix}-{n}` and synthetic text.
    pub fn with_generated(self, source_ref: &str, count: usize) -> Self {
        let items = (0..count)
            .map(|n| SourceItem::new(format!("{source_ref}-{n}"), format!("item {n} of {source_ref}")))
            .collect();
        self.insert(SourceRef::new(source_ref), items);
        self
    }
}

impl ContentSource for InMemoryContentSource {
    fn fetch_page(
        &self,
        source_ref: &SourceRef,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let sources = self
            .sources
            .read()
            .map_err(|_| SourceError::Unavailable("source lock poisoned".to_string()))?;
        let items = sources
            .get(source_ref)
            .ok_or_else(|| SourceError::NotFound(source_ref.to_string()))?;

        let offset = match cursor {
            Some(c) => c
                .as_str()
                .parse::<usize>()
                .map_err(|_| SourceError::Malformed(format!("bad cursor '{}'", c.as_str())))?,
            None => 0,
        };
        let end = (offset + page_size.max(1)).min(items.len());
        let page_items = items.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < items.len()).then(|| Cursor::new(end.to_string()));

        Ok(Page {
            items: page_items,
            next_cursor,
            total_estimate: Some(items.len() as u64),
        })
    }
}
