//! Lazily resolved references produced by listings.

use mea::mutex::Mutex;
use std::{fmt, sync::Arc};

use crate::{
    database::Database,
    document::{DocumentValue, Stored},
    error::CouchResult,
    request::{AllDocsRow, GetOptions},
};

/// Key prefix of design documents, which carry views rather than application data.
pub const DESIGN_PREFIX: &str = "_design/";

/// A `(key, revision)` pair from a listing, resolved to its document on first use.
///
/// Resolution reads exactly the listed revision, so a reference keeps pointing at the same
/// content even if the document is updated afterwards. The resolved document is cached and
/// shared: every call to [`DocRef::doc`] returns the same `Arc`.
pub struct DocRef<T> {
    key: String,
    rev: String,
    database: Database,
    doc: Mutex<Option<Arc<Stored<T>>>>,
}

impl<T: DocumentValue> DocRef<T> {
    /// Creates an unresolved reference.
    pub fn new(database: Database, key: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            rev: rev.into(),
            database,
            doc: Mutex::new(None),
        }
    }

    /// Included bodies are decoded now, except for design documents, which stay unresolved.
    pub(crate) fn from_row(database: Database, row: AllDocsRow) -> CouchResult<Self> {
        let doc = match row.doc {
            Some(_) if row.id.starts_with(DESIGN_PREFIX) => None,
            Some(body) => Some(Arc::new(database.codec().decode::<T>(
                body,
                None,
                database.name(),
            )?)),
            None => None,
        };

        Ok(Self {
            key: row.id,
            rev: row.value.rev,
            database,
            doc: Mutex::new(doc),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn rev(&self) -> &str {
        &self.rev
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Whether the document has already been fetched.
    pub async fn is_resolved(&self) -> bool {
        self.doc.lock().await.is_some()
    }

    /// Returns the referenced document, fetching it on the first call.
    ///
    /// Concurrent callers wait for a single fetch.
    ///
    /// # Errors
    ///
    /// Propagates read errors; a failed fetch is not cached, so the next call tries again.
    pub async fn doc(&self) -> CouchResult<Arc<Stored<T>>> {
        let mut cached = self.doc.lock().await;
        if let Some(doc) = cached.as_ref() {
            return Ok(doc.clone());
        }

        let doc = Arc::new(
            self.database
                .get_with::<T>(&self.key, &GetOptions::new().rev(self.rev.as_str()))
                .await?,
        );
        *cached = Some(doc.clone());

        Ok(doc)
    }
}

impl<T> fmt::Debug for DocRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocRef")
            .field("database", &self.database.name())
            .field("key", &self.key)
            .field("rev", &self.rev)
            .finish_non_exhaustive()
    }
}
