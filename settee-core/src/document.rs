//! Core traits and types for document representation.
//!
//! Application documents are plain serde types implementing [`Document`]. Storage metadata
//! (key, revision, concurrency token, database) never appears in the document type itself:
//! it travels next to the value inside a [`Stored`] envelope, which dereferences to the
//! document so callers edit fields directly.
//!
//! Heterogeneous databases are read through the type-erased [`AnyDocument`] and narrowed
//! back with [`Stored::downcast`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, from_value, to_value};
use std::{
    any::{Any, type_name},
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use crate::error::{CouchError, CouchResult};

/// Core trait that all documents stored through this crate must implement.
///
/// The trait has no methods: a document is any serde type that is cheap enough to clone and
/// safe to share between tasks. Use `#[derive(Document)]` from the facade crate, or implement
/// it by hand:
///
/// ```ignore
/// use serde::{Deserialize, Serialize};
/// use settee::document::Document;
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Counter {
///     pub count: i64,
/// }
///
/// impl Document for Counter {}
/// ```
pub trait Document: Serialize + DeserializeOwned + Send + Sync + Clone + Debug + 'static {}

/// A document type that carries its registry tag at compile time.
///
/// Registered with [`DocumentRegistry::register_tagged`](crate::registry::DocumentRegistry::register_tagged).
pub trait TaggedDocument: Document {
    /// The permanent tag this schema version is stored under.
    const TAG: &'static str;
}

/// Extension trait providing JSON conversion for documents.
///
/// Automatically implemented for every [`Document`].
pub trait DocumentExt: Document {
    /// Converts this document to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn to_json(&self) -> CouchResult<Value>;

    /// Creates a document from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not have the document's shape.
    fn from_json(value: Value) -> CouchResult<Self>;
}

impl<D: Document> DocumentExt for D {
    fn to_json(&self) -> CouchResult<Value> {
        Ok(to_value(self)?)
    }

    fn from_json(value: Value) -> CouchResult<Self> {
        Ok(from_value(value)?)
    }
}

/// Type-erased document trait.
///
/// This is what a [`Loader`](crate::codec::Loader) produces: the concrete type is only known
/// once the stored tag has been resolved, so decoding yields a `Box<dyn AnyDocument>`.
pub trait AnyDocument: Send + Sync + Debug {
    /// Returns the Rust type name of the concrete document.
    fn type_name(&self) -> &'static str;

    /// Returns a reference to the document as a generic `Any` type.
    fn as_any(&self) -> &dyn Any;

    /// Returns a mutable reference to the document as a generic `Any` type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Converts the boxed document into a boxed `Any` for by-value downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// Clones the document into a new boxed `AnyDocument`.
    fn clone_box(&self) -> Box<dyn AnyDocument>;

    /// Converts this document to JSON.
    fn to_any_json(&self) -> CouchResult<Value>;
}

impl dyn AnyDocument {
    /// Attempts to downcast a reference to a specific document type.
    pub fn downcast_ref<D: Document>(&self) -> Option<&D> {
        self.as_any().downcast_ref::<D>()
    }

    /// Attempts to downcast a mutable reference to a specific document type.
    pub fn downcast_mut<D: Document>(&mut self) -> Option<&mut D> {
        self.as_any_mut().downcast_mut::<D>()
    }

    /// Returns `true` if the concrete type is `D`.
    pub fn is<D: Document>(&self) -> bool {
        self.as_any().is::<D>()
    }
}

impl<D: Document> AnyDocument for D {
    fn type_name(&self) -> &'static str {
        type_name::<D>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn clone_box(&self) -> Box<dyn AnyDocument> {
        Box::new(self.clone())
    }

    fn to_any_json(&self) -> CouchResult<Value> {
        DocumentExt::to_json(self)
    }
}

impl Clone for Box<dyn AnyDocument> {
    fn clone(&self) -> Box<dyn AnyDocument> {
        self.clone_box()
    }
}

/// A value that can live inside a [`Stored`] envelope.
///
/// Implemented for every [`Document`] (decoding downcasts to the exact type) and for
/// `Box<dyn AnyDocument>` (decoding keeps whatever the loader produced).
pub trait DocumentValue: Clone + Debug + Send + Sync + 'static {
    /// Narrows a loader's output to this value type.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::WrongType`] if the decoded document has a different type.
    fn from_any_document(doc: Box<dyn AnyDocument>) -> CouchResult<Self>;

    /// Borrows the value as a type-erased document for encoding.
    fn as_any_document(&self) -> &dyn AnyDocument;
}

impl<D: Document> DocumentValue for D {
    fn from_any_document(doc: Box<dyn AnyDocument>) -> CouchResult<Self> {
        let found = doc.type_name();

        doc.into_any()
            .downcast::<D>()
            .map(|doc| *doc)
            .map_err(|_| CouchError::WrongType {
                expected: type_name::<D>(),
                found,
            })
    }

    fn as_any_document(&self) -> &dyn AnyDocument {
        self
    }
}

impl DocumentValue for Box<dyn AnyDocument> {
    fn from_any_document(doc: Box<dyn AnyDocument>) -> CouchResult<Self> {
        Ok(doc)
    }

    fn as_any_document(&self) -> &dyn AnyDocument {
        &**self
    }
}

/// Storage metadata attached to a persisted document.
///
/// `key`, `rev`, `token` and `database` identify the stored revision. The remaining fields are
/// informational: they are filled in when requested on read and never written back.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentMeta {
    /// Document key (`_id`).
    pub key: Option<String>,
    /// Revision marker (`_rev`).
    pub rev: Option<String>,
    /// Concurrency token sent as `If-Match` on update and delete.
    pub token: Option<String>,
    /// Database the document was read from or written to.
    pub database: Option<String>,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Attachment stubs, if requested.
    pub attachments: Option<Value>,
    /// Conflicting revisions, if requested.
    pub conflicts: Option<Vec<String>>,
    /// Deleted conflicting revisions, if requested.
    pub deleted_conflicts: Option<Vec<String>>,
    pub local_seq: Option<Value>,
    pub revs_info: Option<Value>,
    pub revisions: Option<Value>,
}

impl DocumentMeta {
    /// Builds the concurrency token for a revision when the server sent no `ETag`.
    pub fn token_for_rev(rev: &str) -> String {
        format!("\"{rev}\"")
    }
}

/// A document value together with its storage metadata.
///
/// A freshly constructed `Stored` has no metadata and will be created on its first write.
/// After a read or a successful write the metadata is filled in and follows the value through
/// every subsequent write.
///
/// # Example
///
/// ```ignore
/// let mut doc = Stored::new(Counter { count: 0 }).with_key("visits");
/// db.attempt_put(&mut doc).await?;
/// assert!(doc.token().is_some());
/// doc.count += 1;
/// db.attempt_put(&mut doc).await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    meta: DocumentMeta,
    doc: T,
}

impl<T> Stored<T> {
    /// Wraps a document that has never been persisted.
    pub fn new(doc: T) -> Self {
        Self {
            meta: DocumentMeta::default(),
            doc,
        }
    }

    /// Reassembles an envelope from its parts.
    pub fn from_parts(meta: DocumentMeta, doc: T) -> Self {
        Self { meta, doc }
    }

    /// Sets the key the document will be created under.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.meta.key = Some(key.into());
        self
    }

    pub fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut DocumentMeta {
        &mut self.meta
    }

    pub fn key(&self) -> Option<&str> {
        self.meta.key.as_deref()
    }

    pub fn rev(&self) -> Option<&str> {
        self.meta.rev.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.meta.token.as_deref()
    }

    pub fn database(&self) -> Option<&str> {
        self.meta.database.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.meta.deleted
    }

    /// Discards the metadata and returns the document.
    pub fn into_inner(self) -> T {
        self.doc
    }

    pub fn into_parts(self) -> (DocumentMeta, T) {
        (self.meta, self.doc)
    }
}

impl Stored<Box<dyn AnyDocument>> {
    /// Narrows a type-erased document to `D`, keeping the metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::WrongType`] if the document is not a `D`.
    pub fn downcast<D: Document>(self) -> CouchResult<Stored<D>> {
        Ok(Stored {
            doc: D::from_any_document(self.doc)?,
            meta: self.meta,
        })
    }
}

impl<T> Deref for Stored<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.doc
    }
}

impl<T> DerefMut for Stored<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.doc
    }
}

/// A dictionary document: an arbitrary JSON object.
///
/// This is what [`BasicLoader`](crate::codec::BasicLoader) produces, and it can also be
/// registered in a [`DocumentRegistry`](crate::registry::DocumentRegistry) like any other type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonDocument(Map<String, Value>);

impl JsonDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a document from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::InvalidDocument`] if the value is not an object.
    pub fn from_value(value: Value) -> CouchResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CouchError::InvalidDocument(format!(
                "Expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl Document for JsonDocument {}

impl From<Map<String, Value>> for JsonDocument {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Deref for JsonDocument {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for JsonDocument {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
