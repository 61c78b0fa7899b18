//! Conversion between stored JSON bodies and [`Stored`] documents.
//!
//! Decoding is split in two:
//!
//! 1. [`DocumentCodec`] strips CouchDB's reserved underscore fields into [`DocumentMeta`] and
//!    reconstructs `_id` / `_rev` / `_deleted` on the way back out.
//! 2. A pluggable [`Loader`] turns the remaining content into a typed value. [`BasicLoader`]
//!    keeps it as a [`JsonDocument`]; [`DocumentRegistry`](crate::registry::DocumentRegistry)
//!    resolves a type tag and runs migrations.
//!
//! Informational fields (`_attachments`, `_conflicts`, ...) are read into the metadata but
//! are never written back.

use serde_json::{Map, Value, from_value};
use std::{fmt::Debug, sync::Arc};

use crate::{
    document::{AnyDocument, DocumentMeta, DocumentValue, JsonDocument, Stored},
    error::{CouchError, CouchResult},
};

pub const ID_FIELD: &str = "_id";
pub const REV_FIELD: &str = "_rev";
pub const DELETED_FIELD: &str = "_deleted";
pub const ATTACHMENTS_FIELD: &str = "_attachments";
pub const CONFLICTS_FIELD: &str = "_conflicts";
pub const DELETED_CONFLICTS_FIELD: &str = "_deleted_conflicts";
pub const LOCAL_SEQ_FIELD: &str = "_local_seq";
pub const REVS_INFO_FIELD: &str = "_revs_info";
pub const REVISIONS_FIELD: &str = "_revisions";

/// Every top-level field the storage layer owns.
pub const RESERVED_FIELDS: [&str; 9] = [
    ID_FIELD,
    REV_FIELD,
    DELETED_FIELD,
    ATTACHMENTS_FIELD,
    CONFLICTS_FIELD,
    DELETED_CONFLICTS_FIELD,
    LOCAL_SEQ_FIELD,
    REVS_INFO_FIELD,
    REVISIONS_FIELD,
];

/// Strategy for turning document content into application values and back.
///
/// The content handed to [`Loader::load`] has already had its reserved fields removed, and
/// [`Loader::dump`] must not produce any.
pub trait Loader: Send + Sync + Debug {
    /// Builds a document from stored content.
    fn load(&self, body: Map<String, Value>) -> CouchResult<Box<dyn AnyDocument>>;

    /// Serializes a document into content for storage.
    fn dump(&self, doc: &dyn AnyDocument) -> CouchResult<Map<String, Value>>;
}

/// Loads every document as a [`JsonDocument`], without tags or migrations.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicLoader;

impl Loader for BasicLoader {
    fn load(&self, body: Map<String, Value>) -> CouchResult<Box<dyn AnyDocument>> {
        Ok(Box::new(JsonDocument::from(body)))
    }

    fn dump(&self, doc: &dyn AnyDocument) -> CouchResult<Map<String, Value>> {
        into_object(doc.to_any_json()?)
    }
}

/// Converts a JSON value into an object, rejecting anything else.
pub(crate) fn into_object(value: Value) -> CouchResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CouchError::InvalidDocument(format!(
            "Expected a JSON object, got {other}"
        ))),
    }
}

fn take<T: serde::de::DeserializeOwned>(
    body: &mut Map<String, Value>,
    field: &str,
) -> CouchResult<Option<T>> {
    match body.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(from_value(value)?)),
    }
}

/// Binds a [`Loader`] to the metadata handling shared by every database.
#[derive(Debug, Clone)]
pub struct DocumentCodec {
    loader: Arc<dyn Loader>,
}

impl DocumentCodec {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &dyn Loader {
        &*self.loader
    }

    /// Splits a stored body into metadata and content.
    ///
    /// `token` is the concurrency token from the response headers; when absent it is
    /// synthesized from `_rev`.
    pub fn split(
        &self,
        body: Value,
        token: Option<&str>,
        database: &str,
    ) -> CouchResult<(DocumentMeta, Map<String, Value>)> {
        let mut body = into_object(body)?;
        let rev: Option<String> = take(&mut body, REV_FIELD)?;

        let meta = DocumentMeta {
            key: take(&mut body, ID_FIELD)?,
            token: token
                .map(str::to_string)
                .or_else(|| rev.as_deref().map(DocumentMeta::token_for_rev)),
            rev,
            database: Some(database.to_string()),
            deleted: take(&mut body, DELETED_FIELD)?.unwrap_or(false),
            attachments: take(&mut body, ATTACHMENTS_FIELD)?,
            conflicts: take(&mut body, CONFLICTS_FIELD)?,
            deleted_conflicts: take(&mut body, DELETED_CONFLICTS_FIELD)?,
            local_seq: take(&mut body, LOCAL_SEQ_FIELD)?,
            revs_info: take(&mut body, REVS_INFO_FIELD)?,
            revisions: take(&mut body, REVISIONS_FIELD)?,
        };

        Ok((meta, body))
    }

    /// Decodes a stored body into a document of type `T`.
    ///
    /// # Errors
    ///
    /// Propagates loader errors and returns [`CouchError::WrongType`] if the loader produced a
    /// type other than `T`.
    pub fn decode<T: DocumentValue>(
        &self,
        body: Value,
        token: Option<&str>,
        database: &str,
    ) -> CouchResult<Stored<T>> {
        let (meta, content) = self.split(body, token, database)?;
        let doc = T::from_any_document(self.loader.load(content)?)?;

        Ok(Stored::from_parts(meta, doc))
    }

    /// Encodes a document for a write, restoring `_id`, `_rev` and `_deleted` from its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::InvalidDocument`] if the loader output contains reserved fields.
    pub fn encode<T: DocumentValue>(&self, doc: &Stored<T>) -> CouchResult<Value> {
        let mut body = self
            .loader
            .dump(DocumentValue::as_any_document(&**doc))?;

        if let Some(field) = body.keys().find(|key| key.starts_with('_')) {
            return Err(CouchError::InvalidDocument(format!(
                "Field '{field}' is reserved by the storage layer"
            )));
        }

        let meta = doc.meta();
        if let Some(key) = &meta.key {
            body.insert(ID_FIELD.to_string(), Value::String(key.clone()));
        }
        if let Some(rev) = &meta.rev {
            body.insert(REV_FIELD.to_string(), Value::String(rev.clone()));
        }
        if meta.deleted {
            body.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        }

        Ok(Value::Object(body))
    }
}
