//! Sessions and database handles.
//!
//! A [`Session`] binds a [`Transport`] to a [`Loader`]; every [`Database`] obtained from it
//! shares both. Database handles are cheap to clone and can be moved into spawned tasks.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use settee::prelude::*;
//!
//! let session = Session::new(Arc::new(transport), Arc::new(registry));
//! let counters = session.database("counters");
//!
//! let mut doc = Stored::new(Counter { count: 0 }).with_key("visits");
//! counters.attempt_put(&mut doc).await?;
//!
//! counters.mutate_with("visits", |c: &mut Counter| c.count += 1).await?;
//! ```

use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::{
    codec::{BasicLoader, DocumentCodec, Loader},
    document::{DocumentValue, Stored},
    error::{CouchError, CouchResult},
    mutate::Mutation,
    reference::DocRef,
    request::{self, GetOptions, WriteOptions, WriteResult},
    transport::{CouchRequest, Method, Transport},
};

/// Number of rows fetched per `_all_docs` request unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Entry point for talking to one server.
#[derive(Debug, Clone)]
pub struct Session {
    transport: Arc<dyn Transport>,
    codec: DocumentCodec,
}

/// Summary returned by `GET /{db}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub doc_del_count: u64,
    #[serde(default)]
    pub update_seq: Option<Value>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, loader: Arc<dyn Loader>) -> Self {
        Self {
            transport,
            codec: DocumentCodec::new(loader),
        }
    }

    /// Creates a session that loads every document as a
    /// [`JsonDocument`](crate::document::JsonDocument).
    pub fn basic(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, Arc::new(BasicLoader))
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Returns a handle to the named database. No request is made.
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            name: name.into(),
            transport: self.transport.clone(),
            codec: self.codec.clone(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Lists the names of every database on the server.
    pub async fn all_dbs(&self) -> CouchResult<Vec<String>> {
        let response = self
            .transport
            .request(CouchRequest::new(Method::Get, ["_all_dbs"]))
            .await?;

        Ok(serde_json::from_value(response.into_body()?)?)
    }

    /// Reads the summary of a database.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::MissingDatabase`] if the database does not exist.
    pub async fn database_info(&self, name: &str) -> CouchResult<DatabaseInfo> {
        let response = self
            .transport
            .request(CouchRequest::new(Method::Get, [name]))
            .await
            .map_err(|err| request::classify_database(err, name))?;

        Ok(serde_json::from_value(response.into_body()?)?)
    }

    /// Checks that the server is up and ready to serve requests.
    pub async fn up(&self) -> CouchResult<()> {
        self.transport
            .request(CouchRequest::new(Method::Get, ["_up"]))
            .await
            .map(|_| ())
    }
}

/// A handle to one database.
#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    transport: Arc<dyn Transport>,
    codec: DocumentCodec,
    page_size: usize,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Sets the number of rows fetched per listing request (at least one).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub(crate) fn codec(&self) -> &DocumentCodec {
        &self.codec
    }

    /// Reads the current revision of a document.
    ///
    /// `T` is either a concrete [`Document`](crate::document::Document) type or
    /// `Box<dyn AnyDocument>` to accept whatever the loader produces.
    ///
    /// # Errors
    ///
    /// - [`CouchError::Missing`] if there is no such document
    /// - [`CouchError::Deleted`] if the returned revision is a tombstone
    /// - [`CouchError::WrongType`] if the document decodes to another type
    pub async fn get<T: DocumentValue>(&self, key: &str) -> CouchResult<Stored<T>> {
        self.get_with(key, &GetOptions::default()).await
    }

    /// Reads a document with extra read options.
    pub async fn get_with<T: DocumentValue>(
        &self,
        key: &str,
        options: &GetOptions,
    ) -> CouchResult<Stored<T>> {
        let fetched = request::fetch(&*self.transport, &self.name, key, options).await?;

        self.codec
            .decode(fetched.body, fetched.token.as_deref(), &self.name)
    }

    /// Writes a document once, without retrying.
    ///
    /// A document carrying a token is updated conditionally; one without is created, under its
    /// key if it has one and under a server-assigned key otherwise. On success the envelope's
    /// key, revision and token are replaced with the server's.
    ///
    /// # Errors
    ///
    /// - [`CouchError::Conflict`] if the token is stale, or on create if the key is taken
    /// - [`CouchError::Missing`] if the database does not exist
    pub async fn attempt_put<T: DocumentValue>(&self, doc: &mut Stored<T>) -> CouchResult<()> {
        self.attempt_put_with(doc, WriteOptions::default()).await
    }

    /// Writes a document once with extra write options.
    ///
    /// A batched write is acknowledged without a revision, so the envelope is left without a
    /// token and must be re-read before it can be updated again.
    pub async fn attempt_put_with<T: DocumentValue>(
        &self,
        doc: &mut Stored<T>,
        options: WriteOptions,
    ) -> CouchResult<()> {
        let body = self.codec.encode(doc)?;
        let result = request::put(
            &*self.transport,
            &self.name,
            doc.key(),
            doc.token(),
            body,
            options,
        )
        .await?;

        self.apply_write(doc, result);
        Ok(())
    }

    /// Deletes a document once, conditional on its token.
    ///
    /// On success the envelope is marked deleted and carries the tombstone's revision.
    ///
    /// # Errors
    ///
    /// - [`CouchError::PreconditionRequired`] if the document has no key or no token
    /// - [`CouchError::Conflict`] if the token is stale
    pub async fn attempt_delete<T: DocumentValue>(&self, doc: &mut Stored<T>) -> CouchResult<()> {
        self.attempt_delete_with(doc, WriteOptions::default()).await
    }

    pub async fn attempt_delete_with<T: DocumentValue>(
        &self,
        doc: &mut Stored<T>,
        options: WriteOptions,
    ) -> CouchResult<()> {
        let key = doc.key().ok_or_else(|| {
            CouchError::PreconditionRequired(format!(
                "Document in {} has no key and cannot be deleted",
                self.name
            ))
        })?;
        let result =
            request::delete(&*self.transport, &self.name, key, doc.token(), options).await?;

        self.apply_write(doc, result);
        doc.meta_mut().deleted = true;
        Ok(())
    }

    /// Copies the current revision of `source` to `destination` in this database.
    ///
    /// Overwriting an existing destination requires its current revision in
    /// `destination_rev`.
    ///
    /// # Errors
    ///
    /// - [`CouchError::Missing`] if `source` does not exist
    /// - [`CouchError::Conflict`] if `destination` exists and `destination_rev` does not match
    pub async fn attempt_copy(
        &self,
        source: &str,
        destination: &str,
        destination_rev: Option<&str>,
    ) -> CouchResult<WriteResult> {
        request::copy(
            &*self.transport,
            &self.name,
            source,
            destination,
            destination_rev,
            WriteOptions::default(),
        )
        .await
    }

    /// Starts a read-modify-write loop on `key`. See [`Mutation`].
    pub fn mutate<T: DocumentValue>(&self, key: impl Into<String>) -> Mutation<T> {
        Mutation::new(self.clone(), key.into())
    }

    /// Applies `edit` to the document at `key` until a write succeeds.
    ///
    /// On a conflict the edited copy is discarded, the document re-read, and `edit` called
    /// again on the fresh copy, so `edit` must be safe to run more than once. There is no retry
    /// cap; drop the future to cancel.
    ///
    /// # Errors
    ///
    /// Any error other than [`CouchError::Conflict`] ends the loop and is returned unchanged.
    pub async fn mutate_with<T, F>(&self, key: &str, mut edit: F) -> CouchResult<Stored<T>>
    where
        T: DocumentValue,
        F: FnMut(&mut T),
    {
        let mut mutation = self.mutate::<T>(key);
        while let Some(doc) = mutation.next().await? {
            edit(&mut **doc);
        }

        mutation
            .into_committed()
            .ok_or_else(|| CouchError::Missing(self.name.clone(), key.to_string()))
    }

    /// Lists every live document in key order.
    ///
    /// The stream is lazy: pages of [`page_size`](Self::page_size) rows are requested as it is
    /// polled. With `include_docs` every reference arrives resolved; otherwise
    /// [`DocRef::doc`] reads each document on demand. Design documents are listed like any
    /// other key but are never decoded eagerly, so an untagged view definition does not fail
    /// the listing.
    ///
    /// # Errors
    ///
    /// The stream yields [`CouchError::MissingDatabase`] if the database does not exist.
    pub fn all_docs<T: DocumentValue>(
        &self,
        include_docs: bool,
    ) -> BoxStream<'static, CouchResult<DocRef<T>>> {
        let database = self.clone();

        stream::try_unfold(Some(None), move |cursor: Option<Option<String>>| {
            let database = database.clone();
            async move {
                match cursor {
                    Some(start_key) => database.page::<T>(start_key, include_docs).await,
                    None => Ok(None),
                }
            }
        })
        .map_ok(|refs| stream::iter(refs.into_iter().map(Ok::<_, CouchError>)))
        .try_flatten()
        .boxed()
    }

    /// Fetches one page of references plus the cursor for the next one.
    ///
    /// One row beyond the page size is requested; its key starts the next page.
    async fn page<T: DocumentValue>(
        &self,
        start_key: Option<String>,
        include_docs: bool,
    ) -> CouchResult<Option<(Vec<DocRef<T>>, Option<Option<String>>)>> {
        let mut page = request::all_docs(
            &*self.transport,
            &self.name,
            start_key.as_deref(),
            self.page_size.saturating_add(1),
            include_docs,
        )
        .await?;

        let next = if page.rows.len() > self.page_size {
            page.rows.pop().map(|row| Some(row.id))
        } else {
            None
        };
        debug!(
            database = %self.name,
            rows = page.rows.len(),
            more = next.is_some(),
            "read listing page"
        );

        let refs = page
            .rows
            .into_iter()
            .map(|row| DocRef::from_row(self.clone(), row))
            .collect::<CouchResult<Vec<_>>>()?;

        Ok(Some((refs, next)))
    }

    fn apply_write<T>(&self, doc: &mut Stored<T>, result: WriteResult) {
        let meta = doc.meta_mut();
        meta.key = Some(result.id);
        meta.rev = result.rev;
        meta.token = result.token;
        meta.database = Some(self.name.clone());
    }
}
