//! Conditional requests against the CouchDB document API.
//!
//! This layer turns document operations into [`CouchRequest`]s carrying concurrency tokens
//! (`ETag` in, `If-Match` out) and classifies the answers:
//!
//! | Server answer | Error |
//! |---|---|
//! | 404 | [`CouchError::Missing`] ([`CouchError::MissingDatabase`] for database requests) |
//! | 409 / 412 | [`CouchError::Conflict`] |
//! | tombstone body (`_deleted: true`) | [`CouchError::Deleted`] |
//! | anything else non-2xx | propagated unchanged |
//!
//! It works on raw JSON; decoding into documents is the job of
//! [`DocumentCodec`](crate::codec::DocumentCodec).

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    codec::{DELETED_FIELD, REV_FIELD},
    document::DocumentMeta,
    error::{CouchError, CouchResult},
    transport::{CouchRequest, CouchResponse, Method, QueryValue, Transport},
};

pub const ETAG_HEADER: &str = "etag";
pub const IF_MATCH_HEADER: &str = "If-Match";
pub const DESTINATION_HEADER: &str = "Destination";

/// Optional flags for a document read. All of them are passed through to the server verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    pub attachments: bool,
    pub conflicts: bool,
    pub deleted_conflicts: bool,
    pub latest: bool,
    pub local_seq: bool,
    pub meta: bool,
    pub rev: Option<String>,
    pub revs: bool,
    pub revs_info: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a specific revision instead of the winning one.
    pub fn rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn attachments(mut self) -> Self {
        self.attachments = true;
        self
    }

    pub fn conflicts(mut self) -> Self {
        self.conflicts = true;
        self
    }

    pub fn deleted_conflicts(mut self) -> Self {
        self.deleted_conflicts = true;
        self
    }

    pub fn latest(mut self) -> Self {
        self.latest = true;
        self
    }

    pub fn local_seq(mut self) -> Self {
        self.local_seq = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn revs(mut self) -> Self {
        self.revs = true;
        self
    }

    pub fn revs_info(mut self) -> Self {
        self.revs_info = true;
        self
    }

    fn apply(&self, request: CouchRequest) -> CouchRequest {
        let request = request
            .flag("attachments", self.attachments)
            .flag("conflicts", self.conflicts)
            .flag("deleted_conflicts", self.deleted_conflicts)
            .flag("latest", self.latest)
            .flag("local_seq", self.local_seq)
            .flag("meta", self.meta)
            .flag("revs", self.revs)
            .flag("revs_info", self.revs_info);

        match &self.rev {
            Some(rev) => request.query("rev", QueryValue::Str(rev.clone())),
            None => request,
        }
    }
}

/// Options for writes and deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Ask the server to acknowledge before the write is durable (`batch=ok`).
    pub batch: bool,
}

impl WriteOptions {
    pub fn batch() -> Self {
        Self { batch: true }
    }

    fn apply(&self, request: CouchRequest) -> CouchRequest {
        if self.batch {
            request.query("batch", QueryValue::Str("ok".into()))
        } else {
            request
        }
    }
}

/// A document body as read from the server, with its concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub body: Value,
    pub token: Option<String>,
}

/// The server's acknowledgment of a write.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteResult {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(skip)]
    pub token: Option<String>,
}

impl WriteResult {
    fn from_response(response: CouchResponse) -> CouchResult<Self> {
        let etag = response.header(ETAG_HEADER).map(str::to_string);
        let mut result: WriteResult = serde_json::from_value(response.into_body()?)?;

        result.token = etag.or_else(|| result.rev.as_deref().map(DocumentMeta::token_for_rev));

        Ok(result)
    }
}

/// Bytes of a document key left unescaped in the `Destination` header.
const DESTINATION_KEY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Maps transport errors onto the document-state taxonomy.
pub fn classify(err: CouchError, database: &str, key: &str) -> CouchError {
    match err {
        CouchError::Status { status: 404, .. } => {
            CouchError::Missing(database.to_string(), key.to_string())
        }
        CouchError::Status {
            status: 409 | 412, ..
        } => CouchError::Conflict(database.to_string(), key.to_string()),
        other => other,
    }
}

/// Maps errors of requests addressed to a database rather than a document.
pub fn classify_database(err: CouchError, database: &str) -> CouchError {
    match err {
        CouchError::Status { status: 404, .. } => CouchError::MissingDatabase(database.to_string()),
        other => other,
    }
}

fn is_tombstone(body: &Value) -> bool {
    body.get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Reads a document body.
///
/// # Errors
///
/// - [`CouchError::Missing`] if the server reports not-found
/// - [`CouchError::Deleted`] if the returned revision is a tombstone
/// - [`CouchError::Conflict`] on a precondition failure
pub async fn fetch(
    transport: &dyn Transport,
    database: &str,
    key: &str,
    options: &GetOptions,
) -> CouchResult<Fetched> {
    debug!(database, key, "fetching document");

    let response = transport
        .request(options.apply(CouchRequest::new(Method::Get, [database, key])))
        .await
        .map_err(|err| classify(err, database, key))?;

    let header_token = response.header(ETAG_HEADER).map(str::to_string);
    let body = response.into_body()?;

    if is_tombstone(&body) {
        return Err(CouchError::Deleted(database.to_string(), key.to_string()));
    }

    let token = header_token.or_else(|| {
        body.get(REV_FIELD)
            .and_then(Value::as_str)
            .map(DocumentMeta::token_for_rev)
    });

    Ok(Fetched { body, token })
}

/// Writes a document body.
///
/// With a `key` the body is `PUT` to that key, conditional on `token` when one is given.
/// Without a key the document is created with `POST` and the server assigns the key.
///
/// # Errors
///
/// - [`CouchError::Conflict`] if the token is stale or the document already exists
/// - [`CouchError::Missing`] if the database does not exist
pub async fn put(
    transport: &dyn Transport,
    database: &str,
    key: Option<&str>,
    token: Option<&str>,
    body: Value,
    options: WriteOptions,
) -> CouchResult<WriteResult> {
    debug!(database, key, conditional = token.is_some(), "writing document");

    let request = match key {
        Some(key) => CouchRequest::new(Method::Put, [database, key]),
        None => CouchRequest::new(Method::Post, [database]),
    }
    .header(IF_MATCH_HEADER, token)
    .json(body);

    let response = transport
        .request(options.apply(request))
        .await
        .map_err(|err| classify(err, database, key.unwrap_or_default()))?;

    WriteResult::from_response(response)
}

/// Deletes a document, conditional on `token`.
///
/// # Errors
///
/// - [`CouchError::PreconditionRequired`] if there is no token
/// - [`CouchError::Conflict`] if the token is stale
/// - [`CouchError::Missing`] if the document or database does not exist
pub async fn delete(
    transport: &dyn Transport,
    database: &str,
    key: &str,
    token: Option<&str>,
    options: WriteOptions,
) -> CouchResult<WriteResult> {
    let token = token.ok_or_else(|| {
        CouchError::PreconditionRequired(format!(
            "Document {key} in {database} must be fetched before it can be deleted"
        ))
    })?;

    debug!(database, key, "deleting document");

    let request = CouchRequest::new(Method::Delete, [database, key]).header(IF_MATCH_HEADER, Some(token));

    let response = transport
        .request(options.apply(request))
        .await
        .map_err(|err| classify(err, database, key))?;

    WriteResult::from_response(response)
}

/// Copies the current revision of `source` to `destination`.
///
/// When the destination already exists, `destination_rev` must name its current revision.
///
/// # Errors
///
/// - [`CouchError::Conflict`] if the destination exists and `destination_rev` is stale or
///   missing
/// - [`CouchError::Missing`] if the source does not exist
pub async fn copy(
    transport: &dyn Transport,
    database: &str,
    source: &str,
    destination: &str,
    destination_rev: Option<&str>,
    options: WriteOptions,
) -> CouchResult<WriteResult> {
    debug!(database, source, destination, "copying document");

    let encoded = utf8_percent_encode(destination, DESTINATION_KEY);
    let target = match destination_rev {
        Some(rev) => format!("{encoded}?rev={rev}"),
        None => encoded.to_string(),
    };
    let request =
        CouchRequest::new(Method::Copy, [database, source]).header(DESTINATION_HEADER, Some(target.as_str()));

    let response = transport
        .request(options.apply(request))
        .await
        .map_err(|err| match classify(err, database, source) {
            CouchError::Conflict(db, _) => CouchError::Conflict(db, destination.to_string()),
            other => other,
        })?;

    WriteResult::from_response(response)
}

/// One row of an `_all_docs` listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    pub key: Value,
    pub value: AllDocsValue,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AllDocsValue {
    pub rev: String,
}

/// A page of an `_all_docs` listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AllDocsPage {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    pub rows: Vec<AllDocsRow>,
}

/// Reads one page of the primary index, starting at `start_key` (inclusive).
///
/// # Errors
///
/// Returns [`CouchError::MissingDatabase`] if the database does not exist.
pub async fn all_docs(
    transport: &dyn Transport,
    database: &str,
    start_key: Option<&str>,
    limit: usize,
    include_docs: bool,
) -> CouchResult<AllDocsPage> {
    debug!(database, start_key, limit, include_docs, "listing documents");

    let mut request = CouchRequest::new(Method::Get, [database, "_all_docs"])
        .query("limit", QueryValue::Str(limit.to_string()))
        .flag("include_docs", include_docs);
    if let Some(start_key) = start_key {
        request = request.query("startkey", QueryValue::Json(Value::String(start_key.into())));
    }

    let response = transport
        .request(request)
        .await
        .map_err(|err| classify_database(err, database))?;

    Ok(serde_json::from_value(response.into_body()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::{collections::BTreeMap, sync::Mutex};

    #[derive(Debug, Default)]
    struct Scripted {
        requests: Mutex<Vec<CouchRequest>>,
        responses: Mutex<Vec<CouchResult<CouchResponse>>>,
    }

    impl Scripted {
        fn answering(responses: Vec<CouchResult<CouchResponse>>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into_iter().rev().collect()),
            }
        }

        fn last_request(&self) -> CouchRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn request(&self, request: CouchRequest) -> CouchResult<CouchResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses.lock().unwrap().pop().unwrap()
        }
    }

    fn ok(body: Value, etag: Option<&str>) -> CouchResult<CouchResponse> {
        let mut headers = BTreeMap::new();
        if let Some(etag) = etag {
            headers.insert("etag".to_string(), etag.to_string());
        }
        Ok(CouchResponse {
            status: 200,
            headers,
            body: Some(body),
        })
    }

    fn status(status: u16) -> CouchResult<CouchResponse> {
        Err(CouchError::Status {
            status,
            error: "error".into(),
            reason: "reason".into(),
        })
    }

    #[tokio::test]
    async fn fetch_passes_flags_and_reads_etag() {
        let transport = Scripted::answering(vec![ok(
            json!({"_id": "a", "_rev": "1-x", "v": 1}),
            Some("\"1-x\""),
        )]);

        let fetched = fetch(&transport, "db", "a", &GetOptions::new().conflicts().rev("1-x"))
            .await
            .unwrap();
        assert_eq!(fetched.token.as_deref(), Some("\"1-x\""));

        let request = transport.last_request();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, vec!["db", "a"]);
        assert_eq!(request.query_value("conflicts"), Some(&QueryValue::Bool(true)));
        assert_eq!(request.query_value("rev"), Some(&QueryValue::Str("1-x".into())));
        assert_eq!(request.query_value("revs"), None);
    }

    #[tokio::test]
    async fn fetch_synthesizes_token_from_revision() {
        let transport = Scripted::answering(vec![ok(json!({"_id": "a", "_rev": "3-y"}), None)]);

        let fetched = fetch(&transport, "db", "a", &GetOptions::new())
            .await
            .unwrap();
        assert_eq!(fetched.token.as_deref(), Some("\"3-y\""));
    }

    #[tokio::test]
    async fn fetch_classifies_failures() {
        let transport = Scripted::answering(vec![
            status(404),
            ok(json!({"_id": "a", "_rev": "2-z", "_deleted": true}), None),
            status(409),
            status(500),
        ]);
        let options = GetOptions::new();

        assert!(matches!(
            fetch(&transport, "db", "a", &options).await,
            Err(CouchError::Missing(db, key)) if db == "db" && key == "a"
        ));
        assert!(matches!(
            fetch(&transport, "db", "a", &options).await,
            Err(CouchError::Deleted(..))
        ));
        assert!(matches!(
            fetch(&transport, "db", "a", &options).await,
            Err(CouchError::Conflict(..))
        ));
        assert!(matches!(
            fetch(&transport, "db", "a", &options).await,
            Err(CouchError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn put_is_conditional_only_with_a_token() {
        let transport = Scripted::answering(vec![
            ok(json!({"ok": true, "id": "a", "rev": "1-a"}), Some("\"1-a\"")),
            ok(json!({"ok": true, "id": "a", "rev": "2-b"}), None),
        ]);

        let created = put(&transport, "db", Some("a"), None, json!({}), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(created.rev.as_deref(), Some("1-a"));
        assert_eq!(created.token.as_deref(), Some("\"1-a\""));
        assert!(transport.last_request().headers.is_empty());

        let updated = put(
            &transport,
            "db",
            Some("a"),
            Some("\"1-a\""),
            json!({}),
            WriteOptions::batch(),
        )
        .await
        .unwrap();
        assert_eq!(updated.token.as_deref(), Some("\"2-b\""));

        let request = transport.last_request();
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.headers.get("If-Match").map(String::as_str), Some("\"1-a\""));
        assert_eq!(request.query_value("batch"), Some(&QueryValue::Str("ok".into())));
    }

    #[tokio::test]
    async fn put_without_key_posts_to_the_database() {
        let transport = Scripted::answering(vec![ok(json!({"ok": true, "id": "gen", "rev": "1-a"}), None)]);

        let result = put(&transport, "db", None, None, json!({}), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.id, "gen");

        let request = transport.last_request();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, vec!["db"]);
    }

    #[tokio::test]
    async fn put_classifies_conflict_and_missing_database() {
        let transport = Scripted::answering(vec![status(409), status(412), status(404)]);

        for _ in 0..2 {
            assert!(matches!(
                put(&transport, "db", Some("a"), Some("\"1-a\""), json!({}), WriteOptions::default()).await,
                Err(CouchError::Conflict(..))
            ));
        }
        assert!(matches!(
            put(&transport, "db", Some("a"), None, json!({}), WriteOptions::default()).await,
            Err(CouchError::Missing(..))
        ));
    }

    #[tokio::test]
    async fn delete_requires_a_token() {
        let transport = Scripted::answering(vec![]);

        assert!(matches!(
            delete(&transport, "db", "a", None, WriteOptions::default()).await,
            Err(CouchError::PreconditionRequired(_))
        ));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_with_stale_token_conflicts() {
        let transport = Scripted::answering(vec![status(409), status(412), status(404)]);

        for _ in 0..2 {
            assert!(matches!(
                delete(&transport, "db", "a", Some("\"1-a\""), WriteOptions::default()).await,
                Err(CouchError::Conflict(db, key)) if db == "db" && key == "a"
            ));
        }
        assert!(matches!(
            delete(&transport, "db", "a", Some("\"1-a\""), WriteOptions::default()).await,
            Err(CouchError::Missing(..))
        ));

        let request = transport.last_request();
        assert_eq!(request.method, Method::Delete);
        assert_eq!(request.path, vec!["db", "a"]);
        assert_eq!(request.headers.get("If-Match").map(String::as_str), Some("\"1-a\""));
    }

    #[tokio::test]
    async fn copy_escapes_the_destination_key() {
        let transport = Scripted::answering(vec![
            ok(json!({"ok": true, "id": "a?b", "rev": "1-c"}), None),
            ok(json!({"ok": true, "id": "_design/caf\u{e9}", "rev": "2-c"}), None),
        ]);

        copy(&transport, "db", "a", "a?b", None, WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            transport.last_request().headers.get("Destination").map(String::as_str),
            Some("a%3Fb")
        );

        copy(&transport, "db", "a", "_design/caf\u{e9}", Some("1-c"), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            transport.last_request().headers.get("Destination").map(String::as_str),
            Some("_design%2Fcaf%C3%A9?rev=1-c")
        );
    }

    #[tokio::test]
    async fn copy_sends_destination_revision() {
        let transport = Scripted::answering(vec![ok(json!({"ok": true, "id": "b", "rev": "3-c"}), None)]);

        copy(&transport, "db", "a", "b", Some("2-b"), WriteOptions::default())
            .await
            .unwrap();

        let request = transport.last_request();
        assert_eq!(request.method, Method::Copy);
        assert_eq!(
            request.headers.get("Destination").map(String::as_str),
            Some("b?rev=2-b")
        );
    }

    #[tokio::test]
    async fn all_docs_encodes_start_key_as_json() {
        let transport = Scripted::answering(vec![ok(
            json!({"total_rows": 1, "offset": 0, "rows": [
                {"id": "b", "key": "b", "value": {"rev": "1-b"}}
            ]}),
            None,
        )]);

        let page = all_docs(&transport, "db", Some("b"), 11, false).await.unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].value.rev, "1-b");

        let request = transport.last_request();
        assert_eq!(request.path, vec!["db", "_all_docs"]);
        assert_eq!(
            request.query_value("startkey").map(QueryValue::render),
            Some("\"b\"".to_string())
        );
        assert_eq!(request.query_value("include_docs"), None);
    }

    #[tokio::test]
    async fn all_docs_on_a_missing_database() {
        let transport = Scripted::answering(vec![status(404)]);

        assert!(matches!(
            all_docs(&transport, "gone", None, 11, true).await,
            Err(CouchError::MissingDatabase(db)) if db == "gone"
        ));
    }
}
