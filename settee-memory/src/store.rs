//! In-memory emulation of the CouchDB HTTP document API.
//!
//! Documents are kept per database in ordered maps, each with its full revision history so that
//! tombstones and old revisions can be read back by `rev`. Conditional writes follow CouchDB:
//! an update must name the winning revision (via `If-Match`, a `rev` query parameter or the
//! body's `_rev`), a create must name none.

use async_trait::async_trait;
use mea::rwlock::RwLock;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value, json};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tracing::debug;
use uuid::Uuid;

use settee_core::{
    error::{CouchError, CouchResult},
    transport::{CouchRequest, CouchResponse, Method, QueryValue, Transport, TransportBuilder},
};

#[derive(Debug, Clone)]
struct Revision {
    rev: String,
    /// `None` for a tombstone.
    body: Option<Map<String, Value>>,
}

impl Revision {
    fn generation(&self) -> u64 {
        self.rev
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }

    fn is_deleted(&self) -> bool {
        self.body.is_none()
    }
}

#[derive(Debug, Default, Clone)]
struct History {
    revisions: Vec<Revision>,
}

impl History {
    fn winner(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    fn live(&self) -> Option<&Revision> {
        self.winner().filter(|rev| !rev.is_deleted())
    }

    fn position(&self, rev: &str) -> Option<usize> {
        self.revisions.iter().position(|r| r.rev == rev)
    }

    fn next_rev(&self) -> String {
        let generation = self.winner().map_or(0, Revision::generation) + 1;
        format!("{generation}-{}", Uuid::new_v4().simple())
    }
}

type DatabaseMap = BTreeMap<String, History>;
type ServerMap = BTreeMap<String, DatabaseMap>;

/// Thread-safe in-memory CouchDB server.
///
/// Implements [`Transport`] by answering requests the way a CouchDB server would, so the
/// whole client stack can run without a network. Cloning is cheap and every clone shares the
/// same data.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use settee::{Session, memory::InMemoryCouch};
///
/// let couch = InMemoryCouch::builder().database("users").build().await?;
/// let session = Session::basic(Arc::new(couch.clone()));
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryCouch {
    server: Arc<RwLock<ServerMap>>,
    requests: Arc<AtomicUsize>,
}

impl Default for InMemoryCouch {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCouch {
    /// Creates a server with no databases.
    pub fn new() -> Self {
        Self::with_databases(ServerMap::new())
    }

    fn with_databases(databases: ServerMap) -> Self {
        Self {
            server: Arc::new(RwLock::new(databases)),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn builder() -> InMemoryCouchBuilder {
        InMemoryCouchBuilder::default()
    }

    /// Creates a database if it does not exist yet.
    pub async fn create_database(&self, name: &str) {
        self.server
            .write()
            .await
            .entry(name.to_string())
            .or_default();
    }

    /// Number of requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn handle(&self, request: &CouchRequest) -> CouchResult<CouchResponse> {
        let path: Vec<&str> = request.path.iter().map(String::as_str).collect();

        match (request.method, path.as_slice()) {
            (Method::Get, ["_up"]) => Ok(respond(200, json!({"status": "ok"}))),
            (Method::Get, ["_all_dbs"]) => {
                let names: Vec<String> = self.server.read().await.keys().cloned().collect();
                Ok(respond(200, json!(names)))
            }
            (Method::Get, [db]) => database_info(&*self.server.read().await, db),
            (Method::Put, [db]) => create_database(&mut *self.server.write().await, db),
            (Method::Delete, [db]) => drop_database(&mut *self.server.write().await, db),
            (Method::Post, [db]) => post_document(&mut *self.server.write().await, db, request),
            (Method::Get, [db, "_all_docs"]) => all_docs(&*self.server.read().await, db, request),
            (Method::Get, [db, key]) => get_document(&*self.server.read().await, db, key, request),
            (Method::Put, [db, key]) => {
                put_document(&mut *self.server.write().await, db, key, request)
            }
            (Method::Delete, [db, key]) => {
                delete_document(&mut *self.server.write().await, db, key, request)
            }
            (Method::Copy, [db, key]) => {
                copy_document(&mut *self.server.write().await, db, key, request)
            }
            _ => Err(failure(400, "bad_request", "Unsupported request")),
        }
    }
}

#[async_trait]
impl Transport for InMemoryCouch {
    async fn request(&self, request: CouchRequest) -> CouchResult<CouchResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        debug!(method = request.method.as_str(), path = ?request.path, "in-memory request");

        self.handle(&request).await
    }
}

fn respond(status: u16, body: Value) -> CouchResponse {
    CouchResponse {
        status,
        headers: BTreeMap::new(),
        body: Some(body),
    }
}

fn with_etag(mut response: CouchResponse, rev: &str) -> CouchResponse {
    response
        .headers
        .insert("etag".to_string(), format!("\"{rev}\""));
    response
}

fn failure(status: u16, error: &str, reason: &str) -> CouchError {
    CouchError::Status {
        status,
        error: error.to_string(),
        reason: reason.to_string(),
    }
}

fn conflict() -> CouchError {
    failure(409, "conflict", "Document update conflict.")
}

fn no_database() -> CouchError {
    failure(404, "not_found", "Database does not exist.")
}

fn param(request: &CouchRequest, name: &str) -> Option<String> {
    request.query_value(name).map(QueryValue::render)
}

fn flag(request: &CouchRequest, name: &str) -> bool {
    param(request, name).as_deref() == Some("true")
}

fn header<'a>(request: &'a CouchRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn json_param(request: &CouchRequest, name: &str) -> CouchResult<Option<String>> {
    param(request, name)
        .map(|raw| {
            serde_json::from_str::<String>(&raw)
                .map_err(|_| failure(400, "bad_request", &format!("Invalid {name}: {raw}")))
        })
        .transpose()
}

fn number_param(request: &CouchRequest, name: &str) -> CouchResult<Option<usize>> {
    param(request, name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| failure(400, "bad_request", &format!("Invalid {name}: {raw}")))
        })
        .transpose()
}

/// The revision a write claims to replace.
fn expected_rev(request: &CouchRequest, body: Option<&Map<String, Value>>) -> Option<String> {
    header(request, "If-Match")
        .map(|token| token.trim_matches('"').to_string())
        .or_else(|| param(request, "rev"))
        .or_else(|| {
            body.and_then(|body| body.get("_rev"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

/// Splits an incoming body into its content and whether it asks for deletion.
fn content_of(body: Map<String, Value>) -> Option<Map<String, Value>> {
    if body.get("_deleted").and_then(Value::as_bool) == Some(true) {
        return None;
    }

    Some(
        body.into_iter()
            .filter(|(field, _)| !field.starts_with('_'))
            .collect(),
    )
}

fn request_body(request: &CouchRequest) -> CouchResult<Map<String, Value>> {
    match &request.body {
        Some(Value::Object(body)) => Ok(body.clone()),
        _ => Err(failure(400, "bad_request", "Document must be a JSON object")),
    }
}

fn write_response(request: &CouchRequest, key: &str, rev: &str) -> CouchResponse {
    if param(request, "batch").as_deref() == Some("ok") {
        return respond(202, json!({"ok": true, "id": key}));
    }

    with_etag(respond(201, json!({"ok": true, "id": key, "rev": rev})), rev)
}

/// Appends a revision, enforcing the conditional-write rules.
fn write(
    db: &mut DatabaseMap,
    key: &str,
    expected: Option<&str>,
    content: Option<Map<String, Value>>,
) -> CouchResult<String> {
    match (db.get(key).and_then(History::winner), expected) {
        (Some(winner), Some(expected)) if winner.rev == expected => {}
        (Some(winner), None) if winner.is_deleted() => {}
        (None, None) => {}
        _ => return Err(conflict()),
    }

    let history = db.entry(key.to_string()).or_default();
    let rev = history.next_rev();
    let body = content.map(|mut content| {
        content.insert("_id".to_string(), Value::String(key.to_string()));
        content.insert("_rev".to_string(), Value::String(rev.clone()));
        content
    });
    history.revisions.push(Revision {
        rev: rev.clone(),
        body,
    });

    Ok(rev)
}

fn database_info(server: &ServerMap, name: &str) -> CouchResult<CouchResponse> {
    let db = server.get(name).ok_or_else(no_database)?;
    let doc_count = db.values().filter(|history| history.live().is_some()).count();
    let update_seq: usize = db.values().map(|history| history.revisions.len()).sum();

    Ok(respond(
        200,
        json!({
            "db_name": name,
            "doc_count": doc_count,
            "doc_del_count": db.len() - doc_count,
            "update_seq": update_seq.to_string(),
        }),
    ))
}

fn create_database(server: &mut ServerMap, name: &str) -> CouchResult<CouchResponse> {
    if server.contains_key(name) {
        return Err(failure(
            412,
            "file_exists",
            "The database could not be created, the file already exists.",
        ));
    }

    server.insert(name.to_string(), DatabaseMap::new());
    Ok(respond(201, json!({"ok": true})))
}

fn drop_database(server: &mut ServerMap, name: &str) -> CouchResult<CouchResponse> {
    server.remove(name).ok_or_else(no_database)?;
    Ok(respond(200, json!({"ok": true})))
}

fn get_document(
    server: &ServerMap,
    name: &str,
    key: &str,
    request: &CouchRequest,
) -> CouchResult<CouchResponse> {
    let history = server
        .get(name)
        .ok_or_else(no_database)?
        .get(key)
        .ok_or_else(|| failure(404, "not_found", "missing"))?;

    let position = match param(request, "rev") {
        Some(rev) => history
            .position(&rev)
            .ok_or_else(|| failure(404, "not_found", "missing"))?,
        None if history.live().is_some() => history.revisions.len() - 1,
        None => return Err(failure(404, "not_found", "deleted")),
    };
    let revision = &history.revisions[position];

    let mut body = match &revision.body {
        Some(body) => body.clone(),
        None => {
            let mut tombstone = Map::new();
            tombstone.insert("_id".to_string(), Value::String(key.to_string()));
            tombstone.insert("_rev".to_string(), Value::String(revision.rev.clone()));
            tombstone.insert("_deleted".to_string(), Value::Bool(true));
            tombstone
        }
    };

    let ancestry = history.revisions[..=position].iter().rev();
    if flag(request, "revs") {
        let ids: Vec<&str> = ancestry
            .clone()
            .map(|rev| rev.rev.split_once('-').map_or("", |(_, hash)| hash))
            .collect();
        body.insert(
            "_revisions".to_string(),
            json!({"start": revision.generation(), "ids": ids}),
        );
    }
    if flag(request, "revs_info") {
        let info: Vec<Value> = ancestry
            .map(|rev| {
                let status = if rev.is_deleted() { "deleted" } else { "available" };
                json!({"rev": rev.rev, "status": status})
            })
            .collect();
        body.insert("_revs_info".to_string(), Value::Array(info));
    }

    Ok(with_etag(respond(200, Value::Object(body)), &revision.rev))
}

fn put_document(
    server: &mut ServerMap,
    name: &str,
    key: &str,
    request: &CouchRequest,
) -> CouchResult<CouchResponse> {
    let body = request_body(request)?;
    let expected = expected_rev(request, Some(&body));
    let db = server.get_mut(name).ok_or_else(no_database)?;

    let rev = write(db, key, expected.as_deref(), content_of(body))?;
    Ok(write_response(request, key, &rev))
}

fn post_document(
    server: &mut ServerMap,
    name: &str,
    request: &CouchRequest,
) -> CouchResult<CouchResponse> {
    let body = request_body(request)?;
    let key = body
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let expected = expected_rev(request, Some(&body));
    let db = server.get_mut(name).ok_or_else(no_database)?;

    let rev = write(db, &key, expected.as_deref(), content_of(body))?;
    Ok(write_response(request, &key, &rev))
}

fn delete_document(
    server: &mut ServerMap,
    name: &str,
    key: &str,
    request: &CouchRequest,
) -> CouchResult<CouchResponse> {
    let db = server.get_mut(name).ok_or_else(no_database)?;
    if db.get(key).and_then(History::live).is_none() {
        return Err(failure(404, "not_found", "missing"));
    }

    let expected = expected_rev(request, None).ok_or_else(conflict)?;
    let rev = write(db, key, Some(&expected), None)?;
    Ok(write_response(request, key, &rev))
}

fn copy_document(
    server: &mut ServerMap,
    name: &str,
    source: &str,
    request: &CouchRequest,
) -> CouchResult<CouchResponse> {
    let destination = header(request, "Destination")
        .ok_or_else(|| failure(400, "bad_request", "Destination header is mandatory for COPY."))?;
    let (destination, destination_rev) = match destination.split_once('?') {
        Some((key, query)) => (key, query.strip_prefix("rev=")),
        None => (destination, None),
    };
    let destination = percent_decode_str(destination)
        .decode_utf8()
        .map_err(|_| failure(400, "bad_request", "Destination is not valid UTF-8."))?;

    let db = server.get_mut(name).ok_or_else(no_database)?;
    let content = db
        .get(source)
        .and_then(History::live)
        .and_then(|rev| rev.body.clone())
        .ok_or_else(|| failure(404, "not_found", "missing"))?;

    let rev = write(db, &destination, destination_rev, content_of(content))?;
    Ok(write_response(request, &destination, &rev))
}

fn all_docs(server: &ServerMap, name: &str, request: &CouchRequest) -> CouchResult<CouchResponse> {
    let db = server.get(name).ok_or_else(no_database)?;
    let include_docs = flag(request, "include_docs");
    let start_key = json_param(request, "startkey")?;
    let end_key = json_param(request, "endkey")?;
    let skip = number_param(request, "skip")?.unwrap_or(0);
    let limit = number_param(request, "limit")?.unwrap_or(usize::MAX);

    let live: Vec<(&String, &Revision)> = db
        .iter()
        .filter_map(|(key, history)| history.live().map(|rev| (key, rev)))
        .collect();
    let total_rows = live.len();
    let before_start = live
        .iter()
        .take_while(|(key, _)| start_key.as_deref().is_some_and(|start| key.as_str() < start))
        .count();

    let rows: Vec<Value> = live
        .into_iter()
        .skip(before_start)
        .take_while(|(key, _)| end_key.as_deref().is_none_or(|end| key.as_str() <= end))
        .skip(skip)
        .take(limit)
        .map(|(key, rev)| {
            let mut row = json!({"id": key, "key": key, "value": {"rev": rev.rev}});
            if include_docs {
                row["doc"] = Value::Object(rev.body.clone().unwrap_or_default());
            }
            row
        })
        .collect();

    Ok(respond(
        200,
        json!({
            "total_rows": total_rows,
            "offset": before_start + skip,
            "rows": rows,
        }),
    ))
}

/// Builder for constructing [`InMemoryCouch`] instances.
///
/// # Example
///
/// ```ignore
/// use settee::transport::TransportBuilder;
/// use settee::memory::InMemoryCouch;
///
/// let couch = InMemoryCouch::builder()
///     .database("users")
///     .database("orders")
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryCouchBuilder {
    databases: Vec<String>,
}

impl InMemoryCouchBuilder {
    /// Creates the named database up front.
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.databases.push(name.into());
        self
    }
}

#[async_trait]
impl TransportBuilder for InMemoryCouchBuilder {
    type Transport = InMemoryCouch;

    async fn build(self) -> CouchResult<Self::Transport> {
        let databases = self
            .databases
            .into_iter()
            .map(|name| (name, DatabaseMap::new()))
            .collect();

        Ok(InMemoryCouch::with_databases(databases))
    }
}
