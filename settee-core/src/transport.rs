//! Transport abstraction the client is built on.
//!
//! A [`Transport`] performs a single HTTP exchange with a CouchDB server. The core never
//! touches sockets itself: everything it needs is expressed as a [`CouchRequest`] and read
//! back from a [`CouchResponse`]. Implementations live in other crates (`settee-http` for a
//! real server, `settee-memory` for an in-process emulation).
//!
//! # Contract
//!
//! - Path segments are raw; the transport is responsible for percent-encoding them.
//! - Header names in a [`CouchResponse`] are lowercase.
//! - A non-2xx status must be reported as [`CouchError::Status`] carrying the status code and
//!   the `error`/`reason` pair from the CouchDB error body. Classification into domain errors
//!   happens in [`request`](crate::request), not here.

use async_trait::async_trait;
use serde_json::Value;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use crate::error::{CouchError, CouchResult};

/// HTTP methods used by the CouchDB document API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
    /// CouchDB's non-standard `COPY` verb.
    Copy,
}

impl Method {
    /// Returns the method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Copy => "COPY",
        }
    }
}

/// A query string value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// Rendered as `true` / `false`.
    Bool(bool),
    /// Rendered verbatim.
    Str(String),
    /// Rendered as its JSON encoding (CouchDB expects this for keys such as `startkey`).
    Json(Value),
}

impl QueryValue {
    /// Renders the value the way it appears in the query string, before URL encoding.
    pub fn render(&self) -> String {
        match self {
            QueryValue::Bool(b) => b.to_string(),
            QueryValue::Str(s) => s.clone(),
            QueryValue::Json(v) => v.to_string(),
        }
    }
}

/// A single request to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct CouchRequest {
    pub method: Method,
    pub path: Vec<String>,
    pub query: Vec<(String, QueryValue)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl CouchRequest {
    /// Starts a request for the given method and path segments.
    pub fn new<I, S>(method: Method, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            path: path.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Adds a query parameter.
    pub fn query(mut self, name: &str, value: QueryValue) -> Self {
        self.query.push((name.to_string(), value));
        self
    }

    /// Adds a boolean flag, omitting it entirely when `false`.
    pub fn flag(self, name: &str, enabled: bool) -> Self {
        if enabled {
            self.query(name, QueryValue::Bool(true))
        } else {
            self
        }
    }

    /// Adds an optional header; `None` leaves the request unchanged.
    pub fn header(mut self, name: &str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.headers.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Sets the JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the value of a query parameter, if present.
    pub fn query_value(&self, name: &str) -> Option<&QueryValue> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CouchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl CouchResponse {
    /// Returns a header by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the body, failing if the server sent none.
    pub fn into_body(self) -> CouchResult<Value> {
        self.body
            .ok_or_else(|| CouchError::Transport("Expected a response body".into()))
    }
}

/// Performs HTTP exchanges with a CouchDB server.
///
/// Implementations must be thread-safe: many mutation loops share one transport.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Sends `request` and returns the response, or [`CouchError::Status`] for a non-2xx
    /// status.
    async fn request(&self, request: CouchRequest) -> CouchResult<CouchResponse>;
}

#[async_trait]
impl<T> Transport for &T
where
    T: Transport + ?Sized,
{
    async fn request(&self, request: CouchRequest) -> CouchResult<CouchResponse> {
        (**self).request(request).await
    }
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn request(&self, request: CouchRequest) -> CouchResult<CouchResponse> {
        (**self).request(request).await
    }
}

/// Factory trait for creating transports.
#[async_trait]
pub trait TransportBuilder {
    type Transport: Transport;

    async fn build(self) -> CouchResult<Self::Transport>;
}
