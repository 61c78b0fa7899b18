//! A typed CouchDB document client with schema migrations and optimistic concurrency.
//!
//! This crate is the core of the settee project and provides:
//!
//! - **Document traits** ([`document`]) - Document marker traits, the [`Stored`](document::Stored)
//!   envelope and type-erased documents
//! - **Transport abstraction** ([`transport`]) - The single-exchange HTTP interface backends implement
//! - **Codec** ([`codec`]) - Reserved-field handling and pluggable loaders
//! - **Registry** ([`registry`]) - Type tags, is-a relations and linear migration chains
//! - **Conditional requests** ([`request`]) - `ETag` / `If-Match` handling and error classification
//! - **Sessions and databases** ([`database`]) - The main interface for reading and writing
//! - **Mutation engine** ([`mutate`]) - Retrying read-modify-write loops
//! - **References** ([`reference`]) - Lazily resolved listing results
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use settee::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Document)]
//! #[document(tag = "counter")]
//! pub struct Counter {
//!     pub count: i64,
//! }
//!
//! let mut registry = DocumentRegistry::new();
//! registry.register_tagged::<Counter>()?;
//!
//! let session = Session::new(Arc::new(transport), Arc::new(registry));
//! let db = session.database("counters");
//! db.mutate_with("visits", |c: &mut Counter| c.count += 1).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as settee_core;

pub mod codec;
pub mod database;
pub mod document;
pub mod error;
pub mod mutate;
pub mod reference;
pub mod registry;
pub mod request;
pub mod transport;
