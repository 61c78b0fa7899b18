//! A typed CouchDB client with optimistic-concurrency mutations and versioned document types.
//!
//! This crate is the primary entry point for users of settee. It re-exports the core types
//! from the sub-crates and gives access to the available transports.
//!
//! # Features
//!
//! - **Typed documents** - Plain Serde types, with storage metadata kept in a [`Stored`](document::Stored) envelope
//! - **Versioned schemas** - A registry of type tags with linear, eagerly validated migration chains
//! - **Lost-update freedom** - Conditional writes and a retrying read-modify-write loop
//! - **Lazy listings** - Paged `_all_docs` streams of references that fetch on demand
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use settee::{prelude::*, memory::InMemoryCouch};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Document)]
//! #[document(tag = "counter")]
//! pub struct Counter {
//!     pub count: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> CouchResult<()> {
//!     let couch = InMemoryCouch::builder().database("counters").build().await?;
//!
//!     let mut registry = DocumentRegistry::new();
//!     registry.register_tagged::<Counter>()?;
//!
//!     let session = Session::new(Arc::new(couch), Arc::new(registry));
//!     let db = session.database("counters");
//!
//!     let mut doc = Stored::new(Counter { count: 0 }).with_key("visits");
//!     db.attempt_put(&mut doc).await?;
//!
//!     let doc = db.mutate_with("visits", |c: &mut Counter| c.count += 1).await?;
//!     assert_eq!(doc.count, 1);
//!     Ok(())
//! }
//! ```
//!
//! # Migrations
//!
//! Each schema version gets its own type and tag. Stored documents keep the tag they were
//! written with and are upgraded step by step when read:
//!
//! ```ignore
//! let mut registry = DocumentRegistry::new();
//! registry.register::<UserV1>("user")?;
//! registry.register::<UserV2>("user-v2")?;
//! registry.register_migration(|old: UserV1| UserV2 { name: old.name, email: None })?;
//!
//! // A document stored as "user" now decodes as UserV2.
//! ```
//!
//! # Transports
//!
//! - [`memory`] - In-process CouchDB emulation for development and testing
//! - `http` - A real server over HTTP (requires the `http` feature)

pub mod prelude;

pub use settee_core::{
    codec, database, document, error, mutate, reference, registry, request, transport,
};
pub use settee_core::database::{Database, Session};

// Re-export JSON types for convenience
pub use serde_json;

/// In-memory transport implementations.
pub mod memory {
    pub use settee_memory::{InMemoryCouch, InMemoryCouchBuilder};
}

/// HTTP transport implementations.
///
/// This module is only available when the `http` feature is enabled.
#[cfg(feature = "http")]
pub mod http {
    pub use settee_http::{COUCHDB_URL_ENV, HttpTransport, HttpTransportBuilder, ServerPool};
}
