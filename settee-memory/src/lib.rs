//! In-memory CouchDB server for settee.
//!
//! This crate provides [`InMemoryCouch`], a thread-safe implementation of the `Transport` trait
//! that answers requests the way a CouchDB server would. It is meant for development and
//! testing: the full client stack (conditional writes, conflicts, tombstones, listings) runs
//! against it unchanged.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using an async-aware RwLock
//! - **Revision history** - Old revisions and tombstones stay readable by `rev`
//! - **Conditional writes** - `If-Match`, `rev` and `_rev` preconditions with 409 conflicts
//! - **Listings** - `_all_docs` with `startkey`, `endkey`, `skip`, `limit` and `include_docs`
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use settee::{Session, memory::InMemoryCouch, transport::TransportBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let couch = InMemoryCouch::builder().database("users").build().await?;
//!     let session = Session::basic(Arc::new(couch));
//!
//!     assert_eq!(session.all_dbs().await?, vec!["users".to_string()]);
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as settee_memory;

pub mod store;

pub use store::{InMemoryCouch, InMemoryCouchBuilder};
