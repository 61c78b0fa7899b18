//! Convenient re-exports of commonly used types from settee.
//!
//! ```ignore
//! use settee::prelude::*;
//! ```
//!
//! This provides access to:
//! - Document traits, the derive macro and the `Stored` envelope
//! - Sessions, databases, mutations and references
//! - The registry and loaders
//! - Transport traits and error types

pub use settee_macros::Document;

pub use settee_core::{
    codec::{BasicLoader, DocumentCodec, Loader},
    database::{Database, DatabaseInfo, Session},
    document::{AnyDocument, Document, DocumentExt, DocumentMeta, DocumentValue, JsonDocument, Stored, TaggedDocument},
    error::{CouchError, CouchResult},
    mutate::Mutation,
    reference::DocRef,
    registry::DocumentRegistry,
    request::{GetOptions, WriteOptions, WriteResult},
    transport::{Transport, TransportBuilder},
};
