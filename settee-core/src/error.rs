//! Error types and result types for CouchDB client operations.
//!
//! Every fallible operation in this crate returns [`CouchResult<T>`]. The variants fall into
//! three groups:
//!
//! - **Document state** - [`CouchError::Missing`], [`CouchError::MissingDatabase`],
//!   [`CouchError::Conflict`], [`CouchError::Deleted`], [`CouchError::PreconditionRequired`]
//! - **Registry configuration** - tag and type lookup failures raised by
//!   [`DocumentRegistry`](crate::registry::DocumentRegistry). These are programmer errors and
//!   are never retried.
//! - **Transport** - unclassified HTTP statuses and client failures, propagated unchanged.
//!
//! Only [`CouchError::Conflict`] is recovered from locally, by the mutation loop in
//! [`mutate`](crate::mutate).

use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when talking to a CouchDB server.
#[derive(Error, Debug)]
pub enum CouchError {
    /// The document does not exist, or its database does not. Arguments are the database and the key.
    #[error("Document {1} not found in database {0}")]
    Missing(String, String),
    /// A database-level request found no such database.
    #[error("Database {0} not found")]
    MissingDatabase(String),
    /// The write precondition failed: the concurrency token is stale or the document already
    /// exists. Arguments are the database and the key.
    #[error("Conflicting revision for document {1} in database {0}")]
    Conflict(String, String),
    /// The document exists but is a tombstone. Arguments are the database and the key.
    #[error("Document {1} in database {0} is deleted")]
    Deleted(String, String),
    /// The operation needs a concurrency token and the document carries none.
    #[error("Precondition required: {0}")]
    PreconditionRequired(String),
    /// No type is registered for the tag found in a stored document.
    #[error("Unknown document tag: {0}")]
    UnknownTag(String),
    /// A stored document carries no type tag.
    #[error("Document has no '{0}' tag field")]
    UntaggedDocument(String),
    /// Neither the document's type nor any declared supertype is registered.
    #[error("Unregistered document type: {0}")]
    UnregisteredType(&'static str),
    /// A type resolves to more than one registered tag.
    #[error("Ambiguous document type {0}: matches tags {1:?}")]
    AmbiguousType(&'static str, Vec<String>),
    /// The tag is already registered.
    #[error("Duplicate document tag: {0}")]
    DuplicateTag(String),
    /// The tag (or tag field name) is empty or malformed.
    #[error("Invalid document tag: {0}")]
    InvalidTag(String),
    /// A migration or subtype refers to a type that was never registered.
    #[error("Unknown document type: {0}")]
    UnknownType(&'static str),
    /// The tag already has an outgoing migration edge.
    #[error("Tag {0} already migrates to {1}")]
    NonLinearMigration(String, String),
    /// Following the migration chain did not terminate.
    #[error("Migration cycle detected starting at tag {0}")]
    MigrationCycle(String),
    /// The decoded document is not of the requested Rust type.
    #[error("Expected document of type {expected}, found {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },
    /// The document violates the structure expected by the codec.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// Serialization/deserialization error when converting between documents and JSON.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The server answered with a non-2xx status that has no dedicated variant.
    #[error("HTTP {status}: {error} ({reason})")]
    Status {
        status: u16,
        error: String,
        reason: String,
    },
    /// The request could not be performed (connection, timeout, malformed response).
    #[error("Transport error: {0}")]
    Transport(String),
    /// No server in the pool answered its health check.
    #[error("No CouchDB server available: {0}")]
    Unavailable(String),
    /// Invalid client configuration (bad URL, missing environment variable).
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CouchError {
    /// Returns `true` for errors the mutation loop recovers from by re-fetching.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CouchError::Conflict(..))
    }

    /// Returns the HTTP status carried by a transport-level error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            CouchError::Status { status, .. } => Some(*status),
            CouchError::Missing(..) | CouchError::MissingDatabase(_) => Some(404),
            CouchError::Conflict(..) => Some(409),
            _ => None,
        }
    }
}

/// A specialized `Result` type for CouchDB client operations.
pub type CouchResult<T> = Result<T, CouchError>;

impl From<SerdeJsonError> for CouchError {
    fn from(err: SerdeJsonError) -> Self {
        CouchError::Serialization(err.to_string())
    }
}
