//! HTTP transport for settee.
//!
//! This crate provides a `reqwest`-based implementation of the `Transport` trait for talking
//! to a real CouchDB server, plus a [`ServerPool`] that spreads sessions across a fixed list of
//! servers and skips unhealthy ones.
//!
//! To use it, enable the `http` feature of the facade crate:
//!
//! ```toml
//! [dependencies]
//! settee = { version = "x.y.z", features = ["http"] }
//! ```
//!
//! # Connection
//!
//! Servers are addressed by URL; credentials may be embedded in it and are sent as basic
//! authentication. `HttpTransport::from_env()` and `ServerPool::from_env()` read the URL (or a
//! comma-separated list of URLs) from `COUCHDB_URL`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use settee::{Session, http::HttpTransport, transport::TransportBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = HttpTransport::from_env()?.build().await?;
//!     let session = Session::basic(Arc::new(transport));
//!     session.up().await?;
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as settee_http;

pub mod pool;
pub mod transport;

pub use pool::ServerPool;
pub use transport::{COUCHDB_URL_ENV, HttpTransport, HttpTransportBuilder};
