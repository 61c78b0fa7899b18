//! A constant pool of interchangeable CouchDB servers.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing::{debug, warn};

use settee_core::{
    codec::Loader,
    database::Session,
    error::{CouchError, CouchResult},
    transport::{CouchRequest, Method, Transport, TransportBuilder},
};

use crate::transport::{COUCHDB_URL_ENV, HttpTransport};

/// Picks a healthy server from a fixed list.
///
/// Every call to [`ServerPool::connect`] starts from the next server in turn, so sessions are
/// spread across the pool, and skips servers that fail their `GET /_up` check.
#[derive(Debug)]
pub struct ServerPool {
    servers: Vec<HttpTransport>,
    next: AtomicUsize,
}

impl ServerPool {
    pub fn new(servers: Vec<HttpTransport>) -> Self {
        Self {
            servers,
            next: AtomicUsize::new(0),
        }
    }

    /// Builds a pool of default-configured transports.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Configuration`] if any URL is invalid.
    pub async fn from_urls<I, S>(urls: I) -> CouchResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut servers = Vec::new();
        for url in urls {
            servers.push(HttpTransport::builder(url.as_ref()).build().await?);
        }

        Ok(Self::new(servers))
    }

    /// Builds a pool from the comma-separated URLs in `COUCHDB_URL`.
    pub async fn from_env() -> CouchResult<Self> {
        let urls = std::env::var(COUCHDB_URL_ENV).map_err(|_| {
            CouchError::Configuration(format!("{COUCHDB_URL_ENV} is not set"))
        })?;

        Self::from_urls(urls.split(',').map(str::trim).filter(|url| !url.is_empty())).await
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Returns a transport bound to the first server that passes its health check.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Unavailable`] if the pool is empty or no server is healthy.
    pub async fn connect(&self) -> CouchResult<HttpTransport> {
        if self.servers.is_empty() {
            return Err(CouchError::Unavailable("no servers configured".into()));
        }

        let count = self.servers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;

        for offset in 0..count {
            let server = &self.servers[(start + offset) % count];

            match server.request(CouchRequest::new(Method::Get, ["_up"])).await {
                Ok(_) => {
                    debug!(url = %server.base_url(), "selected server");
                    return Ok(server.clone());
                }
                Err(err) => {
                    warn!(url = %server.base_url(), error = %err, "server failed health check");
                }
            }
        }

        Err(CouchError::Unavailable(format!(
            "none of {count} servers passed the health check"
        )))
    }

    /// Connects and opens a session on the selected server.
    pub async fn session(&self, loader: Arc<dyn Loader>) -> CouchResult<Session> {
        Ok(Session::new(Arc::new(self.connect().await?), loader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_pool_is_unavailable() {
        let pool = ServerPool::new(Vec::new());

        assert!(pool.is_empty());
        assert!(matches!(pool.connect().await, Err(CouchError::Unavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_servers_are_skipped() {
        let mut servers = Vec::new();
        for port in [1, 2] {
            servers.push(
                HttpTransport::builder(&format!("http://127.0.0.1:{port}"))
                    .timeout(Duration::from_secs(2))
                    .build()
                    .await
                    .unwrap(),
            );
        }
        let pool = ServerPool::new(servers);

        assert_eq!(pool.len(), 2);
        assert!(matches!(pool.connect().await, Err(CouchError::Unavailable(_))));
    }

    #[tokio::test]
    async fn invalid_url_fails_the_whole_pool() {
        assert!(matches!(
            ServerPool::from_urls(["http://localhost:5984", "nope"]).await,
            Err(CouchError::Configuration(_))
        ));
    }
}
