//! Optimistic read-modify-write.
//!
//! A [`Mutation`] drives the loop
//!
//! ```text
//! Fetching -> Yielded -> (write) -> Committed
//!                ^            |
//!                +-- Conflict +
//! ```
//!
//! Each call to [`Mutation::next`] either fetches and yields a fresh copy of the document, or
//! writes the copy yielded by the previous call. A conflicting write discards the caller's
//! edits and goes back to fetching, so the caller always edits the latest revision and no
//! concurrent update is ever overwritten.
//!
//! ```ignore
//! let mut mutation = db.mutate::<Counter>("visits");
//! while let Some(doc) = mutation.next().await? {
//!     doc.count += 1;
//! }
//! let committed = mutation.into_committed();
//! ```

use std::mem;
use tracing::debug;

use crate::{
    database::Database,
    document::{DocumentValue, Stored},
    error::CouchResult,
};

enum State<T> {
    Fetching,
    Yielded(Stored<T>),
    Committed(Stored<T>),
    /// An error ended the loop, or a step was cancelled mid-flight.
    Failed,
}

/// A read-modify-write loop on a single document.
///
/// Created by [`Database::mutate`]. Dropping it between steps abandons the loop; since nothing
/// is written until the next step, an abandoned loop leaves the stored document untouched.
pub struct Mutation<T> {
    database: Database,
    key: String,
    state: State<T>,
    attempts: usize,
}

impl<T: DocumentValue> Mutation<T> {
    pub(crate) fn new(database: Database, key: String) -> Self {
        Self {
            database,
            key,
            state: State::Fetching,
            attempts: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of copies yielded so far. A loop that never hit a conflict reports one.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, State::Committed(_))
    }

    /// Advances the loop.
    ///
    /// Returns the next copy to edit, or `None` once the previous copy has been written. After
    /// `None` (or an error) every further call returns `None`.
    ///
    /// # Errors
    ///
    /// Propagates every error except [`CouchError::Conflict`](crate::error::CouchError::Conflict)
    /// on write, which restarts the loop.
    pub async fn next(&mut self) -> CouchResult<Option<&mut Stored<T>>> {
        loop {
            match mem::replace(&mut self.state, State::Failed) {
                State::Fetching => {
                    let doc = self.database.get::<T>(&self.key).await?;
                    self.attempts += 1;
                    self.state = State::Yielded(doc);
                    break;
                }
                State::Yielded(mut doc) => match self.database.attempt_put(&mut doc).await {
                    Ok(()) => {
                        debug!(
                            database = self.database.name(),
                            key = %self.key,
                            attempts = self.attempts,
                            "mutation committed"
                        );
                        self.state = State::Committed(doc);
                        break;
                    }
                    Err(err) if err.is_conflict() => {
                        debug!(
                            database = self.database.name(),
                            key = %self.key,
                            attempts = self.attempts,
                            "write conflict, refetching"
                        );
                        self.state = State::Fetching;
                    }
                    Err(err) => return Err(err),
                },
                state @ (State::Committed(_) | State::Failed) => {
                    self.state = state;
                    break;
                }
            }
        }

        match &mut self.state {
            State::Yielded(doc) => Ok(Some(doc)),
            _ => Ok(None),
        }
    }

    /// Returns the written document, with its new revision and token, once committed.
    pub fn into_committed(self) -> Option<Stored<T>> {
        match self.state {
            State::Committed(doc) => Some(doc),
            _ => None,
        }
    }
}

impl<T> std::fmt::Debug for Mutation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Fetching => "fetching",
            State::Yielded(_) => "yielded",
            State::Committed(_) => "committed",
            State::Failed => "failed",
        };

        f.debug_struct("Mutation")
            .field("database", &self.database.name())
            .field("key", &self.key)
            .field("state", &state)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::BasicLoader,
        database::Session,
        document::JsonDocument,
        error::CouchError,
        transport::{CouchRequest, CouchResponse, Method, Transport},
    };
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    /// Serves one document whose revision is bumped behind the client's back a fixed number
    /// of times, so the first writes conflict.
    #[derive(Debug)]
    struct Contended {
        state: Mutex<(u32, i64)>,
        interference: Mutex<u32>,
        puts: Mutex<Vec<Value>>,
    }

    impl Contended {
        fn new(interference: u32) -> Self {
            Self {
                state: Mutex::new((1, 0)),
                interference: Mutex::new(interference),
                puts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for Contended {
        async fn request(&self, request: CouchRequest) -> CouchResult<CouchResponse> {
            let mut state = self.state.lock().unwrap();
            match request.method {
                Method::Get => Ok(CouchResponse {
                    status: 200,
                    headers: BTreeMap::new(),
                    body: Some(json!({
                        "_id": "counter",
                        "_rev": format!("{}-x", state.0),
                        "count": state.1,
                    })),
                }),
                Method::Put => {
                    let mut interference = self.interference.lock().unwrap();
                    if *interference > 0 {
                        *interference -= 1;
                        state.0 += 1;
                        state.1 += 100;
                    }

                    let expected = format!("\"{}-x\"", state.0);
                    if request.headers.get("If-Match") != Some(&expected) {
                        return Err(CouchError::Status {
                            status: 409,
                            error: "conflict".into(),
                            reason: "Document update conflict.".into(),
                        });
                    }

                    let body = request.body.unwrap_or_default();
                    state.0 += 1;
                    state.1 = body["count"].as_i64().unwrap_or_default();
                    self.puts.lock().unwrap().push(body);

                    Ok(CouchResponse {
                        status: 201,
                        headers: BTreeMap::new(),
                        body: Some(json!({
                            "ok": true,
                            "id": "counter",
                            "rev": format!("{}-x", state.0),
                        })),
                    })
                }
                _ => unreachable!(),
            }
        }
    }

    fn database(transport: Arc<Contended>) -> Database {
        Session::new(transport, Arc::new(BasicLoader)).database("db")
    }

    fn increment(doc: &mut JsonDocument) {
        let count = doc["count"].as_i64().unwrap_or_default();
        doc.insert("count".into(), json!(count + 1));
    }

    #[tokio::test]
    async fn uncontended_mutation_commits_on_first_attempt() {
        let transport = Arc::new(Contended::new(0));
        let mut mutation = database(transport.clone()).mutate::<JsonDocument>("counter");

        while let Some(doc) = mutation.next().await.unwrap() {
            increment(doc);
        }

        assert_eq!(mutation.attempts(), 1);
        assert!(mutation.is_committed());
        assert!(mutation.next().await.unwrap().is_none());

        let committed = mutation.into_committed().unwrap();
        assert_eq!(committed.rev(), Some("2-x"));
        assert_eq!(committed.token(), Some("\"2-x\""));
        assert_eq!(committed["count"], 1);
    }

    #[tokio::test]
    async fn conflicts_refetch_and_reapply() {
        let transport = Arc::new(Contended::new(2));

        let committed = database(transport.clone())
            .mutate_with("counter", increment)
            .await
            .unwrap();

        assert_eq!(committed["count"], 201);
        assert_eq!(transport.puts.lock().unwrap().len(), 1);
        assert_eq!(transport.state.lock().unwrap().1, 201);
    }

    #[tokio::test]
    async fn attempts_count_every_yielded_copy() {
        let transport = Arc::new(Contended::new(3));
        let mut mutation = database(transport).mutate::<JsonDocument>("counter");

        while let Some(doc) = mutation.next().await.unwrap() {
            increment(doc);
        }

        assert_eq!(mutation.attempts(), 4);
    }

    #[tokio::test]
    async fn missing_document_ends_the_loop() {
        #[derive(Debug)]
        struct Empty;

        #[async_trait]
        impl Transport for Empty {
            async fn request(&self, _: CouchRequest) -> CouchResult<CouchResponse> {
                Err(CouchError::Status {
                    status: 404,
                    error: "not_found".into(),
                    reason: "missing".into(),
                })
            }
        }

        let db = Session::basic(Arc::new(Empty)).database("db");
        let mut mutation = db.mutate::<JsonDocument>("nope");

        assert!(matches!(
            mutation.next().await,
            Err(CouchError::Missing(_, key)) if key == "nope"
        ));
        assert!(mutation.next().await.unwrap().is_none());
        assert_eq!(mutation.attempts(), 0);
    }
}
