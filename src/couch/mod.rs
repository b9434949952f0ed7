// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document-database collaborator.
//!
//! The harness only needs a narrow slice of a CouchDB-style API, captured
//! by [`DocumentStore`]. Two implementations ship with the crate:
//!
//! - [`http::CouchClient`]: the real server over its REST API
//! - [`memory::MemoryStore`]: an in-process store with revision trees,
//!   used by tests and dry runs
//!
//! On top of the trait this module provides the helpers every component
//! shares: [`ServerHandle`] (base URL + credentials + store),
//! [`stream_all`] (lazy, id-ordered paging over `_all_docs`) and
//! [`bulk_update`] (batched bulk writes with an aggregated result).
//!
//! # Example
//!
//! ```rust,no_run
//! use repdyno::couch::{DocumentStore, BoxFuture, Document, BulkWriteResult, AllDocsPage, DocRow};
//! use serde_json::Value;
//!
//! struct ReadOnly;
//!
//! impl DocumentStore for ReadOnly {
//!     fn database_exists<'a>(&'a self, _db: &'a str) -> BoxFuture<'a, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!     // ... remaining operations
//! #   fn create_database<'a>(&'a self, _db: &'a str) -> BoxFuture<'a, ()> { Box::pin(async { Ok(()) }) }
//! #   fn delete_database<'a>(&'a self, _db: &'a str) -> BoxFuture<'a, ()> { Box::pin(async { Ok(()) }) }
//! #   fn list_databases(&self) -> BoxFuture<'_, Vec<String>> { Box::pin(async { Ok(vec![]) }) }
//! #   fn server_identity(&self) -> BoxFuture<'_, Value> { Box::pin(async { Ok(Value::Null) }) }
//! #   fn get_document<'a>(&'a self, _db: &'a str, id: &'a str) -> BoxFuture<'a, Document> {
//! #       Box::pin(async move { Err(repdyno::error::CouchError::not_found(id)) })
//! #   }
//! #   fn put_document<'a>(&'a self, _db: &'a str, _doc: Document) -> BoxFuture<'a, String> { Box::pin(async { Ok("1-a".into()) }) }
//! #   fn bulk_write<'a>(&'a self, _db: &'a str, _docs: Vec<Document>, _new_edits: bool) -> BoxFuture<'a, BulkWriteResult> {
//! #       Box::pin(async { Ok(BulkWriteResult::default()) })
//! #   }
//! #   fn all_docs<'a>(&'a self, _db: &'a str, _page: &'a AllDocsPage) -> BoxFuture<'a, Vec<DocRow>> { Box::pin(async { Ok(vec![]) }) }
//! #   fn put_attachment<'a>(&'a self, _db: &'a str, _id: &'a str, _rev: &'a str, _name: &'a str, _data: Vec<u8>) -> BoxFuture<'a, String> {
//! #       Box::pin(async { Ok("2-b".into()) })
//! #   }
//! }
//! ```

pub mod http;
pub mod memory;

use crate::error::{CouchError, CouchResult};
use crate::metrics;
use futures::stream::{self, Stream, TryStreamExt};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// A JSON document. `_id`, `_rev`, `_revisions`, `_deleted` and
/// `_attachments` carry their usual CouchDB meaning.
pub type Document = Map<String, Value>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = CouchResult<T>> + Send + 'a>>;

/// Default page size when streaming `_all_docs`.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// One document that a bulk write rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFailure {
    pub id: String,
    pub reason: String,
}

/// Aggregated outcome of one or more bulk writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub ok_count: usize,
    pub failures: Vec<BulkFailure>,
}

impl BulkWriteResult {
    /// True when every document was accepted.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: BulkWriteResult) {
        self.ok_count += other.ok_count;
        self.failures.extend(other.failures);
    }
}

/// One `_all_docs` row. `doc` is only set when the page asked for bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct DocRow {
    pub id: String,
    pub rev: String,
    pub doc: Option<Document>,
}

/// One page request against `_all_docs`. Keys are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllDocsPage {
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub include_docs: bool,
    pub limit: usize,
    pub skip: usize,
}

/// A full, restartable scan request. [`stream_all`] splits it into pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllDocsQuery {
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub include_docs: bool,
    pub batch_size: usize,
}

impl Default for AllDocsQuery {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            include_docs: false,
            batch_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl AllDocsQuery {
    /// Revisions only, every document.
    pub fn revs() -> Self {
        Self::default()
    }

    /// Full bodies, every document.
    pub fn docs() -> Self {
        Self {
            include_docs: true,
            ..Default::default()
        }
    }

    /// Restrict to `start..=end`.
    pub fn keys(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.start_key = Some(start.into());
        self.end_key = Some(end.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// What the harness needs from a document database.
///
/// Every operation is a single request. Retrying is the caller's business
/// (see [`crate::resilience::retry`]).
pub trait DocumentStore: Send + Sync + 'static {
    fn database_exists<'a>(&'a self, db: &'a str) -> BoxFuture<'a, bool>;

    /// Fails with [`CouchError::Conflict`] if it already exists.
    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()>;

    /// Fails with [`CouchError::NotFound`] if it does not exist.
    fn delete_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()>;

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>>;

    /// The server's welcome object (`GET /`).
    fn server_identity(&self) -> BoxFuture<'_, Value>;

    /// Current winning revision, or [`CouchError::NotFound`].
    fn get_document<'a>(&'a self, db: &'a str, id: &'a str) -> BoxFuture<'a, Document>;

    /// Write one document using its embedded `_rev` for optimistic
    /// concurrency. Returns the new revision.
    fn put_document<'a>(&'a self, db: &'a str, doc: Document) -> BoxFuture<'a, String>;

    /// `_bulk_docs`. With `new_edits = false` documents are stored with the
    /// revision history they carry, bypassing conflict checks.
    fn bulk_write<'a>(
        &'a self,
        db: &'a str,
        docs: Vec<Document>,
        new_edits: bool,
    ) -> BoxFuture<'a, BulkWriteResult>;

    /// One page of `_all_docs`, ordered by id.
    fn all_docs<'a>(&'a self, db: &'a str, page: &'a AllDocsPage) -> BoxFuture<'a, Vec<DocRow>>;

    /// Attach `data` to revision `rev` of `id`. Returns the new revision.
    fn put_attachment<'a>(
        &'a self,
        db: &'a str,
        id: &'a str,
        rev: &'a str,
        name: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, String>;
}

// =============================================================================
// Helpers over any DocumentStore
// =============================================================================

struct PageCursor {
    next_start: Option<String>,
    skip: usize,
    done: bool,
}

/// Lazily stream every row of `query` in id order.
///
/// Each page after the first restarts at the last id seen with `skip=1`,
/// so the scan is restartable per call but not resumable across calls.
pub fn stream_all<'a>(
    store: &'a dyn DocumentStore,
    db: &'a str,
    query: AllDocsQuery,
) -> impl Stream<Item = CouchResult<DocRow>> + Send + 'a {
    let limit = query.batch_size.max(1);
    let cursor = PageCursor {
        next_start: query.start_key.clone(),
        skip: 0,
        done: false,
    };

    stream::try_unfold(cursor, move |cursor| {
        let query = query.clone();
        async move {
            if cursor.done {
                return Ok::<_, CouchError>(None);
            }
            let page = AllDocsPage {
                start_key: cursor.next_start,
                end_key: query.end_key,
                include_docs: query.include_docs,
                limit,
                skip: cursor.skip,
            };
            let rows = store.all_docs(db, &page).await?;
            let next = PageCursor {
                next_start: rows.last().map(|r| r.id.clone()),
                skip: 1,
                done: rows.len() < limit,
            };
            Ok(Some((rows, next)))
        }
    })
    .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<DocRow, CouchError>)))
    .try_flatten()
}

/// Write `docs` in batches of `batch_size`, aggregating the outcome.
///
/// Per-document failures are logged and returned, never raised. A
/// transport-level failure of a whole batch is raised.
pub async fn bulk_update<I>(
    store: &dyn DocumentStore,
    db: &str,
    docs: I,
    batch_size: usize,
    new_edits: bool,
) -> CouchResult<BulkWriteResult>
where
    I: IntoIterator<Item = Document>,
{
    let mut total = BulkWriteResult::default();
    let mut docs = docs.into_iter();
    loop {
        let batch = next_batch(&mut docs, batch_size.max(1));
        if batch.is_empty() {
            break;
        }
        let size = batch.len();
        let result = store.bulk_write(db, batch, new_edits).await?;
        debug!(db = %db, size, ok = result.ok_count, failed = result.failures.len(), "Bulk write");
        for failure in &result.failures {
            warn!(db = %db, id = %failure.id, reason = %failure.reason, "Document write failed");
        }
        metrics::record_documents_written(db, result.ok_count);
        metrics::record_bulk_failures(db, result.failures.len());
        total.merge(result);
    }
    Ok(total)
}

/// Pull at most `size` documents off `docs`.
fn next_batch<I>(docs: &mut I, size: usize) -> Vec<Document>
where
    I: Iterator<Item = Document>,
{
    docs.by_ref().take(size).collect()
}

/// `_id` of a document, if present.
pub fn doc_id(doc: &Document) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// `_rev` of a document, if present.
pub fn doc_rev(doc: &Document) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}

// =============================================================================
// ServerHandle
// =============================================================================

/// A server reachable at `url` (credentials optional) through `store`.
#[derive(Clone)]
pub struct ServerHandle {
    url: Url,
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("url", &redact(&self.url))
            .finish()
    }
}

impl ServerHandle {
    pub fn new(url: &str, store: Arc<dyn DocumentStore>) -> CouchResult<Self> {
        let url = Url::parse(url).map_err(|e| CouchError::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self { url, store })
    }

    /// HTTP handle: a [`http::CouchClient`] for `url`.
    pub fn http(url: &str, timeout: Option<std::time::Duration>) -> CouchResult<Self> {
        let client = http::CouchClient::new(url, timeout)?;
        Self::new(url, Arc::new(client))
    }

    /// Base URL, credentials included.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn shared_store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Absolute URL of `db` on this server, with credentials spliced in.
    /// Inputs that already are URLs are returned unchanged.
    pub fn remote_url(&self, db: &str) -> String {
        if db.contains("://") {
            return db.to_string();
        }
        let mut url = self.url.clone();
        match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty().push(db);
            }
            // cannot-be-a-base URLs are rejected by Url::parse for http(s)
            Err(()) => return format!("{}/{}", self.url.as_str().trim_end_matches('/'), db),
        }
        url.to_string()
    }

    /// Reuse `db`, or delete-and-recreate it when `reset` is set.
    pub async fn get_or_create(&self, db: &str, reset: bool) -> CouchResult<()> {
        if self.store.database_exists(db).await? {
            if !reset {
                return Ok(());
            }
            debug!(db = %db, "Resetting database");
            match self.store.delete_database(db).await {
                Ok(()) | Err(CouchError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        match self.store.create_database(db).await {
            // lost a race with another creator
            Ok(()) | Err(CouchError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete `db` if it exists. Returns whether anything was deleted.
    pub async fn delete_if_exists(&self, db: &str) -> CouchResult<bool> {
        match self.store.delete_database(db).await {
            Ok(()) => Ok(true),
            Err(CouchError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// URL with the password masked, for logs.
pub fn redact(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url.to_string()
}
