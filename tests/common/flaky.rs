//! Fault-injecting [`DocumentStore`] wrapper.
//!
//! Delegates to an inner store, failing the first `n` calls of the
//! selected operations with a transport error. Lets chaos tests exercise
//! the retry paths without a real network.

use repdyno::couch::{AllDocsPage, BoxFuture, BulkWriteResult, DocRow, Document, DocumentStore};
use repdyno::error::CouchError;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Which calls to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// Reads: `all_docs`, `get_document`, `server_identity`.
    Reads,
    /// Writes: `bulk_write`, `put_document`, `put_attachment`.
    Writes,
    Everything,
}

pub struct FlakyStore {
    inner: Arc<dyn DocumentStore>,
    fail_on: FailOn,
    failures_left: AtomicU32,
    injected: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DocumentStore>, fail_on: FailOn, failures: u32) -> Self {
        Self {
            inner,
            fail_on,
            failures_left: AtomicU32::new(failures),
            injected: AtomicUsize::new(0),
        }
    }

    /// Failures injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// Arm another `n` failures.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self, write: bool) -> Result<(), CouchError> {
        let selected = match self.fail_on {
            FailOn::Reads => !write,
            FailOn::Writes => write,
            FailOn::Everything => true,
        };
        if !selected {
            return Ok(());
        }
        let armed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(CouchError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

impl DocumentStore for FlakyStore {
    fn database_exists<'a>(&'a self, db: &'a str) -> BoxFuture<'a, bool> {
        self.inner.database_exists(db)
    }

    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        self.inner.create_database(db)
    }

    fn delete_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        self.inner.delete_database(db)
    }

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>> {
        self.inner.list_databases()
    }

    fn server_identity(&self) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            self.maybe_fail(false)?;
            self.inner.server_identity().await
        })
    }

    fn get_document<'a>(&'a self, db: &'a str, id: &'a str) -> BoxFuture<'a, Document> {
        Box::pin(async move {
            self.maybe_fail(false)?;
            self.inner.get_document(db, id).await
        })
    }

    fn put_document<'a>(&'a self, db: &'a str, doc: Document) -> BoxFuture<'a, String> {
        Box::pin(async move {
            self.maybe_fail(true)?;
            self.inner.put_document(db, doc).await
        })
    }

    fn bulk_write<'a>(
        &'a self,
        db: &'a str,
        docs: Vec<Document>,
        new_edits: bool,
    ) -> BoxFuture<'a, BulkWriteResult> {
        Box::pin(async move {
            self.maybe_fail(true)?;
            self.inner.bulk_write(db, docs, new_edits).await
        })
    }

    fn all_docs<'a>(&'a self, db: &'a str, page: &'a AllDocsPage) -> BoxFuture<'a, Vec<DocRow>> {
        Box::pin(async move {
            self.maybe_fail(false)?;
            self.inner.all_docs(db, page).await
        })
    }

    fn put_attachment<'a>(
        &'a self,
        db: &'a str,
        id: &'a str,
        rev: &'a str,
        name: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            self.maybe_fail(true)?;
            self.inner.put_attachment(db, id, rev, name, data).await
        })
    }
}
