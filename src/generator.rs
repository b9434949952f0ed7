//! Synthetic document generation.
//!
//! Fills a source database with `num` documents whose ids come from
//! [`crate::ids::make_id`], each written as `branches` independent
//! revision histories of `revs` random revisions. The histories are
//! submitted with `new_edits = false`, so every branch lands as a
//! conflicting leaf of the same document.
//!
//! ```text
//! branch 1   3-a3 ← 2-a2 ← 1-a1      ← attachments extend this one
//! branch 2   3-b3 ← 2-b2 ← 1-b1
//! ```
//!
//! Any rejected document aborts the fill with
//! [`HarnessError::BulkWrite`]. With [`FillSpec::new_edits`] set the
//! documents are written as ordinary edits instead: rejections (usually
//! conflicts with existing documents) are collected in
//! [`FillReport::failures`] and the fill carries on.

use crate::couch::{self, AllDocsQuery, BulkFailure, Document, DocumentStore};
use crate::error::{HarnessError, Result};
use crate::ids;
use crate::metrics;
use futures::TryStreamExt;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Upper bound on documents per bulk request.
pub const FILL_BATCH_SIZE: usize = 500;

/// Batch size when deleting previously generated documents.
pub const CLEAN_BATCH_SIZE: usize = 2000;

/// Rough payload budget for one bulk request.
const BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Name used for bare string or sized attachments.
pub const DEFAULT_ATTACHMENT_NAME: &str = "att1";

/// Content of one named attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentBody {
    Text(String),
    /// `n` filler bytes (`b'x'`).
    Filler(usize),
}

impl AttachmentBody {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Filler(n) => vec![b'x'; *n],
        }
    }
}

/// Attachments added to the first branch of every generated document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSpec {
    /// Name/content pairs, attached in order.
    Named(Vec<(String, AttachmentBody)>),
    /// One `att1` of `n` filler bytes.
    Sized(usize),
    /// One `att1` with this content.
    Raw(String),
}

impl AttachmentSpec {
    pub fn named<N, I>(items: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, AttachmentBody)>,
    {
        Self::Named(items.into_iter().map(|(n, b)| (n.into(), b)).collect())
    }

    /// `(name, bytes)` pairs in upload order.
    pub fn normalize(&self) -> Vec<(String, Vec<u8>)> {
        match self {
            Self::Named(items) => items
                .iter()
                .map(|(name, body)| (name.clone(), body.to_bytes()))
                .collect(),
            Self::Sized(n) => vec![(
                DEFAULT_ATTACHMENT_NAME.to_string(),
                AttachmentBody::Filler(*n).to_bytes(),
            )],
            Self::Raw(text) => vec![(DEFAULT_ATTACHMENT_NAME.to_string(), text.as_bytes().to_vec())],
        }
    }
}

impl From<usize> for AttachmentSpec {
    fn from(n: usize) -> Self {
        Self::Sized(n)
    }
}

impl From<&str> for AttachmentSpec {
    fn from(text: &str) -> Self {
        Self::Raw(text.to_string())
    }
}

/// What to write in one fill.
#[derive(Debug, Clone, PartialEq)]
pub struct FillSpec {
    pub num: u32,
    /// Revisions per branch (at least 1).
    pub revs: u32,
    /// Conflicting branches per document (at least 1).
    pub branches: u32,
    /// Append a random suffix to every id.
    pub rand_ids: bool,
    /// Fields copied into every document.
    pub extra: Document,
    pub attachments: Option<AttachmentSpec>,
    /// Delete previously generated documents first.
    pub delete_before_updating: bool,
    /// Write as ordinary edits and tolerate rejected documents.
    pub new_edits: bool,
}

impl FillSpec {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            revs: 1,
            branches: 1,
            rand_ids: false,
            extra: Document::new(),
            attachments: None,
            delete_before_updating: false,
            new_edits: false,
        }
    }
}

/// Outcome of a fill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillReport {
    /// Branch documents accepted by the database.
    pub written: usize,
    pub attachments: usize,
    /// Documents deleted before writing.
    pub cleaned: usize,
    /// Rejected documents, only ever set with `new_edits`.
    pub failures: Vec<BulkFailure>,
}

/// A document's first branch: id and the revision attachments go onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    pub id: String,
    pub rev: String,
}

/// Lazily build every branch document of a fill, without touching a
/// database.
///
/// Each item carries the attachment target when it is the first branch of
/// its id and attachments are requested.
pub fn build_documents<'a>(
    prefix: &'a str,
    spec: &'a FillSpec,
) -> Result<impl Iterator<Item = (Document, Option<AttachTarget>)> + 'a> {
    if spec.num > ids::MAX_INDEX {
        return Err(HarnessError::Config(format!(
            "cannot generate {} documents, ids are limited to {}",
            spec.num,
            ids::MAX_INDEX
        )));
    }
    let revs = spec.revs.max(1);
    let branches = spec.branches.max(1);
    let attach = spec.attachments.is_some();

    Ok((1..=spec.num).flat_map(move |i| {
        let id = if spec.rand_ids {
            ids::make_random_id(i, prefix)
        } else {
            ids::make_id(i, prefix)
        };
        (1..=branches).map(move |branch| {
            let rev_ids: Vec<String> = (0..revs).map(|_| ids::rev_id()).collect();
            let target = (branch == 1 && attach).then(|| AttachTarget {
                id: id.clone(),
                rev: format!("{}-{}", revs, rev_ids[0]),
            });
            let mut doc = spec.extra.clone();
            doc.insert("_id".into(), Value::String(id.clone()));
            doc.insert("_revisions".into(), json!({ "start": revs, "ids": rev_ids }));
            (doc, target)
        })
    }))
}

/// Batch size for documents of roughly `doc_bytes` each.
pub fn batch_size_for(doc_bytes: usize) -> usize {
    (BATCH_BYTES / doc_bytes.max(1)).clamp(1, FILL_BATCH_SIZE)
}

/// Delete every generated document (`prefix-…`) from `db`.
#[instrument(skip_all, fields(db = %db, prefix = %prefix))]
pub async fn clean_docs(store: &dyn DocumentStore, db: &str, prefix: &str) -> Result<usize> {
    let (start, end) = ids::id_key_range(prefix);
    let rows: Vec<_> = couch::stream_all(store, db, AllDocsQuery::revs().keys(start, end))
        .try_filter(|row| futures::future::ready(ids::has_prefix(&row.id, prefix)))
        .try_collect()
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }
    let tombstones = rows.into_iter().map(|row| {
        let mut doc = Document::new();
        doc.insert("_id".into(), row.id.into());
        doc.insert("_rev".into(), row.rev.into());
        doc.insert("_deleted".into(), true.into());
        doc
    });
    let result = couch::bulk_update(store, db, tombstones, CLEAN_BATCH_SIZE, true).await?;
    metrics::record_documents_cleaned(db, result.ok_count);
    debug!(cleaned = result.ok_count, failed = result.failures.len(), "Cleaned documents");
    Ok(result.ok_count)
}

/// Write one fill into `db`, one bounded batch at a time.
#[instrument(skip_all, fields(db = %db, num = spec.num, revs = spec.revs, branches = spec.branches))]
pub async fn fill(
    store: &dyn DocumentStore,
    db: &str,
    prefix: &str,
    spec: &FillSpec,
) -> Result<FillReport> {
    let started = Instant::now();
    let mut report = FillReport::default();

    if spec.delete_before_updating {
        report.cleaned = clean_docs(store, db, prefix).await?;
    }

    let mut docs = build_documents(prefix, spec)?.peekable();
    let batch_size = docs
        .peek()
        .and_then(|(doc, _)| serde_json::to_vec(doc).ok())
        .map_or(FILL_BATCH_SIZE, |bytes| batch_size_for(bytes.len()));
    let payloads = spec
        .attachments
        .as_ref()
        .map(AttachmentSpec::normalize)
        .unwrap_or_default();

    loop {
        let (mut batch, targets): (Vec<Document>, Vec<Option<AttachTarget>>) =
            docs.by_ref().take(batch_size).unzip();
        if batch.is_empty() {
            break;
        }
        if spec.new_edits {
            // server-assigned revisions, the synthetic history does not apply
            for doc in &mut batch {
                doc.remove("_revisions");
            }
        }
        let result = couch::bulk_update(store, db, batch, batch_size, spec.new_edits).await?;
        if !result.is_complete() && !spec.new_edits {
            return Err(HarnessError::BulkWrite {
                db: db.to_string(),
                failures: result.failures,
            });
        }
        report.written += result.ok_count;

        for target in targets.into_iter().flatten() {
            // ordinary edits go onto whatever revision currently wins
            let mut rev = if spec.new_edits {
                let current = store.get_document(db, &target.id).await?;
                couch::doc_rev(&current).unwrap_or_default().to_string()
            } else {
                target.rev
            };
            for (name, data) in &payloads {
                rev = store
                    .put_attachment(db, &target.id, &rev, name, data.clone())
                    .await?;
                report.attachments += 1;
            }
        }
        report.failures.extend(result.failures);
    }
    if spec.attachments.is_some() {
        metrics::record_attachments_written(db, report.attachments);
    }

    metrics::record_fill_duration(db, started.elapsed());
    info!(
        written = report.written,
        failed = report.failures.len(),
        attachments = report.attachments,
        cleaned = report.cleaned,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Filled database"
    );
    Ok(report)
}
