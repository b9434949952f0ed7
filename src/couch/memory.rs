// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`DocumentStore`] with CouchDB revision semantics.
//!
//! Each document keeps its set of leaf revisions. A leaf carries its full
//! ancestry (`path`, newest first), its body and its attachments. The
//! winning revision is picked the way CouchDB does: non-deleted leaves
//! first, then the highest generation, then the highest revision hash.
//!
//! - `new_edits = true`: optimistic concurrency on `_rev`, new revisions
//!   are derived from the parent revision and body (sha256).
//! - `new_edits = false`: the document is grafted into the tree with the
//!   history it carries (`_revisions`, else just `_rev`), no conflict check.
//!
//! [`MemoryStore::leaves`] and [`MemoryStore::merge_leaves`] expose the raw
//! trees so a simulated replicator can copy them between databases.

use super::{AllDocsPage, BoxFuture, BulkFailure, BulkWriteResult, DocRow, Document, DocumentStore};
use crate::error::{CouchError, CouchResult};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// One stored attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// `sha256-<hex>` digest reported in stubs.
    pub fn digest(&self) -> String {
        format!("sha256-{}", hex::encode(Sha256::digest(&self.data)))
    }
}

/// A leaf of a document's revision tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionLeaf {
    /// Ancestry, newest first: `["3-c", "2-b", "1-a"]`.
    pub path: Vec<String>,
    pub deleted: bool,
    /// Body without any `_`-prefixed CouchDB metadata.
    pub body: Document,
    pub attachments: BTreeMap<String, Attachment>,
}

impl RevisionLeaf {
    pub fn rev(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or("")
    }

    fn sort_key(&self) -> (bool, u64, &str) {
        let rev = self.rev();
        (!self.deleted, generation(rev), rev)
    }
}

#[derive(Debug, Default)]
struct DocEntry {
    leaves: Vec<RevisionLeaf>,
}

impl DocEntry {
    fn winner(&self) -> Option<&RevisionLeaf> {
        self.leaves.iter().max_by(|a, b| a.sort_key().cmp(&b.sort_key()))
    }

    fn live_winner(&self) -> Option<&RevisionLeaf> {
        self.winner().filter(|leaf| !leaf.deleted)
    }

    /// Graft a leaf. Leaves it extends are replaced; a leaf that is already
    /// known (as a leaf or an ancestor) is a no-op.
    fn graft(&mut self, leaf: RevisionLeaf) {
        let rev = leaf.rev().to_string();
        if self.leaves.iter().any(|l| l.path.contains(&rev)) {
            return;
        }
        self.leaves.retain(|l| !leaf.path.contains(&l.rev().to_string()));
        self.leaves.push(leaf);
    }

    fn leaf_index(&self, rev: &str) -> Option<usize> {
        self.leaves.iter().position(|l| l.rev() == rev)
    }
}

type Database = BTreeMap<String, DocEntry>;

/// In-memory document store. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    dbs: Mutex<BTreeMap<String, Database>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Database>> {
        self.dbs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every document of `db` with its leaf revisions, ordered by id.
    /// Deleted documents are included.
    pub fn leaves(&self, db: &str) -> CouchResult<Vec<(String, Vec<RevisionLeaf>)>> {
        let dbs = self.lock();
        let database = dbs.get(db).ok_or_else(|| CouchError::not_found(db))?;
        Ok(database
            .iter()
            .map(|(id, entry)| (id.clone(), entry.leaves.clone()))
            .collect())
    }

    /// Graft leaves copied from another database.
    pub fn merge_leaves(&self, db: &str, id: &str, leaves: Vec<RevisionLeaf>) -> CouchResult<()> {
        let mut dbs = self.lock();
        let database = dbs.get_mut(db).ok_or_else(|| CouchError::not_found(db))?;
        let entry = database.entry(id.to_string()).or_default();
        for leaf in leaves {
            entry.graft(leaf);
        }
        Ok(())
    }

    /// Leaf revisions of one document, winner first.
    pub fn revisions(&self, db: &str, id: &str) -> CouchResult<Vec<String>> {
        let dbs = self.lock();
        let database = dbs.get(db).ok_or_else(|| CouchError::not_found(db))?;
        let entry = database.get(id).ok_or_else(|| CouchError::not_found(id))?;
        let mut leaves: Vec<&RevisionLeaf> = entry.leaves.iter().collect();
        leaves.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Ok(leaves.iter().map(|l| l.rev().to_string()).collect())
    }

    fn write(database: &mut Database, doc: Document, new_edits: bool) -> CouchResult<(String, String)> {
        if new_edits {
            write_new_edit(database, doc)
        } else {
            write_replicated(database, doc)
        }
    }
}

fn generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

fn split_meta(mut doc: Document) -> (Document, Map<String, Value>) {
    let mut meta = Map::new();
    let keys: Vec<String> = doc
        .keys()
        .filter(|k| matches!(k.as_str(), "_id" | "_rev" | "_revisions" | "_deleted" | "_attachments"))
        .cloned()
        .collect();
    for key in keys {
        if let Some(value) = doc.remove(&key) {
            meta.insert(key, value);
        }
    }
    (doc, meta)
}

fn next_rev(parent: Option<&str>, body: &Document, deleted: bool) -> String {
    let generation = parent.map(generation).unwrap_or(0) + 1;
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update([deleted as u8]);
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", generation, &digest[..32])
}

fn write_new_edit(database: &mut Database, doc: Document) -> CouchResult<(String, String)> {
    let (body, meta) = split_meta(doc);
    let id = match meta.get("_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => crate::ids::rev_id(),
    };
    let rev = meta.get("_rev").and_then(Value::as_str);
    let deleted = meta.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
    let entry = database.entry(id.clone()).or_default();

    let parent_index = match rev {
        Some(rev) => Some(entry.leaf_index(rev).ok_or_else(|| CouchError::conflict(&id))?),
        None => match entry.winner() {
            // recreating over a deleted winner extends it
            Some(w) if w.deleted => entry.leaf_index(&w.rev().to_string()),
            Some(_) => return Err(CouchError::conflict(&id)),
            None => None,
        },
    };

    let (mut path, parent_attachments) = match parent_index {
        Some(i) => {
            let parent = entry.leaves.remove(i);
            (parent.path, parent.attachments)
        }
        None => (Vec::new(), BTreeMap::new()),
    };

    // attachments survive only if the new body still lists them
    let kept = match meta.get("_attachments").and_then(Value::as_object) {
        Some(stubs) => parent_attachments
            .into_iter()
            .filter(|(name, _)| stubs.contains_key(name))
            .collect(),
        None => BTreeMap::new(),
    };

    let body = if deleted { Document::new() } else { body };
    let new_rev = next_rev(path.first().map(String::as_str), &body, deleted);
    path.insert(0, new_rev.clone());
    entry.leaves.push(RevisionLeaf {
        path,
        deleted,
        body,
        attachments: kept,
    });
    Ok((id, new_rev))
}

fn write_replicated(database: &mut Database, doc: Document) -> CouchResult<(String, String)> {
    let (body, meta) = split_meta(doc);
    let id = meta
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request("document must have an _id"))?
        .to_string();
    let path = match meta.get("_revisions") {
        Some(revisions) => {
            let start = revisions.get("start").and_then(Value::as_u64);
            let ids = revisions.get("ids").and_then(Value::as_array);
            match (start, ids) {
                (Some(start), Some(ids)) if !ids.is_empty() && start >= ids.len() as u64 => ids
                    .iter()
                    .enumerate()
                    .map(|(i, rev)| {
                        rev.as_str()
                            .map(|hash| format!("{}-{}", start - i as u64, hash))
                            .ok_or_else(|| bad_request("_revisions.ids must be strings"))
                    })
                    .collect::<CouchResult<Vec<_>>>()?,
                _ => return Err(bad_request("invalid _revisions")),
            }
        }
        None => vec![meta
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_request("new_edits=false requires _rev"))?
            .to_string()],
    };
    let deleted = meta.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
    let rev = path[0].clone();
    database.entry(id.clone()).or_default().graft(RevisionLeaf {
        path,
        deleted,
        body: if deleted { Document::new() } else { body },
        attachments: BTreeMap::new(),
    });
    Ok((id, rev))
}

fn bad_request(reason: &str) -> CouchError {
    CouchError::Http {
        status: 400,
        error: "bad_request".to_string(),
        reason: reason.to_string(),
    }
}

fn render(id: &str, leaf: &RevisionLeaf) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".into(), id.into());
    doc.insert("_rev".into(), leaf.rev().into());
    for (k, v) in &leaf.body {
        doc.insert(k.clone(), v.clone());
    }
    if !leaf.attachments.is_empty() {
        let stubs: Map<String, Value> = leaf
            .attachments
            .iter()
            .map(|(name, att)| {
                (
                    name.clone(),
                    json!({
                        "content_type": att.content_type,
                        "length": att.data.len(),
                        "digest": att.digest(),
                        "stub": true,
                    }),
                )
            })
            .collect();
        doc.insert("_attachments".into(), Value::Object(stubs));
    }
    doc
}

impl DocumentStore for MemoryStore {
    fn database_exists<'a>(&'a self, db: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.lock().contains_key(db)) })
    }

    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut dbs = self.lock();
            if dbs.contains_key(db) {
                return Err(CouchError::conflict(db));
            }
            dbs.insert(db.to_string(), Database::new());
            Ok(())
        })
    }

    fn delete_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.lock()
                .remove(db)
                .map(|_| ())
                .ok_or_else(|| CouchError::not_found(db))
        })
    }

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.lock().keys().cloned().collect()) })
    }

    fn server_identity(&self) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            Ok(json!({
                "couchdb": "Welcome",
                "vendor": {"name": "repdyno memory store"},
                "version": env!("CARGO_PKG_VERSION"),
            }))
        })
    }

    fn get_document<'a>(&'a self, db: &'a str, id: &'a str) -> BoxFuture<'a, Document> {
        Box::pin(async move {
            let dbs = self.lock();
            let database = dbs.get(db).ok_or_else(|| CouchError::not_found(db))?;
            database
                .get(id)
                .and_then(DocEntry::live_winner)
                .map(|leaf| render(id, leaf))
                .ok_or_else(|| CouchError::not_found(id))
        })
    }

    fn put_document<'a>(&'a self, db: &'a str, doc: Document) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut dbs = self.lock();
            let database = dbs.get_mut(db).ok_or_else(|| CouchError::not_found(db))?;
            write_new_edit(database, doc).map(|(_, rev)| rev)
        })
    }

    fn bulk_write<'a>(
        &'a self,
        db: &'a str,
        docs: Vec<Document>,
        new_edits: bool,
    ) -> BoxFuture<'a, BulkWriteResult> {
        Box::pin(async move {
            let mut dbs = self.lock();
            let database = dbs.get_mut(db).ok_or_else(|| CouchError::not_found(db))?;
            let mut result = BulkWriteResult::default();
            for doc in docs {
                let id = super::doc_id(&doc).unwrap_or_default().to_string();
                match MemoryStore::write(database, doc, new_edits) {
                    Ok(_) => result.ok_count += 1,
                    Err(e) => result.failures.push(BulkFailure {
                        id,
                        reason: e.to_string(),
                    }),
                }
            }
            Ok(result)
        })
    }

    fn all_docs<'a>(&'a self, db: &'a str, page: &'a AllDocsPage) -> BoxFuture<'a, Vec<DocRow>> {
        Box::pin(async move {
            let dbs = self.lock();
            let database = dbs.get(db).ok_or_else(|| CouchError::not_found(db))?;
            let start = page.start_key.as_deref();
            let end = page.end_key.as_deref();
            let limit = if page.limit == 0 { usize::MAX } else { page.limit };
            Ok(database
                .iter()
                .filter(|(id, _)| start.map_or(true, |s| id.as_str() >= s))
                .take_while(|(id, _)| end.map_or(true, |e| id.as_str() <= e))
                .filter_map(|(id, entry)| entry.live_winner().map(|leaf| (id, leaf)))
                .skip(page.skip)
                .take(limit)
                .map(|(id, leaf)| DocRow {
                    id: id.clone(),
                    rev: leaf.rev().to_string(),
                    doc: page.include_docs.then(|| render(id, leaf)),
                })
                .collect())
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
            let mut dbs = self.lock();
            let database = dbs.get_mut(db).ok_or_else(|| CouchError::not_found(db))?;
            let entry = database.get_mut(id).ok_or_else(|| CouchError::not_found(id))?;
            let index = entry.leaf_index(rev).ok_or_else(|| CouchError::conflict(id))?;
            let mut leaf = entry.leaves.remove(index);
            leaf.attachments.insert(
                name.to_string(),
                Attachment {
                    content_type: "application/octet-stream".to_string(),
                    data,
                },
            );
            let mut hashed = leaf.body.clone();
            hashed.insert("_attachment".into(), name.into());
            let new_rev = next_rev(Some(leaf.rev()), &hashed, false);
            leaf.path.insert(0, new_rev.clone());
            leaf.deleted = false;
            entry.leaves.push(leaf);
            Ok(new_rev)
        })
    }
}
