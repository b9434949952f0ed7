//! Convergence checks.
//!
//! Two polls decide when a cycle is done, both driven by
//! [`crate::resilience::retry`]:
//!
//! - [`wait_for_jobs`]: every job document under the prefix reports
//!   `_replication_state: "completed"`
//! - [`wait_until_contains`]: the right database holds a copy of every
//!   prefixed document of the left one
//!
//! [`contains`] compares in two phases of increasing cost. Phase 1 streams
//! only `(id, rev)` rows and fails as soon as an id is missing on the right.
//! Phase 2 streams full bodies (minus `_rev`, which differs across
//! replicas) and compares them field by field.

use crate::couch::{self, AllDocsQuery, Document, DocumentStore, ServerHandle, DEFAULT_PAGE_SIZE};
use crate::error::Result;
use crate::ids;
use crate::metrics;
use crate::range::DbRange;
use crate::resilience::{retry, Check, RetryPolicy};
use crate::topology::{plan_comparison, ComparisonPlan};
use futures::{future, Stream, TryStreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Replication state of a finished one-shot job.
pub const COMPLETED_STATE: &str = "completed";

/// Tuning for [`contains`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    /// Report inequality as soon as the prefixed row counts differ.
    ///
    /// Only meaningful for exact copies: a reduce target legitimately holds
    /// more documents than each of its sources.
    pub count_shortcut: bool,
    /// Page size of the id scan.
    pub batch_size: usize,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            count_shortcut: false,
            batch_size: DEFAULT_PAGE_SIZE,
        }
    }
}

fn prefixed<'a>(
    store: &'a dyn DocumentStore,
    db: &'a str,
    prefix: &'a str,
    query: AllDocsQuery,
) -> impl Stream<Item = crate::error::CouchResult<couch::DocRow>> + Send + 'a {
    let (start, end) = ids::id_key_range(prefix);
    couch::stream_all(store, db, query.keys(start, end))
        .try_filter(move |row| future::ready(ids::has_prefix(&row.id, prefix)))
}

fn without_rev(mut doc: Document) -> Document {
    doc.remove("_rev");
    doc
}

/// Whether `right_db` holds every prefixed document of `left_db` with equal
/// content. Pure: reads only.
#[instrument(skip_all, fields(left = %left_db, right = %right_db, prefix = %prefix))]
pub async fn contains(
    left: &dyn DocumentStore,
    left_db: &str,
    right: &dyn DocumentStore,
    right_db: &str,
    prefix: &str,
    opts: CompareOptions,
) -> Result<bool> {
    let revs = AllDocsQuery::revs().batch_size(opts.batch_size);

    // Phase 1: ids only
    let right_ids: HashSet<String> = prefixed(right, right_db, prefix, revs.clone())
        .map_ok(|row| row.id)
        .try_collect()
        .await?;
    let left_ids: Vec<String> = prefixed(left, left_db, prefix, revs)
        .map_ok(|row| row.id)
        .try_collect()
        .await?;

    if opts.count_shortcut && left_ids.len() != right_ids.len() {
        debug!(left = left_ids.len(), right = right_ids.len(), "Row counts differ");
        metrics::record_comparison("count", false);
        return Ok(false);
    }
    let missing = left_ids.iter().filter(|id| !right_ids.contains(*id)).count();
    if missing > 0 {
        debug!(missing, "Documents missing on the right");
        metrics::record_comparison("ids", false);
        return Ok(false);
    }
    metrics::record_comparison("ids", true);

    // Phase 2: full bodies
    let docs = AllDocsQuery::docs().batch_size(opts.batch_size);
    let right_docs: HashMap<String, Document> = prefixed(right, right_db, prefix, docs.clone())
        .try_filter_map(|row| future::ready(Ok(row.doc.map(|doc| (row.id, without_rev(doc))))))
        .try_collect()
        .await?;

    let mut left_docs = Box::pin(prefixed(left, left_db, prefix, docs));
    while let Some(row) = left_docs.try_next().await? {
        let Some(doc) = row.doc else { continue };
        let equal = right_docs
            .get(&row.id)
            .map_or(false, |other| *other == without_rev(doc));
        if !equal {
            debug!(id = %row.id, "Document differs");
            metrics::record_comparison("docs", false);
            return Ok(false);
        }
    }
    metrics::record_comparison("docs", true);
    Ok(true)
}

/// Poll [`contains`] until it returns `true` or the policy times out.
pub async fn wait_until_contains(
    left: &dyn DocumentStore,
    left_db: &str,
    right: &dyn DocumentStore,
    right_db: &str,
    prefix: &str,
    policy: &RetryPolicy,
    opts: CompareOptions,
) -> Result<()> {
    let started = Instant::now();
    let outcome = retry("contains", policy, &Check::Equals(true), || {
        contains(left, left_db, right, right_db, prefix, opts)
    })
    .await;
    metrics::record_convergence_wait("contains", outcome.is_ok(), started.elapsed());
    outcome.map(|_| ())
}

/// Compare every source/target pair implied by `sr` and `tr` until each
/// converges. Returns the comparison that was run.
///
/// Without a target range, consecutive source databases are compared
/// (chain). Other combinations follow [`plan_comparison`].
#[instrument(skip_all, fields(sr = %sr, tr = %tr, prefix = %prefix))]
pub async fn wait_till_all_equal(
    source: &ServerHandle,
    target: &ServerHandle,
    prefix: &str,
    sr: DbRange,
    tr: DbRange,
    policy: &RetryPolicy,
    opts: CompareOptions,
) -> Result<ComparisonPlan> {
    let plan = plan_comparison(sr, tr)?;
    let right_server = if plan.kind.right_is_source() {
        source
    } else {
        target
    };
    let started = Instant::now();
    for &(left, right) in &plan.pairs {
        let left_db = ids::db_name(prefix, left);
        let right_db = ids::db_name(prefix, right);
        debug!(left = %left_db, right = %right_db, kind = ?plan.kind, "Comparing");
        wait_until_contains(
            source.store(),
            &left_db,
            right_server.store(),
            &right_db,
            prefix,
            policy,
            opts,
        )
        .await?;
    }
    info!(
        pairs = plan.pairs.len(),
        kind = ?plan.kind,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Changes propagated"
    );
    Ok(plan)
}

/// Job documents under `prefix` whose state is not `completed`, with the
/// state they report (empty when absent).
pub async fn incomplete_jobs(
    store: &dyn DocumentStore,
    db: &str,
    prefix: &str,
) -> Result<BTreeMap<String, String>> {
    let rows: Vec<_> = prefixed(store, db, prefix, AllDocsQuery::docs())
        .try_filter(|row| future::ready(!ids::is_design_doc(&row.id)))
        .try_collect()
        .await?;
    let incomplete: BTreeMap<String, String> = rows
        .into_iter()
        .filter_map(|row| {
            let state = row
                .doc
                .as_ref()
                .and_then(|doc| doc.get("_replication_state"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (state != COMPLETED_STATE).then_some((row.id, state))
        })
        .collect();
    metrics::set_incomplete_jobs(incomplete.len());
    Ok(incomplete)
}

/// Poll [`incomplete_jobs`] until it is empty or the policy times out.
pub async fn wait_for_jobs(
    store: &dyn DocumentStore,
    db: &str,
    prefix: &str,
    policy: &RetryPolicy,
) -> Result<()> {
    let started = Instant::now();
    let check = Check::predicate(|jobs: &BTreeMap<String, String>| jobs.is_empty());
    let outcome = retry("wait_for_jobs", policy, &check, || incomplete_jobs(store, db, prefix)).await;
    metrics::record_convergence_wait("jobs", outcome.is_ok(), started.elapsed());
    outcome.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::couch::memory::MemoryStore;
    use crate::error::HarnessError;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn seeded(dbs: &[&str], docs: &[Value]) -> MemoryStore {
        let store = MemoryStore::new();
        for db in dbs {
            store.create_database(db).await.unwrap();
            for d in docs {
                store.put_document(db, doc(d.clone())).await.unwrap();
            }
        }
        store
    }

    #[tokio::test]
    async fn test_identical_databases_contain_each_other() {
        let docs = [json!({"_id": "cdyno-0000001", "v": 1}), json!({"_id": "cdyno-0000002", "v": 2})];
        let store = seeded(&["a", "b"], &docs).await;
        let opts = CompareOptions::default();
        assert!(contains(&store, "a", &store, "b", "cdyno", opts).await.unwrap());
        assert!(contains(&store, "b", &store, "a", "cdyno", opts).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_id_fails_phase_one() {
        let store = seeded(&["a", "b"], &[json!({"_id": "cdyno-0000001"})]).await;
        store
            .put_document("a", doc(json!({"_id": "cdyno-0000002"})))
            .await
            .unwrap();
        let opts = CompareOptions::default();
        assert!(!contains(&store, "a", &store, "b", "cdyno", opts).await.unwrap());
        // superset on the right is fine
        assert!(contains(&store, "b", &store, "a", "cdyno", opts).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_body_fails_phase_two() {
        let store = seeded(&["a", "b"], &[]).await;
        store
            .put_document("a", doc(json!({"_id": "cdyno-0000001", "v": 1})))
            .await
            .unwrap();
        store
            .put_document("b", doc(json!({"_id": "cdyno-0000001", "v": 2})))
            .await
            .unwrap();
        assert!(!contains(&store, "a", &store, "b", "cdyno", CompareOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unprefixed_documents_ignored() {
        let store = seeded(&["a", "b"], &[json!({"_id": "cdyno-0000001"})]).await;
        store
            .put_document("a", doc(json!({"_id": "_design/cdyno_filterdoc", "filters": {}})))
            .await
            .unwrap();
        store
            .put_document("a", doc(json!({"_id": "other-0000001"})))
            .await
            .unwrap();
        assert!(contains(&store, "a", &store, "b", "cdyno", CompareOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_count_shortcut() {
        let store = seeded(&["a", "b"], &[json!({"_id": "cdyno-0000001"})]).await;
        store
            .put_document("b", doc(json!({"_id": "cdyno-0000002"})))
            .await
            .unwrap();
        let thorough = CompareOptions::default();
        let shortcut = CompareOptions {
            count_shortcut: true,
            ..thorough
        };
        assert!(contains(&store, "a", &store, "b", "cdyno", thorough).await.unwrap());
        assert!(!contains(&store, "a", &store, "b", "cdyno", shortcut).await.unwrap());
    }

    #[tokio::test]
    async fn test_small_batches_page_through() {
        let docs: Vec<Value> = (1..=25)
            .map(|i| json!({"_id": ids::make_id(i, "cdyno"), "i": i}))
            .collect();
        let store = seeded(&["a", "b"], &docs).await;
        let opts = CompareOptions {
            batch_size: 4,
            ..CompareOptions::default()
        };
        assert!(contains(&store, "a", &store, "b", "cdyno", opts).await.unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_jobs() {
        let store = seeded(&["_replicator"], &[]).await;
        for (id, state) in [
            ("cdyno-0000001-0000002", Some("completed")),
            ("cdyno-0000001-0000003", Some("running")),
            ("cdyno-0000001-0000004", None),
        ] {
            let mut d = doc(json!({"_id": id}));
            if let Some(state) = state {
                d.insert("_replication_state".into(), json!(state));
            }
            store.put_document("_replicator", d).await.unwrap();
        }
        let incomplete = incomplete_jobs(&store, "_replicator", "cdyno").await.unwrap();
        assert_eq!(incomplete.len(), 2);
        assert_eq!(incomplete["cdyno-0000001-0000003"], "running");
        assert_eq!(incomplete["cdyno-0000001-0000004"], "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_contains_times_out() {
        let store = seeded(&["a", "b"], &[]).await;
        store
            .put_document("a", doc(json!({"_id": "cdyno-0000001"})))
            .await
            .unwrap();
        let policy = RetryPolicy::polling(Duration::from_secs(2), Duration::from_secs(1));
        let err = wait_until_contains(&store, "a", &store, "b", "cdyno", &policy, CompareOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::RetryTimeoutExceeded { timeout, .. } if timeout == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_wait_till_all_equal_chain_compares_sources() {
        let docs = [json!({"_id": "cdyno-0000001"})];
        let src = Arc::new(
            seeded(&["cdyno-0000001", "cdyno-0000002", "cdyno-0000003"], &docs).await,
        );
        let tgt = Arc::new(MemoryStore::new());
        let source = ServerHandle::new("http://src:5984", src).unwrap();
        let target = ServerHandle::new("http://tgt:5984", tgt).unwrap();
        let policy = RetryPolicy::testing();
        let plan = wait_till_all_equal(
            &source,
            &target,
            "cdyno",
            DbRange::new(1, 3).unwrap(),
            DbRange::EMPTY,
            &policy,
            CompareOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(plan.pairs, vec![(1, 2), (2, 3)]);
    }

    #[tokio::test]
    async fn test_converged_pairs_stay_equal_when_rechecked() {
        let docs: Vec<Value> = (1..=5)
            .map(|i| json!({"_id": ids::make_id(i, "cdyno"), "i": i}))
            .collect();
        let src = Arc::new(seeded(&["cdyno-0000001"], &docs).await);
        let tgt = Arc::new(seeded(&["cdyno-0000002", "cdyno-0000003"], &docs).await);
        let source = ServerHandle::new("http://src:5984", src.clone()).unwrap();
        let target = ServerHandle::new("http://tgt:5984", tgt.clone()).unwrap();
        let (sr, tr) = (DbRange::single(1), DbRange::new(2, 3).unwrap());
        let policy = RetryPolicy::testing();
        let opts = CompareOptions::default();

        let first = wait_till_all_equal(&source, &target, "cdyno", sr, tr, &policy, opts)
            .await
            .unwrap();
        let second = wait_till_all_equal(&source, &target, "cdyno", sr, tr, &policy, opts)
            .await
            .unwrap();
        assert_eq!(first.pairs, vec![(1, 2), (1, 3)]);
        assert_eq!(first.pairs, second.pairs);

        for _ in 0..3 {
            assert!(contains(src.as_ref(), "cdyno-0000001", tgt.as_ref(), "cdyno-0000003", "cdyno", opts)
                .await
                .unwrap());
        }
    }
}
