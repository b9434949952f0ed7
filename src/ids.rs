//! Deterministic naming for everything a run creates.
//!
//! All names share the run prefix and a fixed-width, zero-padded index, so
//! lexicographic order equals numeric order up to [`MAX_INDEX`]:
//!
//! ```text
//! database      cdyno-0000001
//! document      cdyno-0000042            (random mode: cdyno-0000042-<hex>)
//! job           cdyno-0000001-0000002
//! per-job db    cdyno-repdb-0000003/_replicator
//! ```

use uuid::Uuid;

/// Zero-padding width of every numeric suffix.
pub const INDEX_WIDTH: usize = 7;

/// Largest index that still sorts correctly.
pub const MAX_INDEX: u32 = 9_999_999;

/// Database `prefix-NNNNNNN`.
pub fn db_name(prefix: &str, index: u32) -> String {
    format!("{}-{:07}", prefix, index)
}

/// Document id `prefix-NNNNNNN`.
pub fn make_id(sequence: u32, prefix: &str) -> String {
    format!("{}-{:07}", prefix, sequence)
}

/// Document id with a random suffix, for sources that write into one
/// shared target id space.
pub fn make_random_id(sequence: u32, prefix: &str) -> String {
    format!("{}-{:07}-{}", prefix, sequence, Uuid::new_v4().simple())
}

/// Replication job id `prefix-SSSSSSS-TTTTTTT`.
pub fn job_id(prefix: &str, source: u32, target: u32) -> String {
    format!("{}-{:07}-{:07}", prefix, source, target)
}

/// Name prefix shared by every per-job database of a run.
pub fn per_job_db_prefix(prefix: &str) -> String {
    format!("{}-repdb-", prefix)
}

/// Per-job database for the `job_index`-th job (1-based).
pub fn per_job_db(prefix: &str, job_index: u32) -> String {
    format!("{}{:07}/_replicator", per_job_db_prefix(prefix), job_index)
}

/// Random revision id (32 lowercase hex characters).
pub fn rev_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Key range covering every generated document id, as
/// `(start_key, end_key)` for an id-ordered scan.
pub fn id_key_range(prefix: &str) -> (String, String) {
    (format!("{}-", prefix), format!("{}-zzz", prefix))
}

/// Whether `id` belongs to this run's id space (design docs never do).
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-'))
}

pub fn is_design_doc(id: &str) -> bool {
    id.starts_with("_design/")
}
