// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication scenario harness.
//!
//! The main orchestrator that ties together:
//! - Server handles for source, target and replicator via [`crate::couch`]
//! - Synthetic data via [`crate::generator`]
//! - Job documents via [`crate::jobs::JobMaterializer`]
//! - Convergence polls via [`crate::convergence`]
//! - An optional local cluster via [`crate::cluster::ClusterControl`]
//!
//! Everything a scenario needs is passed in explicitly: the configuration,
//! the server handles and, for fault-tolerance runs, the started cluster.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> repdyno::error::Result<()> {
//! use repdyno::config::HarnessConfig;
//! use repdyno::harness::{Harness, ScenarioSpec};
//!
//! let harness = Harness::connect(HarnessConfig::from_env()?).await?;
//! let report = harness
//!     .replicate_1_to_n_and_compare(3, ScenarioSpec::new().num(100).cycles(2))
//!     .await?;
//! assert_eq!(report.cycles_run(), 2);
//! # Ok(())
//! # }
//! ```

mod types;

pub use types::{CycleReport, NodeFailure, ScenarioReport, ScenarioSpec};

use crate::cluster::{ClusterControl, ClusterSetting};
use crate::config::HarnessConfig;
use crate::convergence::{self, CompareOptions};
use crate::couch::{self, AllDocsQuery, Document, DocumentStore, ServerHandle};
use crate::error::{CouchError, HarnessError, Result};
use crate::filter::{self, FilterArtifact};
use crate::generator::{self, FillReport, FillSpec};
use crate::ids;
use crate::jobs::{JobMaterializer, JobOptions, JobReport, REPLICATOR_DB};
use crate::metrics;
use crate::range::DbRange;
use crate::resilience::{retry, Check, RetryPolicy};
use crate::topology::{ComparisonPlan, Topology};
use futures::TryStreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use types::Resolved;
use uuid::Uuid;

/// Drives replication scenarios against one set of servers.
pub struct Harness {
    config: HarnessConfig,
    source: ServerHandle,
    target: ServerHandle,
    replicator: ServerHandle,
    jobs: JobMaterializer,
    /// Fields stamped into every generated document.
    src_params: Document,
    policy: RetryPolicy,
    compare: CompareOptions,
    cluster: Option<Arc<dyn ClusterControl>>,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("prefix", &self.config.prefix)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("replicator", &self.replicator)
            .field("cluster", &self.cluster.is_some())
            .finish()
    }
}

impl Harness {
    /// Connect to the configured servers over HTTP.
    ///
    /// Each server must answer `GET /` within the connect budget of
    /// [`RetryPolicy::connect`].
    pub async fn connect(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let timeout = config.client_timeout()?;

        let server = connect_server(&config.server_url, timeout).await?;
        let source = reuse_or_connect(&server, config.source_url(), timeout).await?;
        let target = reuse_or_connect(&server, config.target_url(), timeout).await?;
        let replicator = reuse_or_connect(&server, config.replicator_url(), timeout).await?;
        Self::with_servers(config, source, target, replicator)
    }

    /// Build a harness over existing handles.
    pub fn with_servers(
        config: HarnessConfig,
        source: ServerHandle,
        target: ServerHandle,
        replicator: ServerHandle,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.cycle_policy()?;
        let jobs = JobMaterializer::new(
            config.prefix.clone(),
            source.clone(),
            target.clone(),
            replicator.clone(),
            config.replication_params(),
        );
        info!(
            prefix = %config.prefix,
            source = %couch::redact(source.url()),
            target = %couch::redact(target.url()),
            replicator = %couch::redact(replicator.url()),
            "Harness ready"
        );
        Ok(Self {
            config,
            source,
            target,
            replicator,
            jobs,
            src_params: Document::new(),
            policy,
            compare: CompareOptions::default(),
            cluster: None,
        })
    }

    /// Attach a started cluster, enabling node-failure scenarios.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterControl>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Start `cluster` with the configured settings plus `overrides`, then
    /// connect to it.
    pub async fn start_cluster(
        config: HarnessConfig,
        cluster: Arc<dyn ClusterControl>,
        overrides: &[ClusterSetting],
    ) -> Result<Self> {
        config.validate()?;
        let base = match &config.cluster_settings {
            Some(list) => ClusterSetting::parse_list(list)?,
            None => Vec::new(),
        };
        let settings = ClusterSetting::merge(&base, overrides);
        for setting in &settings {
            debug!(setting = %setting, "Cluster setting");
        }
        let url = cluster.start(&settings).await?;
        info!(settings = settings.len(), "Cluster started");
        let harness = Self::connect(config.with_server_url(&url)).await?;
        Ok(harness.with_cluster(cluster))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn source(&self) -> &ServerHandle {
        &self.source
    }

    pub fn target(&self) -> &ServerHandle {
        &self.target
    }

    pub fn replicator(&self) -> &ServerHandle {
        &self.replicator
    }

    pub fn jobs(&self) -> &JobMaterializer {
        &self.jobs
    }

    /// Replace the fields stamped into every generated document.
    pub fn set_src_params(&mut self, params: Document) {
        self.src_params = params;
    }

    /// Replace the policy used by convergence polls.
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub fn set_compare_options(&mut self, compare: CompareOptions) {
        self.compare = compare;
    }

    // =========================================================================
    // Building blocks
    // =========================================================================

    /// Ensure every db of `sr` (source server) and `tr` (target server)
    /// exists. Target dbs are left to the replicator when `create_target`
    /// is configured.
    #[instrument(skip_all, fields(sr = %sr, tr = %tr))]
    pub async fn create_dbs(
        &self,
        sr: DbRange,
        tr: DbRange,
        reset_source: bool,
        reset_target: bool,
    ) -> Result<()> {
        for i in sr.iter() {
            self.source
                .get_or_create(&ids::db_name(self.prefix(), i), reset_source)
                .await?;
        }
        if !tr.is_empty() && !self.config.create_target {
            for i in tr.iter() {
                self.target
                    .get_or_create(&ids::db_name(self.prefix(), i), reset_target)
                    .await?;
            }
        }
        debug!(sources = sr.cardinality(), targets = tr.cardinality(), "Databases ready");
        Ok(())
    }

    /// Install the filter design document on every source db of `sr`.
    pub async fn sync_filter(&self, design_doc: Option<&Document>, sr: DbRange) -> Result<()> {
        let Some(design_doc) = design_doc else {
            return Ok(());
        };
        for i in sr.iter() {
            let db = ids::db_name(self.prefix(), i);
            upsert_document(self.source.store(), &db, design_doc.clone()).await?;
        }
        Ok(())
    }

    /// Fill source db `i`. `spec.extra` is merged over the harness-level
    /// source parameters and a fresh `some_data` value is stamped in.
    pub async fn fill(&self, i: u32, spec: FillSpec) -> Result<FillReport> {
        let mut spec = spec;
        let mut extra = self.src_params.clone();
        extra.extend(spec.extra);
        extra.insert(
            "some_data".into(),
            Value::String(Uuid::new_v4().simple().to_string()),
        );
        spec.extra = extra;
        let db = ids::db_name(self.prefix(), i);
        generator::fill(self.source.store(), &db, self.prefix(), &spec).await
    }

    /// Plan and write the jobs of `topology`.
    pub async fn replicate(
        &self,
        topology: Topology,
        sr: DbRange,
        tr: DbRange,
        opts: &JobOptions,
    ) -> Result<JobReport> {
        self.jobs.materialize(topology, sr, tr, opts).await
    }

    /// Remove job documents, per-job dbs and every `prefix-*` database on
    /// all servers. Returns the number of databases deleted.
    #[instrument(skip_all, fields(prefix = %self.prefix()))]
    pub async fn clean(&self) -> Result<usize> {
        let purged = self.jobs.purge().await?;
        let db_prefix = format!("{}-", self.prefix());
        let mut deleted = purged.databases;
        for server in [&self.replicator, &self.source, &self.target] {
            for db in server.store().list_databases().await? {
                if db.starts_with(&db_prefix) && server.delete_if_exists(&db).await? {
                    debug!(db = %db, "Removed database");
                    deleted += 1;
                }
            }
        }
        info!(jobs = purged.documents, databases = deleted, "Cleaned");
        Ok(deleted)
    }

    pub async fn source_docs(&self, i: u32) -> Result<Vec<Document>> {
        all_documents(self.source.store(), &ids::db_name(self.prefix(), i)).await
    }

    pub async fn target_docs(&self, i: u32) -> Result<Vec<Document>> {
        all_documents(self.target.store(), &ids::db_name(self.prefix(), i)).await
    }

    /// Every document of the shared job store.
    pub async fn job_docs(&self) -> Result<Vec<Document>> {
        self.jobs.list().await
    }

    /// Wait until every target (or next source, for chains) holds the
    /// documents of its source.
    pub async fn wait_till_all_equal(&self, sr: DbRange, tr: DbRange) -> Result<ComparisonPlan> {
        convergence::wait_till_all_equal(
            &self.source,
            &self.target,
            self.prefix(),
            sr,
            tr,
            &self.policy,
            self.compare,
        )
        .await
    }

    /// Wait until every job in the shared store has completed.
    pub async fn wait_for_jobs(&self) -> Result<()> {
        convergence::wait_for_jobs(self.replicator.store(), REPLICATOR_DB, self.prefix(), &self.policy).await
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    /// db 1 replicated into dbs `2..=n+1`.
    pub async fn replicate_1_to_n_and_compare(&self, n: u32, spec: ScenarioSpec) -> Result<ScenarioReport> {
        self.run_scenario(Topology::OneToN, n, spec).await
    }

    /// dbs `2..=n+1` replicated into db 1. Sources use random ids so they
    /// never collide in the shared target.
    pub async fn replicate_n_to_1_and_compare(&self, n: u32, spec: ScenarioSpec) -> Result<ScenarioReport> {
        self.run_scenario(Topology::NToOne, n, spec).await
    }

    /// dbs `1..=n` replicated pairwise into `n+1..=2n`.
    pub async fn replicate_n_to_n_and_compare(&self, n: u32, spec: ScenarioSpec) -> Result<ScenarioReport> {
        self.run_scenario(Topology::NToN, n, spec).await
    }

    /// db 1 → db 2 → … → db n. Requires `n >= 2`.
    pub async fn replicate_n_chain_and_compare(&self, n: u32, spec: ScenarioSpec) -> Result<ScenarioReport> {
        self.run_scenario(Topology::Chain, n, spec).await
    }

    /// Every db of `1..=n` replicated into every other, itself included.
    pub async fn replicate_all_and_compare(&self, n: u32, spec: ScenarioSpec) -> Result<ScenarioReport> {
        self.run_scenario(Topology::AllPairs, n, spec).await
    }

    async fn run_scenario(&self, topology: Topology, n: u32, spec: ScenarioSpec) -> Result<ScenarioReport> {
        let (sr, tr) = topology.scenario_ranges(n)?;
        self.setup_and_compare(topology, sr, tr, &spec).await
    }

    /// Set up databases and jobs for `topology` over `sr`/`tr`, then run
    /// `spec.cycles` fill-and-compare cycles.
    ///
    /// Configuration problems (filters, ranges, missing cluster) are
    /// reported before anything is written.
    #[instrument(skip_all, fields(prefix = %self.prefix(), topology = %topology, sr = %sr, tr = %tr))]
    pub async fn setup_and_compare(
        &self,
        topology: Topology,
        sr: DbRange,
        tr: DbRange,
        spec: &ScenarioSpec,
    ) -> Result<ScenarioReport> {
        let FilterArtifact { design_doc, params } = filter::compile(self.prefix(), &spec.filter)?;
        topology.plan(sr, tr)?;
        if spec.node_failure.is_some() && self.cluster.is_none() {
            return Err(HarnessError::Config(
                "node failure requested but no cluster is attached".to_string(),
            ));
        }
        let resolved = spec.resolve(&self.config);

        let mut rep_params = params;
        rep_params.extend(spec.rep_params.clone());
        let opts = JobOptions {
            normal: spec.normal,
            db_per_doc: spec.db_per_doc,
            rep_params,
        };

        self.jobs.purge().await?;
        self.create_dbs(sr, tr, resolved.reset_source, resolved.reset_target)
            .await?;
        self.sync_filter(design_doc.as_ref(), sr).await?;

        let mut report = ScenarioReport::new(topology, sr, tr);
        if !spec.normal {
            let written = self.replicate(topology, sr, tr, &opts).await?;
            tally(&mut report.jobs, written);
        }

        for cycle in 1..=spec.cycles {
            let started = Instant::now();
            let cycle_report = self
                .run_cycle(cycle, topology, sr, tr, spec, &resolved, &opts, &mut report.jobs)
                .await?;
            metrics::record_cycle(topology.name(), started.elapsed());
            report.cycles.push(cycle_report);

            if let Some(failure) = spec.node_failure.filter(|f| f.after_cycle == cycle) {
                self.kill_node(failure.node).await?;
                report.killed_node = Some(failure.node);
            }
        }

        info!(
            cycles = report.cycles_run(),
            jobs = report.jobs.written,
            failed = report.jobs.failed,
            "Scenario complete"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(cycle = cycle))]
    async fn run_cycle(
        &self,
        cycle: u32,
        topology: Topology,
        sr: DbRange,
        tr: DbRange,
        spec: &ScenarioSpec,
        resolved: &Resolved,
        opts: &JobOptions,
        jobs: &mut JobReport,
    ) -> Result<types::CycleReport> {
        if spec.cycles > 1 {
            info!(cycle, of = spec.cycles, "Cycle");
        }

        let fill_started = Instant::now();
        self.fill_sources(topology, sr, spec, resolved).await?;
        let fill = fill_started.elapsed();
        info!(
            num = resolved.num,
            revs = resolved.revs,
            branches = resolved.branches,
            elapsed_ms = fill.as_millis() as u64,
            "Sources filled"
        );

        let rep_started = Instant::now();
        let mut compared = false;
        let mut waited_for_jobs = false;
        if spec.normal {
            self.jobs.purge().await?;
            let written = self.replicate(topology, sr, tr, opts).await?;
            tally(jobs, written);
            if !resolved.skip_rev_check {
                self.wait_till_all_equal(sr, tr).await?;
                compared = true;
            } else {
                debug!("Skipping detailed comparison");
            }
            if !spec.db_per_doc {
                self.wait_for_jobs().await?;
                waited_for_jobs = true;
            }
        } else {
            self.wait_till_all_equal(sr, tr).await?;
            compared = true;
        }
        let replication = rep_started.elapsed();
        info!(elapsed_ms = replication.as_millis() as u64, "Replicated");

        Ok(types::CycleReport {
            cycle,
            fill,
            replication,
            compared,
            waited_for_jobs,
        })
    }

    /// Fill the sources a topology reads from: every source for n-to-1 and
    /// n-to-n, only the first one otherwise.
    async fn fill_sources(
        &self,
        topology: Topology,
        sr: DbRange,
        spec: &ScenarioSpec,
        resolved: &Resolved,
    ) -> Result<()> {
        let fill_spec = FillSpec {
            num: resolved.num,
            revs: resolved.revs,
            branches: resolved.branches,
            rand_ids: topology == Topology::NToOne,
            extra: spec.src_params.clone(),
            attachments: spec.attachments.clone(),
            delete_before_updating: resolved.delete_before_updating,
            new_edits: false,
        };
        let sources: Vec<u32> = match topology {
            Topology::NToOne | Topology::NToN => sr.iter().collect(),
            Topology::OneToN | Topology::Chain | Topology::AllPairs => sr.low().into_iter().collect(),
        };
        for i in sources {
            self.fill(i, fill_spec.clone()).await?;
        }
        Ok(())
    }

    async fn kill_node(&self, node: u32) -> Result<()> {
        let cluster = self.cluster.as_ref().ok_or_else(|| {
            HarnessError::Config("node failure requested but no cluster is attached".to_string())
        })?;
        warn!(node, "Killing cluster node");
        cluster.kill_node(node).await?;
        metrics::record_node_kill(node);
        Ok(())
    }
}

fn tally(total: &mut JobReport, written: JobReport) {
    total.written += written.written;
    total.failed += written.failed;
}

async fn connect_server(url: &str, timeout: Option<Duration>) -> Result<ServerHandle> {
    let handle = ServerHandle::http(url, timeout)?;
    let store = handle.shared_store();
    let identity = retry("connect", &RetryPolicy::connect(), &Check::Any, || {
        store.server_identity()
    })
    .await?;
    let version = identity
        .get("version")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown");
    debug!(url = %couch::redact(handle.url()), version = %version, "Connected");
    Ok(handle)
}

async fn reuse_or_connect(
    server: &ServerHandle,
    url: &str,
    timeout: Option<Duration>,
) -> Result<ServerHandle> {
    match url::Url::parse(url) {
        Ok(parsed) if &parsed == server.url() => Ok(server.clone()),
        _ => connect_server(url, timeout).await,
    }
}

/// Write `doc`, taking over the current `_rev` if it already exists.
pub async fn upsert_document(store: &dyn DocumentStore, db: &str, mut doc: Document) -> Result<String> {
    let id = couch::doc_id(&doc)
        .ok_or_else(|| HarnessError::Config("document to upsert has no _id".to_string()))?
        .to_string();
    match store.get_document(db, &id).await {
        Ok(existing) => {
            if let Some(rev) = couch::doc_rev(&existing) {
                doc.insert("_rev".into(), rev.into());
            }
        }
        Err(CouchError::NotFound { .. }) => {
            doc.remove("_rev");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(store.put_document(db, doc).await?)
}

async fn all_documents(store: &dyn DocumentStore, db: &str) -> Result<Vec<Document>> {
    let rows: Vec<_> = couch::stream_all(store, db, AllDocsQuery::docs())
        .try_collect()
        .await?;
    Ok(rows.into_iter().filter_map(|row| row.doc).collect())
}
