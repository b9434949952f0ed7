//! Scenario inputs and outputs.
//!
//! A [`ScenarioSpec`] carries every per-call override of a
//! `replicate_*_and_compare` run. Fields left as `None` fall back to the
//! [`HarnessConfig`] the harness was built with.
//!
//! # Cycle flow
//!
//! ```text
//! normal       ┌─ fill ─ purge jobs ─ write jobs ─ compare ─ wait jobs ─┐ × cycles
//!              └────────────────────────────────────────────────────────┘
//! continuous   write jobs ─┬─ fill ─ compare ─┐ × cycles
//!                          └──────────────────┘
//! ```

use crate::config::HarnessConfig;
use crate::couch::Document;
use crate::filter::FilterRequest;
use crate::generator::AttachmentSpec;
use crate::jobs::JobReport;
use crate::range::DbRange;
use crate::topology::Topology;
use serde_json::{Map, Value};
use std::time::Duration;

/// Kill a cluster node once a given cycle has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFailure {
    pub after_cycle: u32,
    pub node: u32,
}

/// Per-call overrides of one scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSpec {
    pub cycles: u32,
    pub num: Option<u32>,
    pub revs: Option<u32>,
    pub branches: Option<u32>,
    /// One-shot jobs, recreated every cycle.
    pub normal: bool,
    pub db_per_doc: bool,
    /// Extra fields for every job document.
    pub rep_params: Map<String, Value>,
    /// Extra fields for every generated document.
    pub src_params: Document,
    pub attachments: Option<AttachmentSpec>,
    pub reset_target: Option<bool>,
    pub reset_source: Option<bool>,
    pub skip_rev_check: Option<bool>,
    pub delete_before_updating: Option<bool>,
    pub filter: FilterRequest,
    pub node_failure: Option<NodeFailure>,
}

impl Default for ScenarioSpec {
    fn default() -> Self {
        Self {
            cycles: 1,
            num: None,
            revs: None,
            branches: None,
            normal: false,
            db_per_doc: false,
            rep_params: Map::new(),
            src_params: Document::new(),
            attachments: None,
            reset_target: None,
            reset_source: None,
            skip_rev_check: None,
            delete_before_updating: None,
            filter: FilterRequest::default(),
            node_failure: None,
        }
    }
}

impl ScenarioSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn num(mut self, num: u32) -> Self {
        self.num = Some(num);
        self
    }

    pub fn revs(mut self, revs: u32) -> Self {
        self.revs = Some(revs);
        self
    }

    pub fn branches(mut self, branches: u32) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn normal(mut self) -> Self {
        self.normal = true;
        self
    }

    pub fn db_per_doc(mut self) -> Self {
        self.db_per_doc = true;
        self
    }

    pub fn filter(mut self, filter: FilterRequest) -> Self {
        self.filter = filter;
        self
    }

    pub fn attachments(mut self, attachments: AttachmentSpec) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn skip_rev_check(mut self, skip: bool) -> Self {
        self.skip_rev_check = Some(skip);
        self
    }

    pub fn kill_node(mut self, node: u32, after_cycle: u32) -> Self {
        self.node_failure = Some(NodeFailure { after_cycle, node });
        self
    }

    pub(crate) fn resolve(&self, config: &HarnessConfig) -> Resolved {
        Resolved {
            num: self.num.unwrap_or(config.num_docs),
            revs: self.revs.unwrap_or(config.num_revs).max(1),
            branches: self.branches.unwrap_or(config.num_branches).max(1),
            reset_target: self.reset_target.unwrap_or(config.reset_target),
            reset_source: self.reset_source.unwrap_or(config.reset_source),
            skip_rev_check: self.skip_rev_check.unwrap_or(config.skip_rev_check),
            delete_before_updating: self
                .delete_before_updating
                .unwrap_or(config.delete_before_updating),
        }
    }
}

/// Scenario settings after config fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub num: u32,
    pub revs: u32,
    pub branches: u32,
    pub reset_target: bool,
    pub reset_source: bool,
    pub skip_rev_check: bool,
    pub delete_before_updating: bool,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u32,
    pub fill: Duration,
    /// From job creation (normal) or end of fill (continuous) until
    /// convergence was confirmed.
    pub replication: Duration,
    /// Whether the pairwise equality poll ran.
    pub compared: bool,
    /// Whether the job-completion poll ran.
    pub waited_for_jobs: bool,
}

/// Outcome of a `replicate_*_and_compare` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub topology: Topology,
    pub sr: DbRange,
    pub tr: DbRange,
    pub cycles: Vec<CycleReport>,
    /// Jobs written across all cycles.
    pub jobs: JobReport,
    pub killed_node: Option<u32>,
}

impl ScenarioReport {
    pub(crate) fn new(topology: Topology, sr: DbRange, tr: DbRange) -> Self {
        Self {
            topology,
            sr,
            tr,
            cycles: Vec::new(),
            jobs: JobReport::default(),
            killed_node: None,
        }
    }

    pub fn cycles_run(&self) -> usize {
        self.cycles.len()
    }
}
