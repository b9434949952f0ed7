//! # repdyno
//!
//! A load-generation and convergence-verification harness for CouchDB-style
//! multi-master replication.
//!
//! ## Architecture
//!
//! The harness drives a document database purely through its HTTP API:
//! it creates numbered source and target databases, fills sources with
//! synthetic (optionally conflicted) documents, declares replication jobs
//! in a topology, then polls until every target is a faithful copy.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                               Harness                                 │
//! │                                                                       │
//! │  ┌──────────┐    ┌──────────┐    ┌─────────────────┐    ┌──────────┐  │
//! │  │ Topology │───►│ Filter   │───►│ JobMaterializer │───►│ job docs │  │
//! │  │ planner  │    │ compiler │    │ shared / per-job│    │          │  │
//! │  └──────────┘    └──────────┘    └─────────────────┘    └──────────┘  │
//! │        │                                                      │       │
//! │        ▼                                                      ▼       │
//! │  ┌─────────────┐                                 ┌─────────────────┐  │
//! │  │ Generator   │  fill sources                   │ Convergence     │  │
//! │  │ (rev trees) │                                 │ retry + compare │  │
//! │  └─────────────┘                                 └─────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Topologies
//!
//! 1. **1-to-n**, **n-to-1**, **n-to-n**: sources on the source server,
//!    targets on the target server
//! 2. **chain**, **all**: jobs run between source databases only
//!
//! ## Usage
//!
//! ```rust,no_run
//! use repdyno::{Harness, HarnessConfig, ScenarioSpec};
//!
//! #[tokio::main]
//! async fn main() -> repdyno::Result<()> {
//!     let config = HarnessConfig::from_env()?;
//!     let harness = Harness::connect(config).await?;
//!
//!     harness
//!         .replicate_n_to_n_and_compare(3, ScenarioSpec::new().num(1000).normal())
//!         .await?;
//!
//!     harness.clean().await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod convergence;
pub mod couch;
pub mod error;
pub mod filter;
pub mod generator;
pub mod harness;
pub mod ids;
pub mod jobs;
pub mod metrics;
pub mod range;
pub mod resilience;
pub mod topology;

// Re-exports for convenience
pub use cluster::{ClusterControl, ClusterSetting};
pub use config::HarnessConfig;
pub use convergence::{contains, CompareOptions};
pub use couch::{BulkWriteResult, Document, DocumentStore, ServerHandle};
pub use error::{CouchError, HarnessError, Result};
pub use filter::{FilterArg, FilterArtifact, FilterRequest};
pub use generator::{AttachmentSpec, FillSpec};
pub use harness::{Harness, NodeFailure, ScenarioReport, ScenarioSpec};
pub use jobs::{JobMaterializer, JobOptions};
pub use range::DbRange;
pub use resilience::{retry, Check, RetryPolicy};
pub use topology::Topology;
