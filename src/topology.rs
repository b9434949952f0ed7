//! Replication topologies.
//!
//! A [`Topology`] maps a source range and a target range to the
//! `(source, target)` index pairs that get one replication job each:
//!
//! ```text
//! 1-to-n    sr=1      tr=(2,4)   1→2 1→3 1→4
//! n-to-1    sr=(2,4)  tr=1       2→1 3→1 4→1
//! n-to-n    sr=(1,3)  tr=(4,6)   1→4 2→5 3→6
//! chain     sr=(1,4)  tr=()      1→2 2→3 3→4
//! all       sr=(1,2)  tr=()      1→1 1→2 2→1 2→2
//! ```
//!
//! Planning is pure and never clamps: ranges that don't fit the pattern
//! are a [`HarnessError::Topology`].
//!
//! [`plan_comparison`] is the inverse question: which databases must be
//! compared once the jobs of a pair of ranges have run.

use crate::error::{HarnessError, Result};
use crate::range::DbRange;
use std::fmt;
use std::str::FromStr;

/// Replication pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    OneToN,
    NToOne,
    NToN,
    Chain,
    /// Complete graph over the source range, self-loops included.
    AllPairs,
}

impl Topology {
    pub const ALL: [Topology; 5] = [
        Topology::OneToN,
        Topology::NToOne,
        Topology::NToN,
        Topology::Chain,
        Topology::AllPairs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::OneToN => "1-to-n",
            Self::NToOne => "n-to-1",
            Self::NToN => "n-to-n",
            Self::Chain => "chain",
            Self::AllPairs => "all",
        }
    }

    /// Whether the target range is unused and jobs run between source dbs.
    pub fn source_only(&self) -> bool {
        matches!(self, Self::Chain | Self::AllPairs)
    }

    /// `(source, target)` pairs, in job order.
    pub fn plan(&self, sr: DbRange, tr: DbRange) -> Result<Vec<(u32, u32)>> {
        let err = |reason: String| HarnessError::topology(self.name(), reason);
        match self {
            Self::OneToN => {
                let s = match sr.low() {
                    Some(s) if sr.cardinality() == 1 => s,
                    _ => return Err(err(format!("source range {} must be a single database", sr))),
                };
                if tr.is_empty() {
                    return Err(err("target range is empty".to_string()));
                }
                Ok(tr.iter().map(|t| (s, t)).collect())
            }
            Self::NToOne => {
                let t = match tr.low() {
                    Some(t) if tr.cardinality() == 1 => t,
                    _ => return Err(err(format!("target range {} must be a single database", tr))),
                };
                if sr.is_empty() {
                    return Err(err("source range is empty".to_string()));
                }
                Ok(sr.iter().map(|s| (s, t)).collect())
            }
            Self::NToN => {
                if sr.is_empty() || sr.cardinality() != tr.cardinality() {
                    return Err(err(format!(
                        "source {} and target {} must have the same non-zero size",
                        sr, tr
                    )));
                }
                Ok(sr.iter().zip(tr.iter()).collect())
            }
            Self::Chain => {
                if !tr.is_empty() {
                    return Err(err(format!("target range {} must be unused", tr)));
                }
                if sr.cardinality() < 2 {
                    return Err(err(format!("source range {} needs at least 2 databases", sr)));
                }
                let dbs: Vec<u32> = sr.iter().collect();
                Ok(dbs.windows(2).map(|w| (w[0], w[1])).collect())
            }
            Self::AllPairs => {
                if !tr.is_empty() {
                    return Err(err(format!("target range {} must be unused", tr)));
                }
                if sr.is_empty() {
                    return Err(err("source range is empty".to_string()));
                }
                Ok(sr.iter().flat_map(|a| sr.iter().map(move |b| (a, b))).collect())
            }
        }
    }

    /// Source and target ranges of the `replicate_*_and_compare` scenario
    /// with `n` databases.
    pub fn scenario_ranges(&self, n: u32) -> Result<(DbRange, DbRange)> {
        let err = |reason: &str| HarnessError::topology(self.name(), reason.to_string());
        if n == 0 {
            return Err(err("n must be at least 1"));
        }
        let n = u64::from(n);
        let ranges = match self {
            Self::OneToN => (DbRange::single(1), span(2, n + 1)?),
            Self::NToOne => (span(2, n + 1)?, DbRange::single(1)),
            Self::NToN => (span(1, n)?, span(n + 1, 2 * n)?),
            Self::Chain => {
                if n < 2 {
                    return Err(err("a chain needs at least 2 databases"));
                }
                (span(1, n)?, DbRange::EMPTY)
            }
            Self::AllPairs => (span(1, n)?, DbRange::EMPTY),
        };
        Ok(ranges)
    }
}

fn span(low: u64, high: u64) -> Result<DbRange> {
    if high > u64::from(crate::ids::MAX_INDEX) {
        return Err(HarnessError::Config(format!(
            "database index {} exceeds {}",
            high,
            crate::ids::MAX_INDEX
        )));
    }
    // high <= MAX_INDEX, so both fit in u32
    DbRange::new(low as u32, high as u32)
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Topology {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| HarnessError::Config(format!("unknown topology '{}'", s)))
    }
}

// =============================================================================
// Comparison dispatch
// =============================================================================

/// How source and target ranges are compared after replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// No target range: consecutive source dbs must match.
    ChainAdjacent,
    OneToOne,
    /// One source against every target.
    Broadcast,
    /// Every source against the single target.
    Reduce,
    /// Pairwise, in order.
    Zip,
}

impl Comparison {
    /// Whether the right-hand side of each pair is a source db.
    pub fn right_is_source(&self) -> bool {
        matches!(self, Self::ChainAdjacent)
    }
}

/// Pairs `(left, right)` such that `right` must contain `left`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonPlan {
    pub kind: Comparison,
    pub pairs: Vec<(u32, u32)>,
}

/// Pick the comparison for a source/target range combination.
///
/// A source-only range with fewer than two databases needs no comparison
/// and yields an empty chain plan.
pub fn plan_comparison(sr: DbRange, tr: DbRange) -> Result<ComparisonPlan> {
    let (ns, nt) = (sr.cardinality(), tr.cardinality());
    let sources: Vec<u32> = sr.iter().collect();
    let targets: Vec<u32> = tr.iter().collect();

    if ns == 0 && nt > 0 {
        return Err(HarnessError::Config(format!(
            "cannot compare target dbs {} without sources",
            tr
        )));
    }

    let (kind, pairs) = if nt == 0 {
        let pairs = sources.windows(2).map(|w| (w[0], w[1])).collect();
        (Comparison::ChainAdjacent, pairs)
    } else if ns == 1 && nt == 1 {
        (Comparison::OneToOne, vec![(sources[0], targets[0])])
    } else if ns == 1 {
        (Comparison::Broadcast, targets.iter().map(|&t| (sources[0], t)).collect())
    } else if nt == 1 {
        (Comparison::Reduce, sources.iter().map(|&s| (s, targets[0])).collect())
    } else if ns == nt {
        (Comparison::Zip, sources.into_iter().zip(targets).collect())
    } else {
        return Err(HarnessError::Config(format!(
            "cannot compare source dbs {} with target dbs {}",
            sr, tr
        )));
    };
    Ok(ComparisonPlan { kind, pairs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lo: u32, hi: u32) -> DbRange {
        DbRange::new(lo, hi).unwrap()
    }

    #[test]
    fn test_one_to_n() {
        let pairs = Topology::OneToN.plan(DbRange::single(1), r(2, 4)).unwrap();
        assert_eq!(pairs, vec![(1, 2), (1, 3), (1, 4)]);
    }

    #[test]
    fn test_one_to_n_rejects_multiple_sources() {
        let err = Topology::OneToN.plan(r(1, 2), r(3, 4)).unwrap_err();
        assert!(matches!(err, HarnessError::Topology { .. }));
        assert!(Topology::OneToN.plan(DbRange::single(1), DbRange::EMPTY).is_err());
    }

    #[test]
    fn test_n_to_one() {
        let pairs = Topology::NToOne.plan(r(2, 4), DbRange::single(1)).unwrap();
        assert_eq!(pairs, vec![(2, 1), (3, 1), (4, 1)]);
        assert!(Topology::NToOne.plan(r(2, 4), r(1, 2)).is_err());
    }

    #[test]
    fn test_n_to_n() {
        let pairs = Topology::NToN.plan(r(1, 3), r(4, 6)).unwrap();
        assert_eq!(pairs, vec![(1, 4), (2, 5), (3, 6)]);
        assert!(Topology::NToN.plan(r(1, 3), r(4, 5)).is_err());
        assert!(Topology::NToN.plan(DbRange::EMPTY, DbRange::EMPTY).is_err());
    }

    #[test]
    fn test_chain() {
        let pairs = Topology::Chain.plan(r(1, 4), DbRange::EMPTY).unwrap();
        assert_eq!(pairs, vec![(1, 2), (2, 3), (3, 4)]);
        assert!(Topology::Chain.plan(DbRange::single(1), DbRange::EMPTY).is_err());
        assert!(Topology::Chain.plan(r(1, 4), DbRange::single(5)).is_err());
    }

    #[test]
    fn test_all_pairs_row_major() {
        let pairs = Topology::AllPairs.plan(r(1, 3), DbRange::EMPTY).unwrap();
        assert_eq!(
            pairs,
            vec![
                (1, 1),
                (1, 2),
                (1, 3),
                (2, 1),
                (2, 2),
                (2, 3),
                (3, 1),
                (3, 2),
                (3, 3)
            ]
        );
        assert!(Topology::AllPairs.plan(r(1, 3), r(4, 6)).is_err());
    }

    #[test]
    fn test_scenario_ranges() {
        assert_eq!(
            Topology::OneToN.scenario_ranges(3).unwrap(),
            (DbRange::single(1), r(2, 4))
        );
        assert_eq!(
            Topology::NToOne.scenario_ranges(3).unwrap(),
            (r(2, 4), DbRange::single(1))
        );
        assert_eq!(Topology::NToN.scenario_ranges(2).unwrap(), (r(1, 2), r(3, 4)));
        assert_eq!(
            Topology::Chain.scenario_ranges(3).unwrap(),
            (r(1, 3), DbRange::EMPTY)
        );
        assert!(Topology::Chain.scenario_ranges(1).is_err());
        assert_eq!(
            Topology::AllPairs.scenario_ranges(1).unwrap(),
            (DbRange::single(1), DbRange::EMPTY)
        );
        assert!(Topology::NToN.scenario_ranges(0).is_err());
        assert!(Topology::NToN.scenario_ranges(crate::ids::MAX_INDEX).is_err());
    }

    #[test]
    fn test_scenario_ranges_always_plan() {
        for topology in Topology::ALL {
            let n = if topology == Topology::Chain { 2 } else { 1 };
            for n in n..6 {
                let (sr, tr) = topology.scenario_ranges(n).unwrap();
                assert!(topology.plan(sr, tr).is_ok(), "{} n={}", topology, n);
            }
        }
    }

    #[test]
    fn test_parse_names() {
        for topology in Topology::ALL {
            assert_eq!(topology.name().parse::<Topology>().unwrap(), topology);
        }
        assert!("ring".parse::<Topology>().is_err());
    }

    #[test]
    fn test_comparison_dispatch() {
        let plan = plan_comparison(r(1, 3), DbRange::EMPTY).unwrap();
        assert_eq!(plan.kind, Comparison::ChainAdjacent);
        assert_eq!(plan.pairs, vec![(1, 2), (2, 3)]);
        assert!(plan.kind.right_is_source());

        let plan = plan_comparison(DbRange::single(1), DbRange::EMPTY).unwrap();
        assert!(plan.pairs.is_empty());

        let plan = plan_comparison(DbRange::single(1), DbRange::single(2)).unwrap();
        assert_eq!(plan.kind, Comparison::OneToOne);

        let plan = plan_comparison(DbRange::single(1), r(2, 3)).unwrap();
        assert_eq!(plan.kind, Comparison::Broadcast);
        assert_eq!(plan.pairs, vec![(1, 2), (1, 3)]);

        let plan = plan_comparison(r(2, 3), DbRange::single(1)).unwrap();
        assert_eq!(plan.kind, Comparison::Reduce);
        assert_eq!(plan.pairs, vec![(2, 1), (3, 1)]);

        let plan = plan_comparison(r(1, 2), r(3, 4)).unwrap();
        assert_eq!(plan.kind, Comparison::Zip);
        assert_eq!(plan.pairs, vec![(1, 3), (2, 4)]);
    }

    #[test]
    fn test_comparison_rejects_mismatch() {
        assert!(matches!(
            plan_comparison(r(1, 2), r(3, 5)),
            Err(HarnessError::Config(_))
        ));
        assert!(plan_comparison(DbRange::EMPTY, DbRange::single(1)).is_err());
    }
}
