//! Fuzz target for topology and comparison planning.
//!
//! This tests that planning never panics on arbitrary ranges and that
//! every planned job stays inside the ranges it was given.

#![no_main]

use libfuzzer_sys::fuzz_target;
use repdyno::range::DbRange;
use repdyno::topology::{plan_comparison, Topology};

fn range(low: u16, high: u16) -> DbRange {
    DbRange::new(u32::from(low), u32::from(high)).unwrap_or(DbRange::EMPTY)
}

fuzz_target!(|data: (u8, u16, u16, u16, u16)| {
    let (kind, s_lo, s_hi, t_lo, t_hi) = data;
    let topology = Topology::ALL[usize::from(kind) % Topology::ALL.len()];
    // keep all-pairs plans small
    let (sr, tr) = (range(s_lo, s_hi.min(s_lo.saturating_add(64))), range(t_lo, t_hi));

    if let Ok(jobs) = topology.plan(sr, tr) {
        for (s, t) in jobs {
            assert!(sr.contains(s));
            assert!(if topology.source_only() { sr.contains(t) } else { tr.contains(t) });
        }
    }

    if let Ok(plan) = plan_comparison(sr, tr) {
        for (left, _) in plan.pairs {
            assert!(sr.contains(left));
        }
    }

    let _ = topology.scenario_ranges(u32::from(s_lo));
});
