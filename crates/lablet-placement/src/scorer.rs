//! Most-full-first ranking.
//!
//! Among the candidates that pass the predicate, prefer the one left with
//! the least slack after placement, so load consolidates onto few
//! workers and the rest stay eligible for scale-down. Slack is integer
//! arithmetic so equal inputs always rank identically; ties go to the
//! lowest worker id.

use std::collections::BTreeMap;

use tracing::debug;

use lablet_core::{Capacity, WorkerId};

use crate::candidate::{Candidate, Requirements};
use crate::predicate::{Rejection, check};

const SCALE: u64 = 10_000;

/// A passing candidate and its resulting slack.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Sum over cpu, memory, storage and nodes of the fraction left free,
    /// each scaled to `0..=10_000`.
    pub slack: u64,
}

impl ScoredCandidate {
    pub fn worker_id(&self) -> &str {
        self.candidate.worker_id()
    }
}

/// Outcome of ranking a set of candidates.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    /// Best first.
    pub ranked: Vec<ScoredCandidate>,
    /// Every candidate that failed, with its first failing check.
    pub rejected: BTreeMap<WorkerId, Rejection>,
}

impl Ranking {
    pub fn best(&self) -> Option<&ScoredCandidate> {
        self.ranked.first()
    }

    /// True when at least one RUNNING worker of the right license had
    /// room for the resources but not for the ports.
    pub fn port_bound(&self) -> bool {
        self.rejected.values().any(Rejection::is_port_exhaustion)
    }
}

fn fraction_left(declared: u32, remaining: u32) -> u64 {
    if declared == 0 {
        0
    } else {
        u64::from(remaining) * SCALE / u64::from(declared)
    }
}

/// Slack left on a worker after debiting `demand`.
pub fn slack_after(candidate: &Candidate, demand: &Capacity) -> u64 {
    let declared = candidate.capacity.declared;
    let remaining = candidate.capacity.available().saturating_sub(demand);
    fraction_left(declared.cpu_cores, remaining.cpu_cores)
        + fraction_left(declared.memory_gb, remaining.memory_gb)
        + fraction_left(declared.storage_gb, remaining.storage_gb)
        + fraction_left(declared.nodes, remaining.nodes)
}

/// Filter by the predicate and order by (slack, worker id).
pub fn rank_candidates(candidates: Vec<Candidate>, req: &Requirements) -> Ranking {
    let mut ranking = Ranking::default();

    for candidate in candidates {
        match check(&candidate, req) {
            Ok(()) => {
                let slack = slack_after(&candidate, &req.demand);
                ranking.ranked.push(ScoredCandidate { candidate, slack });
            }
            Err(rejection) => {
                debug!(worker = %candidate.worker.id, %rejection, "candidate rejected");
                ranking
                    .rejected
                    .insert(candidate.worker.id.clone(), rejection);
            }
        }
    }

    ranking.ranked.sort_by(|a, b| {
        a.slack
            .cmp(&b.slack)
            .then_with(|| a.worker_id().cmp(b.worker_id()))
    });
    ranking
}
