//! Level-filling distribution of orphaned applications.
//!
//! Every application counts as one unit of load. Starting from the lowest
//! candidate score, an admission `level` is raised one step at a time and
//! each candidate at or below it receives an application, until none are
//! left. The result matches repeatedly picking the least-loaded candidate
//! (ties to the earlier candidate) but runs as a restartable linear scan,
//! which is fine because the candidate list is bounded by cluster size.

use thiserror::Error;
use tracing::debug;

/// Result type alias for planning.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors raised by the planner.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no eligible instances to place {0} application(s)")]
    NoCandidates(usize),
}

/// One candidate instance and what the plan gives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub address: String,
    /// Score from the registry snapshot.
    pub initial_score: u64,
    /// Score after the planned applications land, tracked locally only.
    pub final_score: u64,
    /// Applications assigned; zero means candidate but not chosen.
    pub count: u32,
}

/// Ephemeral plan for one rescheduling event. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPlan {
    /// Candidates in snapshot order, including zero-count entries.
    pub entries: Vec<PlanEntry>,
    /// Admission level when planning stopped.
    pub level: u64,
}

impl DistributionPlan {
    /// Entries that receive at least one application.
    pub fn recipients(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.count > 0)
    }

    /// Sum of all counts.
    pub fn total(&self) -> usize {
        self.entries.iter().map(|e| e.count as usize).sum()
    }

    /// Destination per application: each candidate's full count in order.
    pub fn assignments(&self) -> Vec<&str> {
        self.entries
            .iter()
            .flat_map(|e| std::iter::repeat_n(e.address.as_str(), e.count as usize))
            .collect()
    }

    /// Count assigned to `address`, `None` if it was not a candidate.
    pub fn count_for(&self, address: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.count)
    }
}

/// Plan `count` applications onto `candidates` (`(address, score)`, ascending by score).
pub fn plan_distribution(count: usize, candidates: &[(String, u64)]) -> PlanResult<DistributionPlan> {
    let Some((_, first_score)) = candidates.first() else {
        if count == 0 {
            return Ok(DistributionPlan {
                entries: Vec::new(),
                level: 0,
            });
        }
        return Err(PlanError::NoCandidates(count));
    };

    let mut scores: Vec<u64> = candidates.iter().map(|(_, s)| *s).collect();
    let mut counts = vec![0u32; candidates.len()];
    let mut level = *first_score;
    let mut remaining = count;

    'fill: while remaining > 0 {
        for idx in 0..scores.len() {
            if scores[idx] > level {
                level += 1;
                continue 'fill;
            }
            scores[idx] += 1;
            counts[idx] += 1;
            remaining -= 1;
            if remaining == 0 {
                break 'fill;
            }
        }
    }

    let entries: Vec<PlanEntry> = candidates
        .iter()
        .zip(scores.iter().zip(&counts))
        .map(|((address, initial), (&final_score, &count))| PlanEntry {
            address: address.clone(),
            initial_score: *initial,
            final_score,
            count,
        })
        .collect();

    debug!(
        applications = count,
        candidates = entries.len(),
        level,
        "distribution planned"
    );

    Ok(DistributionPlan { entries, level })
}
