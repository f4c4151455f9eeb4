//! Placement policies for floating IP claims.
//!
//! Given the set of currently assigned claims and a pool of candidate
//! nodes, these policies pick the node that should receive the next
//! claim. They are pure functions: no I/O, no mutation, deterministic
//! for identical inputs, so callers can re-run them safely.
//!
//! Candidate discovery (which nodes are alive) is the caller's
//! concern; an empty pool is always an error, never a default.

use std::collections::HashMap;

use thiserror::Error;

/// Placement errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// The candidate pool was empty.
    #[error("no eligible nodes available")]
    NoEligibleNodes,
}

/// Pick the least-loaded candidate.
///
/// `assigned` is the owning node name of every currently known claim;
/// empty names (unassigned claims) carry no weight. Each candidate is
/// scored by how many claims it already owns, and the first candidate
/// with the minimum score wins — ties break by input order, not
/// randomly, so repeated calls over unchanged state agree.
pub fn pick_fair<'a, I, S>(assigned: I, candidates: &'a [String]) -> Result<&'a str, PlacementError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tally: HashMap<String, usize> = HashMap::new();
    for node_name in assigned {
        let node_name = node_name.as_ref();
        if node_name.is_empty() {
            continue;
        }
        *tally.entry(node_name.to_string()).or_insert(0) += 1;
    }

    let mut best: Option<(&'a str, usize)> = None;
    for candidate in candidates {
        let count = tally.get(candidate.as_str()).copied().unwrap_or(0);
        match best {
            Some((_, min)) if count >= min => {}
            _ => best = Some((candidate.as_str(), count)),
        }
    }

    best.map(|(node, _)| node).ok_or(PlacementError::NoEligibleNodes)
}

/// Pick the first candidate unconditionally.
///
/// Degenerate policy for when fairness is disabled or claim metadata
/// is unavailable.
pub fn pick_first(candidates: &[String]) -> Result<&str, PlacementError> {
    candidates
        .first()
        .map(String::as_str)
        .ok_or(PlacementError::NoEligibleNodes)
}
