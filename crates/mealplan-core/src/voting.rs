//! Instant-runoff tallying with deterministic tie-breaks.
//!
//! The engine is pure: it takes the candidate IDs and each voter's ranking
//! and returns the winner together with the elimination order. IDs only
//! need a total order; ties are always broken toward the smallest ID.
//!
//! Tie handling:
//!
//! - A round's leader wins outright with strictly more than half of the
//!   non-abstaining ballots.
//! - If a single candidate has the fewest votes it is eliminated.
//! - If several (but not all) candidates share the fewest votes, they are
//!   eliminated together, recorded in ascending ID order.
//! - If every remaining candidate has the same count, the smallest ID is
//!   eliminated while three or more remain and at least one vote is
//!   counted. With two left, or when no ballot reaches any remaining
//!   candidate, further rounds cannot change the picture: the smallest ID
//!   wins with `tiebroken = true`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::Hash;

use crate::error::{CoreError, CoreResult};

/// Vote counts for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round<K> {
    pub counts: BTreeMap<K, usize>,
    pub abstentions: usize,
}

/// Outcome of a tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally<K> {
    pub winner: Option<K>,
    pub tiebroken: bool,
    /// Candidates in the order they were eliminated.
    pub eliminated: Vec<K>,
    pub rounds: Vec<Round<K>>,
}

impl<K> Tally<K> {
    fn no_winner() -> Self {
        Self {
            winner: None,
            tiebroken: false,
            eliminated: Vec::new(),
            rounds: Vec::new(),
        }
    }
}

/// Tally `ballots` (most preferred first) over `options`.
///
/// Ranked IDs that are not among `options` are ignored. With no ballots
/// there is no winner.
pub fn instant_runoff<K: Ord + Clone>(options: &[K], ballots: &[Vec<K>]) -> Tally<K> {
    let mut candidates: BTreeSet<K> = options.iter().cloned().collect();
    if ballots.is_empty() || candidates.is_empty() {
        return Tally::no_winner();
    }

    let mut tally = Tally::no_winner();

    loop {
        let round = count_round(&candidates, ballots);
        let active = ballots.len() - round.abstentions;

        if candidates.len() == 1 {
            tally.winner = candidates.first().cloned();
            tally.rounds.push(round);
            return tally;
        }

        let top = round.counts.values().copied().max().unwrap_or(0);
        let low = round.counts.values().copied().min().unwrap_or(0);

        if active > 0 && top * 2 > active {
            tally.winner = round
                .counts
                .iter()
                .find(|(_, n)| **n == top)
                .map(|(k, _)| k.clone());
            tally.rounds.push(round);
            return tally;
        }

        let lowest: Vec<K> = round
            .counts
            .iter()
            .filter(|(_, n)| **n == low)
            .map(|(k, _)| k.clone())
            .collect();

        if lowest.len() == candidates.len() {
            if candidates.len() == 2 || top == 0 {
                tally.winner = candidates.first().cloned();
                tally.tiebroken = true;
                tally.rounds.push(round);
                return tally;
            }
            // BTreeSet order: the first is the smallest ID.
            if let Some(smallest) = candidates.pop_first() {
                tally.eliminated.push(smallest);
            }
        } else {
            for k in lowest {
                candidates.remove(&k);
                tally.eliminated.push(k);
            }
        }
        tally.rounds.push(round);
    }
}

fn count_round<K: Ord + Clone>(candidates: &BTreeSet<K>, ballots: &[Vec<K>]) -> Round<K> {
    let mut counts: BTreeMap<K, usize> = candidates.iter().map(|k| (k.clone(), 0)).collect();
    let mut abstentions = 0;

    for ballot in ballots {
        match ballot.iter().find(|k| candidates.contains(*k)) {
            Some(choice) => {
                if let Some(n) = counts.get_mut(choice) {
                    *n += 1;
                }
            }
            None => abstentions += 1,
        }
    }

    Round {
        counts,
        abstentions,
    }
}

/// Check that `ranking` is a permutation of `options`: every option ranked
/// exactly once, nothing else.
pub fn validate_ranking<K: Eq + Hash + std::fmt::Display>(
    options: &[K],
    ranking: &[K],
) -> CoreResult<()> {
    if ranking.len() != options.len() {
        return Err(CoreError::invalid(format!(
            "ranking must list all {} options exactly once, got {}",
            options.len(),
            ranking.len()
        )));
    }

    let known: HashSet<&K> = options.iter().collect();
    let mut seen: HashSet<&K> = HashSet::with_capacity(ranking.len());
    for id in ranking {
        if !known.contains(id) {
            return Err(CoreError::invalid(format!(
                "option {id} is not a live option of this event"
            )));
        }
        if !seen.insert(id) {
            return Err(CoreError::invalid(format!("option {id} is ranked twice")));
        }
    }
    Ok(())
}
