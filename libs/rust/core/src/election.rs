//! Train-set election run at the start of each round.
//!
//! Every node votes for itself plus its best-ranked candidates. Votes are
//! collected for at most the voting timeout, then the most-voted peers form the
//! train set. Rounds are skewed across nodes, so each voter's newest ballot
//! counts; a ballot is only "fresh" for waiting purposes if it was cast for
//! this round or later.

use std::collections::{BTreeSet, HashMap};

use crate::envelope::{PeerId, Round};

#[derive(Debug, Default)]
pub struct TrainSetElection {
    ballots: HashMap<PeerId, (Round, Vec<PeerId>)>,
}

impl TrainSetElection {
    pub fn new() -> Self { Self::default() }

    /// The local ballot: self first, then the top `size - 1` candidates.
    pub fn ballot(local: &str, candidates: &[PeerId], size: usize) -> Vec<PeerId> {
        std::iter::once(local.to_string())
            .chain(candidates.iter().filter(|c| c.as_str() != local).take(size.saturating_sub(1)).cloned())
            .collect()
    }

    /// Keeps the newest ballot per voter.
    pub fn record(&mut self, voter: &str, round: Round, candidates: Vec<PeerId>) {
        match self.ballots.get(voter) {
            Some((r, _)) if *r > round => {}
            _ => { self.ballots.insert(voter.to_string(), (round, candidates)); }
        }
    }

    pub fn forget(&mut self, voter: &str) { self.ballots.remove(voter); }

    /// Every peer in `voters` has a ballot for `round` or later.
    pub fn complete(&self, round: Round, voters: &BTreeSet<PeerId>) -> bool {
        voters.iter().all(|v| self.ballots.get(v).map(|(r, _)| *r >= round).unwrap_or(false))
    }

    /// Top `size` eligible peers by vote count, identifier ascending on ties.
    /// `local` is always a member.
    pub fn tally(&self, local: &str, eligible: &BTreeSet<PeerId>, size: usize) -> BTreeSet<PeerId> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, candidates) in self.ballots.values() {
            for c in candidates.iter().filter(|c| c.as_str() != local && eligible.contains(*c)) {
                *counts.entry(c.as_str()).or_default() += 1;
            }
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        std::iter::once(local.to_string())
            .chain(ranked.into_iter().take(size.saturating_sub(1)).map(|(p, _)| p.to_string()))
            .collect()
    }
}
