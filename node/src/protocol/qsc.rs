//! Per-round consensus state and the merge rules that decide commitment.
//!
//! A consensus round spans three time-steps and three rounds are always in
//! flight, so every node keeps a four-slot window: the round that just
//! ended plus the three live ones. Every broadcast message piggybacks the
//! sender's window; receivers merge it element-wise. A round commits when
//! its best-ranked proposal of any kind, its best confirmed proposal and
//! its best reconfirmed proposal all name the same proposer.

use std::collections::VecDeque;

use log::{debug, trace};
use serde_derive::{Deserialize, Serialize};

use crate::protocol::node::Node;
use crate::protocol::Step;

/// Random rank of a proposal. Always strictly positive for a real
/// proposal, so `-1` can mark "nothing" and a spoiled tie.
pub type Ticket = i64;

/// Forced into every ticket so real tickets are positive and distinct from
/// the sentinel.
pub(crate) const TICKET_HIGH_BIT: i64 = 1 << 62;

/// Best proposal found so far along one dimension of a round: the
/// proposer and its ticket. `from` is `-1` when no proposal qualifies or
/// when a ticket tie between distinct proposers spoiled the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Best {
    pub from: i64,
    pub ticket: Ticket,
}

impl Best {
    pub const NONE: Best = Best {
        from: -1,
        ticket: -1,
    };

    /// Keeps the strictly better ticket. In spoiler mode a tie between
    /// distinct proposers is recorded as an invalid proposer; otherwise
    /// ties keep the incumbent.
    pub fn merge(&mut self, other: &Best, spoiler: bool) {
        if other.ticket > self.ticket {
            *self = *other;
        } else if spoiler && other.ticket == self.ticket && other.from != self.from {
            self.from = -1;
        }
    }
}

impl Default for Best {
    fn default() -> Best {
        Best::NONE
    }
}

/// State of one consensus round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Round {
    /// Best-ranked proposal of any kind seen in the round window.
    pub spoil: Best,
    /// Best threshold-witnessed proposal.
    pub conf: Best,
    /// Best doubly-witnessed proposal.
    pub reconf: Best,
    /// Whether this node observed the round as permanently committed.
    pub commit: bool,
}

impl Round {
    /// Merges the underlying rankings; the commit flag is computed once at
    /// round completion and never merged.
    pub fn merge(&mut self, other: &Round) {
        self.spoil.merge(&other.spoil, true);
        self.conf.merge(&other.conf, false);
        self.reconf.merge(&other.reconf, false);
    }
}

/// The four live rounds, indexed by absolute round number.
#[derive(Debug)]
pub(crate) struct RoundWindow {
    base: Step,
    rounds: VecDeque<Round>,
}

impl RoundWindow {
    pub(crate) fn new() -> RoundWindow {
        // Rounds 0..3 predate the pipeline; they are seeded empty and can
        // never commit.
        RoundWindow {
            base: 0,
            rounds: VecDeque::from(vec![Round::default(); 3]),
        }
    }

    pub(crate) fn get(&self, round: Step) -> Option<&Round> {
        round
            .checked_sub(self.base)
            .and_then(|offset| self.rounds.get(offset as usize))
    }

    pub(crate) fn get_mut(&mut self, round: Step) -> Option<&mut Round> {
        round
            .checked_sub(self.base)
            .and_then(|offset| self.rounds.get_mut(offset as usize))
    }

    /// Opens the next round, retiring the oldest once the pipeline is full.
    pub(crate) fn open(&mut self, round: Round) {
        self.rounds.push_back(round);
        if self.rounds.len() > 4 {
            self.rounds.pop_front();
            self.base += 1;
        }
    }

    /// The live rounds in order, as piggybacked on outbound messages.
    pub(crate) fn snapshot(&self) -> Vec<Round> {
        self.rounds.iter().copied().collect()
    }

    pub(crate) fn base(&self) -> Step {
        self.base
    }
}

/// Outcome of one completed consensus round as this node observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub round: Step,
    /// Proposer of the round's best confirmed proposal; `-1` if none.
    pub best: i64,
    pub ticket: Ticket,
    pub commit: bool,
}

impl Node {
    /// Opens the round starting at the new time-step and settles the one
    /// that just completed.
    pub(crate) fn advance_qsc(&mut self) {
        let ticket = (self.entropy.next() as i64) | TICKET_HIGH_BIT;
        self.tmpl.ticket = ticket;

        let opened = Round {
            spoil: Best {
                from: self.id as i64,
                ticket,
            },
            ..Round::default()
        };
        self.window.open(opened);

        let completing = self.tmpl.step;
        if let Some(round) = self.window.get_mut(completing) {
            round.commit = round.conf.from >= 0
                && round.conf.from == round.reconf.from
                && round.conf.from == round.spoil.from;
            let decision = Decision {
                round: completing,
                best: round.conf.from,
                ticket: round.conf.ticket,
                commit: round.commit,
            };
            if decision.commit {
                debug!(
                    "Node {} committed round {} to proposer {}",
                    self.id, decision.round, decision.best
                );
            } else {
                trace!("Node {} left round {} undecided", self.id, decision.round);
            }
            self.decisions.push(decision);
        }
    }

    /// Called when this node's current proposal becomes threshold
    /// witnessed: confirm it in the round opening now and reconfirm
    /// whatever is already confirmed one step deeper in the pipeline.
    pub(crate) fn witnessed_qsc(&mut self) {
        let step = self.tmpl.step;
        let confirmed = Best {
            from: self.id as i64,
            ticket: self.tmpl.ticket,
        };
        if let Some(round) = self.window.get_mut(step + 3) {
            round.conf.merge(&confirmed, false);
        }
        if let Some(round) = self.window.get_mut(step + 2) {
            let conf = round.conf;
            round.reconf.merge(&conf, false);
        }
    }

    /// Merges the round window piggybacked on a delivered message.
    pub(crate) fn merge_qsc(&mut self, step: Step, incoming: &[Round]) {
        for (offset, round) in incoming.iter().enumerate() {
            if let Some(mine) = self.window.get_mut(step + offset as u64) {
                mine.merge(round);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn best(from: i64, ticket: Ticket) -> Best {
        Best { from, ticket }
    }

    #[test]
    fn merge_prefers_the_higher_ticket() {
        let mut b = best(0, 5);
        b.merge(&best(1, 9), false);
        assert_eq!(b, best(1, 9));

        b.merge(&best(2, 3), false);
        assert_eq!(b, best(1, 9));
    }

    #[test]
    fn non_spoiler_ties_keep_the_incumbent() {
        let mut b = best(0, 5);
        b.merge(&best(1, 5), false);
        assert_eq!(b, best(0, 5));
    }

    #[test]
    fn spoiler_ties_invalidate_the_proposer() {
        let mut b = best(0, 5);
        b.merge(&best(1, 5), true);
        assert_eq!(b, best(-1, 5));

        // The same proposal again is not a collision.
        let mut same = best(2, 7);
        same.merge(&best(2, 7), true);
        assert_eq!(same, best(2, 7));
    }

    #[test]
    fn window_holds_at_most_four_rounds() {
        let mut window = RoundWindow::new();
        assert_eq!(window.snapshot().len(), 3);

        window.open(Round::default());
        assert_eq!(window.snapshot().len(), 4);
        assert_eq!(window.base(), 0);

        window.open(Round::default());
        assert_eq!(window.snapshot().len(), 4);
        assert_eq!(window.base(), 1);
        assert!(window.get(0).is_none());
        assert!(window.get(4).is_some());
        assert!(window.get(5).is_none());
    }

    #[test]
    fn round_merge_leaves_the_commit_flag_alone() {
        let mut mine = Round {
            commit: true,
            ..Round::default()
        };
        let other = Round {
            conf: best(1, 8),
            ..Round::default()
        };
        mine.merge(&other);
        assert!(mine.commit);
        assert_eq!(mine.conf, best(1, 8));
    }
}
