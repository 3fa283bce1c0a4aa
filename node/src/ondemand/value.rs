//! The unit of information clients write to and read from member stores.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::protocol::{NodeId, Step};

/// Head of the agreed history: the round that produced it and the
/// application data that won it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Head {
    pub step: Step,
    pub data: String,
}

/// One proposal: the member register it was written on behalf of, its
/// random priority, and the application data riding on it. Every client
/// draws one fresh priority per register per round; the register's
/// first-come write fixes which client's proposal that member backs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Proposal {
    pub node: NodeId,
    /// Strictly positive for a real proposal; zero means none.
    pub priority: u64,
    pub data: String,
}

impl Proposal {
    pub fn none() -> Proposal {
        Proposal::default()
    }

    pub fn is_none(&self) -> bool {
        self.priority == 0
    }
}

/// Values keyed by the member register they were read from.
pub type ValueSet = BTreeMap<NodeId, Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Value {
    pub step: Step,
    /// The writer's history head when the round started.
    pub head: Head,
    /// The proposal this value advances: the writer's own in the first
    /// broadcast, the best spread proposal in the second.
    pub prop: Proposal,
    /// Receive set carried over from the preceding threshold receive.
    pub receive: ValueSet,
    /// Broadcast set from the preceding threshold broadcast.
    pub broadcast: ValueSet,
}

impl Value {
    pub(crate) fn proposal(step: Step, head: Head, prop: Proposal) -> Value {
        Value {
            step,
            head,
            prop,
            receive: ValueSet::new(),
            broadcast: ValueSet::new(),
        }
    }

    pub(crate) fn relay(step: Step, head: Head, receive: ValueSet) -> Value {
        Value {
            step,
            head,
            prop: Proposal::none(),
            receive,
            broadcast: ValueSet::new(),
        }
    }
}

/// The best proposal carried by any value in the set. Priority decides;
/// ties between distinct members break deterministically but such a
/// winner can never satisfy the commit rule.
pub(crate) fn best_proposal(set: &ValueSet) -> Proposal {
    let mut best = Proposal::none();
    for value in set.values() {
        let candidate = &value.prop;
        if candidate.priority > best.priority
            || (candidate.priority == best.priority && candidate.node > best.node)
        {
            best = candidate.clone();
        }
    }
    best
}

/// True when `prop` itself appears in the set and strictly outranks every
/// other distinct proposal there.
pub(crate) fn uniquely_best(set: &ValueSet, prop: &Proposal) -> bool {
    if prop.is_none() {
        return false;
    }
    let mut present = false;
    for value in set.values() {
        if value.prop == *prop {
            present = true;
        } else if value.prop.priority >= prop.priority {
            return false;
        }
    }
    present
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: NodeId, priority: u64) -> (NodeId, Value) {
        let prop = Proposal {
            node,
            priority,
            data: format!("from {node}"),
        };
        (node, Value::proposal(0, Head::default(), prop))
    }

    #[test]
    fn best_proposal_picks_the_highest_priority() {
        let set: ValueSet = [entry(0, 5), entry(1, 9), entry(2, 3)].into();
        assert_eq!(best_proposal(&set).node, 1);
        assert_eq!(best_proposal(&ValueSet::new()), Proposal::none());
    }

    #[test]
    fn unique_best_requires_presence_and_strict_dominance() {
        let set: ValueSet = [entry(0, 5), entry(1, 9)].into();
        let winner = set[&1].prop.clone();
        assert!(uniquely_best(&set, &winner));

        // Absent proposal, even with the top priority.
        let ghost = Proposal {
            node: 2,
            priority: 11,
            data: "ghost".into(),
        };
        assert!(!uniquely_best(&set, &ghost));

        // A tied distinct proposal spoils uniqueness.
        let tied: ValueSet = [entry(0, 9), entry(1, 9)].into();
        assert!(!uniquely_best(&tied, &tied[&1].prop.clone()));

        assert!(!uniquely_best(&set, &Proposal::none()));
    }
}
