//! Vector and matrix clocks over a fixed group.

use std::fmt::{Display, Error, Formatter};

use serde_derive::{Deserialize, Serialize};

use crate::protocol::NodeId;

/// Length-N vector counting, per peer, how many of that peer's messages
/// the holder has acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VectorClock(Vec<u64>);

impl VectorClock {
    pub fn new(size: usize) -> VectorClock {
        VectorClock(vec![0; size])
    }

    pub fn get(&self, peer: NodeId) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    pub fn set(&mut self, peer: NodeId, count: u64) {
        self.0[peer] = count;
    }

    /// Partial order: `self ≤ other` iff every component is.
    pub fn le(&self, other: &VectorClock) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(peer, count)| *count <= other.get(peer))
    }
}

impl Display for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let counts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "<{}>", counts.join(" "))
    }
}

/// One vector clock row per peer: row `p` is this node's best knowledge of
/// peer `p`'s vector clock. The holder's own row is its vector clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixClock {
    rows: Vec<VectorClock>,
}

impl MatrixClock {
    pub fn new(size: usize) -> MatrixClock {
        MatrixClock {
            rows: vec![VectorClock::new(size); size],
        }
    }

    pub fn row(&self, peer: NodeId) -> &VectorClock {
        &self.rows[peer]
    }

    pub fn row_mut(&mut self, peer: NodeId) -> &mut VectorClock {
        &mut self.rows[peer]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_is_componentwise() {
        let mut a = VectorClock::new(3);
        let mut b = VectorClock::new(3);
        assert!(a.le(&b) && b.le(&a));

        b.set(1, 2);
        assert!(a.le(&b));
        assert!(!b.le(&a));

        a.set(0, 1);
        assert!(!a.le(&b));
        assert!(!b.le(&a));
    }

    #[test]
    fn matrix_rows_are_independent() {
        let mut mat = MatrixClock::new(2);
        mat.row_mut(0).set(1, 3);
        assert_eq!(mat.row(0).get(1), 3);
        assert_eq!(mat.row(1).get(1), 0);
    }

    #[test]
    fn display_lists_counts() {
        let mut clock = VectorClock::new(3);
        clock.set(2, 7);
        assert_eq!(clock.to_string(), "<0 0 7>");
    }
}
