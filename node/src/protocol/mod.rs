//! Live-messaging consensus stack.
//!
//! Participating peers run three tightly coupled layers:
//!
//! CAUSAL ORDER:
//!      1. Every broadcast message carries the sender's vector clock; a
//!         message is delivered upward only after everything it causally
//!         depends on has been delivered.
//!
//! THRESHOLD CLOCK:
//!     1. On entering a time-step a node broadcasts a proposal with a
//!        random ticket.
//!     2. When a threshold of peers has acknowledged the proposal, the node
//!        re-broadcasts it as witnessed.
//!     3. When a node has collected a threshold of witnessed proposals for
//!        the current step, it advances to the next step.
//! CONSENSUS:
//!     1. Each time-step opens a consensus round spanning three steps;
//!        three rounds are always in flight.
//!     2. A round commits when the best-ticketed proposal seen anywhere in
//!        the round is also the best confirmed and best reconfirmed one.
//!
//! Limitations:
//! - Only fail-stop faults are tolerated. A peer that lies about sequence
//!   numbers or witness references is detected and treated as fatal, but
//!   equivocation is not.
//! - A round that does not commit is merely undecided on this node; other
//!   nodes may have observed the same round as committed. Committed or
//!   not, every node adopts the same best proposal for a round any node
//!   committed, so history never forks.
//! - The stack makes progress only when messages arrive. Liveness is up to
//!   the peering layer, which must be reliable and FIFO per channel.

use thiserror::Error;

pub use crate::protocol::clock::{MatrixClock, VectorClock};
pub use crate::protocol::message::{Message, MessageRef, MessageType};
pub use crate::protocol::node::{Node, PeerNetwork, StepView};
pub use crate::protocol::qsc::{Best, Decision, Round, Ticket};

pub(crate) mod causal;
pub(crate) mod clock;
pub(crate) mod message;
pub(crate) mod node;
pub(crate) mod qsc;
pub(crate) mod tlc;

/// Identifier of a group participant, `0..group size`.
pub type NodeId = usize;

/// Sender-local sequence number of a broadcast message.
pub type Seq = u64;

/// Logical time-step of the threshold clock.
pub type Step = u64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("duplicate message from peer {from}: sequence {seq} was already delivered")]
    DuplicateMessage { from: NodeId, seq: Seq },
    #[error("witness from peer {from} does not reference a proposal (sequence {prop})")]
    InvalidWitness { from: NodeId, prop: Seq },
    #[error("message from unknown peer {peer}")]
    UnknownPeer { peer: NodeId },
    #[error("network send failed: {0}")]
    Network(#[source] anyhow::Error),
}
