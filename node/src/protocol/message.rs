use serde_derive::{Deserialize, Serialize};

use crate::protocol::clock::VectorClock;
use crate::protocol::qsc::{Round, Ticket};
use crate::protocol::{NodeId, Seq, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum MessageType {
    /// Raw proposal opening the sender's current time-step.
    Proposal,
    /// Unicast acknowledgement of one proposal. Unsequenced; bypasses
    /// causal ordering.
    Ack,
    /// Re-broadcast of a proposal that reached the acknowledgement
    /// threshold.
    Witness,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    /// Peer that created the message.
    pub from: NodeId,
    /// Sender-local sequence number, assigned at broadcast. Meaningless
    /// for `Ack`.
    pub seq: Seq,
    /// Sender's vector clock snapshot at issue time. Empty for `Ack`.
    pub vec: VectorClock,
    /// Sender's time-step when the message was issued.
    pub step: Step,
    pub typ: MessageType,
    /// For `Ack` and `Witness`, sequence number of the referenced proposal
    /// in the proposer's log.
    pub prop: Seq,
    /// Random rank of the proposal. Only meaningful for `Proposal`.
    pub ticket: Ticket,
    /// Piggybacked consensus state for the sender's live rounds.
    pub qsc: Vec<Round>,
}

impl Message {
    /// Blank message template a node mutates in place as its state
    /// machine progresses; broadcast stamps a copy.
    pub(crate) fn template(from: NodeId) -> Message {
        Message {
            from,
            seq: 0,
            vec: VectorClock::default(),
            step: 0,
            typ: MessageType::Proposal,
            prop: 0,
            ticket: 0,
            qsc: Vec::new(),
        }
    }

    pub(crate) fn ack(from: NodeId, step: Step, prop: Seq) -> Message {
        Message {
            from,
            seq: 0,
            vec: VectorClock::default(),
            step,
            typ: MessageType::Ack,
            prop,
            ticket: 0,
            qsc: Vec::new(),
        }
    }

    /// Stable content-derived identity of a broadcast message.
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            from: self.from,
            seq: self.seq,
            step: self.step,
        }
    }
}

/// Identity of a logged broadcast message. The step is carried along so
/// references can be expired without chasing them back to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MessageRef {
    pub from: NodeId,
    pub seq: Seq,
    pub step: Step,
}
