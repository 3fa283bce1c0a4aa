use std::collections::{HashMap, HashSet};

use log::debug;

use crate::config::{ConfigurationError, GroupConfig};
use crate::protocol::causal::CausalOrder;
use crate::protocol::clock::VectorClock;
use crate::protocol::message::{Message, MessageRef, MessageType};
use crate::protocol::qsc::{Decision, RoundWindow};
use crate::protocol::{NodeId, ProtocolError, Step};
use crate::utilities::entropy::Entropy;

/// Outbound side of the peering layer. Implementations must deliver
/// reliably and in FIFO order per directed channel; everything else,
/// including transport security, is up to them.
pub trait PeerNetwork: Send {
    fn send(&mut self, dest: NodeId, msg: Message) -> anyhow::Result<()>;

    /// Sends a copy to every other group member. Implementations with an
    /// efficient multicast primitive can override this.
    fn multicast(&mut self, from: NodeId, group: usize, msg: &Message) -> anyhow::Result<()> {
        for dest in (0..group).filter(|dest| *dest != from) {
            self.send(dest, msg.clone())?;
        }
        Ok(())
    }
}

/// What one peer had seen and witnessed at one of its step boundaries, as
/// recorded when its step-opening proposal arrived.
#[derive(Debug, Clone, Default)]
pub struct StepView {
    pub saw: HashSet<MessageRef>,
    pub wit: HashSet<MessageRef>,
}

/// One group participant's entire protocol stack. All state is owned
/// exclusively; the embedding dispatches inbound messages under whatever
/// lock or executor it chooses, one at a time.
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) group: usize,
    pub(crate) threshold: usize,
    pub(crate) max_steps: Step,
    pub(crate) peers: Box<dyn PeerNetwork>,
    pub(crate) entropy: Box<dyn Entropy>,
    pub(crate) causal: CausalOrder,
    /// Message template mutated in place as the step state machine moves;
    /// broadcast stamps a copy.
    pub(crate) tmpl: Message,
    /// Peers that acknowledged our current proposal, ourselves included.
    pub(crate) acks: HashSet<NodeId>,
    /// Distinct proposals we have seen threshold witnessed this step.
    pub(crate) wits: HashSet<MessageRef>,
    pub(crate) window: RoundWindow,
    pub(crate) decisions: Vec<Decision>,
    pub(crate) step_views: Vec<HashMap<Step, StepView>>,
    pub(crate) done: bool,
}

impl Node {
    pub fn new(
        config: &GroupConfig,
        id: NodeId,
        peers: Box<dyn PeerNetwork>,
        entropy: Box<dyn Entropy>,
    ) -> Result<Node, ConfigurationError> {
        config.validate()?;
        if id >= config.size {
            return Err(ConfigurationError::Other(format!(
                "node id {id} outside group of {}",
                config.size
            )));
        }
        Ok(Node {
            id,
            group: config.size,
            threshold: config.threshold(),
            max_steps: config.max_steps,
            peers,
            entropy,
            causal: CausalOrder::new(id, config.size),
            tmpl: Message::template(id),
            acks: HashSet::new(),
            wits: HashSet::new(),
            window: RoundWindow::new(),
            decisions: Vec::new(),
            step_views: vec![HashMap::new(); config.size],
            done: false,
        })
    }

    /// Enters time-step zero and broadcasts the first proposal.
    pub fn start(&mut self) -> Result<(), ProtocolError> {
        debug!(
            "Node {} starting: group {}, threshold {}",
            self.id, self.group, self.threshold
        );
        self.advance_tlc(0)?;
        self.check_progress()
    }

    /// Entry point for every message the peering layer hands us.
    pub fn receive(&mut self, msg: Message) -> Result<(), ProtocolError> {
        // Acknowledgements are unsequenced and skip causal ordering.
        if msg.typ == MessageType::Ack {
            return self.receive_tlc(&msg);
        }

        self.causal.enqueue(msg)?;
        while let Some(delivered) = self.causal.deliver_next()? {
            self.merge_qsc(delivered.step, &delivered.qsc);
            self.receive_tlc(&delivered)?;
        }
        Ok(())
    }

    /// Stamps and broadcasts the current template with the live consensus
    /// window attached.
    pub(crate) fn broadcast_template(&mut self) -> Result<Message, ProtocolError> {
        let mut msg = self.tmpl.clone();
        msg.qsc = self.window.snapshot();
        let msg = self.causal.issue(msg)?;
        self.peers
            .multicast(self.id, self.group, &msg)
            .map_err(ProtocolError::Network)?;
        Ok(msg)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current logical time-step.
    pub fn step(&self) -> Step {
        self.tmpl.step
    }

    /// True once the node has reached its configured last step.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Outcomes of all completed consensus rounds, in round order.
    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// This node's own vector clock.
    pub fn vector_time(&self) -> &VectorClock {
        self.causal.vector_time()
    }

    /// References this node believes `peer` has seen recently.
    pub fn seen_by(&self, peer: NodeId) -> &HashSet<MessageRef> {
        self.causal.seen_by(peer)
    }

    /// The witnessed-proposal subset of [`Node::seen_by`].
    pub fn witnessed_by(&self, peer: NodeId) -> &HashSet<MessageRef> {
        self.causal.witnessed_by(peer)
    }

    /// What `peer` had seen at the boundary of `step`, if its proposal for
    /// that step arrived while we were there.
    pub fn step_view(&self, peer: NodeId, step: Step) -> Option<&StepView> {
        self.step_views[peer].get(&step)
    }
}
