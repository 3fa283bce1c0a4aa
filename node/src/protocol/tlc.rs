//! The threshold logical clock: when and how a node's time-step advances.
//!
//! Each step a node broadcasts a proposal, collects acknowledgements until
//! the proposal is threshold witnessed, re-broadcasts it as witnessed, and
//! advances as soon as a threshold of distinct proposals has been
//! witnessed this step:
//!
//! ```text
//! Proposal --(acks >= T)--> Witness --(wits >= T)--> next step
//! ```
//!
//! Thresholds are also checked after self-acknowledgement and
//! self-witnessing, so a one-node group with threshold one clocks itself
//! without any network traffic.

use log::{debug, trace};

use crate::protocol::message::{Message, MessageRef, MessageType};
use crate::protocol::node::{Node, StepView};
use crate::protocol::{NodeId, ProtocolError, Step};

impl Node {
    /// Enters a new time-step: fresh proposal, fresh thresholds, pruned
    /// history, one more consensus round opened.
    pub(crate) fn advance_tlc(&mut self, step: Step) -> Result<(), ProtocolError> {
        if step >= self.max_steps {
            debug!("Node {} finished at time-step {}", self.id, self.max_steps);
            self.done = true;
            return Ok(());
        }
        trace!("Node {} advancing to time-step {step}", self.id);

        self.tmpl.step = step;
        self.tmpl.typ = MessageType::Proposal;
        self.acks.clear();
        self.wits.clear();

        let save = step.saturating_sub(3);
        self.causal.prune(save);
        for views in &mut self.step_views {
            views.retain(|recorded, _| *recorded >= save);
        }

        self.advance_qsc();

        let proposal = self.broadcast_template()?;
        self.tmpl.prop = proposal.seq;
        self.acks.insert(self.id);
        Ok(())
    }

    /// Runs every state transition the currently known thresholds allow.
    /// Iterative on purpose: with a threshold of one a single call drives
    /// the node through many steps.
    pub(crate) fn check_progress(&mut self) -> Result<(), ProtocolError> {
        loop {
            if self.done {
                return Ok(());
            }

            if self.tmpl.typ == MessageType::Proposal && self.acks.len() >= self.threshold {
                trace!(
                    "Node {} proposal {} is threshold witnessed at step {}",
                    self.id,
                    self.tmpl.prop,
                    self.tmpl.step
                );
                self.tmpl.typ = MessageType::Witness;
                self.witnessed_qsc();
                self.broadcast_template()?;

                let own = MessageRef {
                    from: self.id,
                    seq: self.tmpl.prop,
                    step: self.tmpl.step,
                };
                self.wits.insert(own);
                continue;
            }

            if self.wits.len() >= self.threshold {
                let next = self.tmpl.step + 1;
                self.advance_tlc(next)?;
                continue;
            }

            return Ok(());
        }
    }

    /// Dispatches a causally delivered message (or a raw acknowledgement)
    /// by type.
    pub(crate) fn receive_tlc(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        match msg.typ {
            MessageType::Proposal => {
                if msg.step == self.tmpl.step {
                    self.record_step_view(msg.from, msg.step);
                    let ack = Message::ack(self.id, msg.step, msg.seq);
                    self.peers.send(msg.from, ack).map_err(ProtocolError::Network)?;
                }
            }
            MessageType::Ack => {
                if msg.step == self.tmpl.step && msg.prop == self.tmpl.prop {
                    self.acks.insert(msg.from);
                    self.check_progress()?;
                }
            }
            MessageType::Witness => {
                let proposal = match self.causal.resolve(msg.from, msg.prop) {
                    Some(found) if found.typ == MessageType::Proposal => Some(found.reference()),
                    Some(_) => {
                        return Err(ProtocolError::InvalidWitness {
                            from: msg.from,
                            prop: msg.prop,
                        })
                    }
                    // The witnessed proposal fell out of the rolling
                    // window; too old to matter.
                    None => None,
                };
                if let Some(proposal) = proposal {
                    if msg.step == self.tmpl.step {
                        self.wits.insert(proposal);
                        self.check_progress()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Snapshots what the sender had seen and witnessed at its step
    /// boundary, keyed by sender and step.
    fn record_step_view(&mut self, peer: NodeId, step: Step) {
        let view = StepView {
            saw: self.causal.seen_by(peer).clone(),
            wit: self.causal.witnessed_by(peer).clone(),
        };
        self.step_views[peer].insert(step, view);
    }
}
