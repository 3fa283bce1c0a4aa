//! Causal-order bookkeeping for broadcast messages.
//!
//! Keeps the matrix clock, the append-only per-peer logs, the out-of-order
//! arrival buffers and the rolling record of which peer has seen which
//! message. Delivery hands messages upward strictly in causal order;
//! acknowledgements never pass through here.

use std::collections::{HashSet, VecDeque};

use crate::protocol::clock::{MatrixClock, VectorClock};
use crate::protocol::message::{Message, MessageRef, MessageType};
use crate::protocol::{NodeId, ProtocolError, Seq, Step};

/// Log of one peer's broadcast messages in sequence order. Entries below
/// the expiry step are pruned away, but the sequence arithmetic keeps
/// counting them.
#[derive(Debug, Default)]
pub(crate) struct PeerLog {
    start: Seq,
    entries: VecDeque<Message>,
}

impl PeerLog {
    /// Sequence number the next logged message must carry.
    fn next_seq(&self) -> Seq {
        self.start + self.entries.len() as u64
    }

    fn get(&self, seq: Seq) -> Option<&Message> {
        seq.checked_sub(self.start)
            .and_then(|offset| self.entries.get(offset as usize))
    }

    fn push(&mut self, msg: Message) {
        debug_assert_eq!(msg.seq, self.next_seq());
        self.entries.push_back(msg);
    }

    fn prune(&mut self, save: Step) {
        while matches!(self.entries.front(), Some(msg) if msg.step < save) {
            self.entries.pop_front();
            self.start += 1;
        }
    }
}

#[derive(Debug)]
pub(crate) struct CausalOrder {
    id: NodeId,
    group: usize,
    /// Earliest unexpired step; everything below has been pruned.
    save: Step,
    mat: MatrixClock,
    logs: Vec<PeerLog>,
    /// Buffered arrivals per peer, indexed by distance from the next
    /// deliverable sequence number, with holes.
    oom: Vec<VecDeque<Option<Message>>>,
    /// Per peer, references this node believes the peer has seen recently.
    saw: Vec<HashSet<MessageRef>>,
    /// The subset of `saw` that are witnessed proposals.
    wit: Vec<HashSet<MessageRef>>,
}

impl CausalOrder {
    pub(crate) fn new(id: NodeId, group: usize) -> CausalOrder {
        CausalOrder {
            id,
            group,
            save: 0,
            mat: MatrixClock::new(group),
            logs: (0..group).map(|_| PeerLog::default()).collect(),
            oom: vec![VecDeque::new(); group],
            saw: vec![HashSet::new(); group],
            wit: vec![HashSet::new(); group],
        }
    }

    /// Stamps an outbound broadcast with its sequence number and vector
    /// clock and logs it locally. The caller sends the returned copy.
    pub(crate) fn issue(&mut self, mut msg: Message) -> Result<Message, ProtocolError> {
        debug_assert_eq!(msg.from, self.id);
        msg.seq = self.logs[self.id].next_seq();
        msg.vec = self.mat.row(self.id).clone();
        self.log_causal(msg.clone())?;
        Ok(msg)
    }

    /// Buffers an inbound broadcast message for causal delivery.
    pub(crate) fn enqueue(&mut self, msg: Message) -> Result<(), ProtocolError> {
        debug_assert_ne!(msg.typ, MessageType::Ack);
        let from = msg.from;
        if from >= self.group {
            return Err(ProtocolError::UnknownPeer { peer: from });
        }

        // A sequence number below the delivered count means the peering
        // layer replayed a message; that breaks its FIFO contract.
        let delivered = self.mat.row(self.id).get(from);
        if msg.seq < delivered {
            return Err(ProtocolError::DuplicateMessage { from, seq: msg.seq });
        }

        let index = (msg.seq - delivered) as usize;
        let buffer = &mut self.oom[from];
        while buffer.len() <= index {
            buffer.push_back(None);
        }
        if buffer[index].is_some() {
            return Err(ProtocolError::DuplicateMessage { from, seq: msg.seq });
        }
        buffer[index] = Some(msg);
        Ok(())
    }

    /// Delivers one buffered message whose causal dependencies are all
    /// satisfied, or reports that none is ready.
    pub(crate) fn deliver_next(&mut self) -> Result<Option<Message>, ProtocolError> {
        for peer in 0..self.group {
            let ready = matches!(
                self.oom[peer].front(),
                Some(Some(msg)) if msg.vec.le(self.mat.row(self.id))
            );
            if ready {
                let msg = self.oom[peer]
                    .pop_front()
                    .expect("front was checked")
                    .expect("front was checked");
                self.log_causal(msg.clone())?;
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Logs a message and accounts for everything its vector clock proves
    /// the sender must have seen before issuing it.
    fn log_causal(&mut self, msg: Message) -> Result<(), ProtocolError> {
        let sender = msg.from;
        for origin in 0..self.group {
            while self.mat.row(sender).get(origin) < msg.vec.get(origin) {
                let seq = self.mat.row(sender).get(origin);
                self.saw_logged(sender, origin, seq)?;
                self.mat.row_mut(sender).set(origin, seq + 1);
            }
        }

        self.saw_message(sender, &msg)?;
        self.saw_message(self.id, &msg)?;

        self.logs[sender].push(msg);
        let count = self.logs[sender].next_seq();
        self.mat.row_mut(self.id).set(sender, count);
        Ok(())
    }

    fn saw_logged(&mut self, peer: NodeId, origin: NodeId, seq: Seq) -> Result<(), ProtocolError> {
        match self.logs[origin]
            .get(seq)
            .map(|msg| (msg.reference(), msg.typ, msg.prop))
        {
            Some((mref, typ, prop)) => self.record_seen(peer, mref, typ, prop),
            // Already pruned; the reference would expire immediately anyway.
            None => Ok(()),
        }
    }

    fn saw_message(&mut self, peer: NodeId, msg: &Message) -> Result<(), ProtocolError> {
        self.record_seen(peer, msg.reference(), msg.typ, msg.prop)
    }

    /// Records that `peer` has seen the referenced message; witnessed
    /// messages additionally record the proposal they endorse.
    fn record_seen(
        &mut self,
        peer: NodeId,
        mref: MessageRef,
        typ: MessageType,
        prop: Seq,
    ) -> Result<(), ProtocolError> {
        if mref.step >= self.save {
            self.saw[peer].insert(mref);
        }
        if typ == MessageType::Witness {
            match self.logs[mref.from].get(prop) {
                Some(proposal) if proposal.typ == MessageType::Proposal => {
                    let pref = proposal.reference();
                    if pref.step >= self.save {
                        self.wit[peer].insert(pref);
                    }
                }
                Some(_) => {
                    return Err(ProtocolError::InvalidWitness {
                        from: mref.from,
                        prop,
                    })
                }
                None => {
                    if prop >= self.logs[mref.from].next_seq() {
                        return Err(ProtocolError::InvalidWitness {
                            from: mref.from,
                            prop,
                        });
                    }
                    // The witnessed proposal was pruned; stale, drop it.
                }
            }
        }
        Ok(())
    }

    /// Advances the expiry step and drops everything below it.
    pub(crate) fn prune(&mut self, save: Step) {
        self.save = save;
        for log in &mut self.logs {
            log.prune(save);
        }
        for seen in &mut self.saw {
            seen.retain(|mref| mref.step >= save);
        }
        for witnessed in &mut self.wit {
            witnessed.retain(|mref| mref.step >= save);
        }
    }

    /// Looks a logged message up by its content identity.
    pub(crate) fn resolve(&self, from: NodeId, seq: Seq) -> Option<&Message> {
        self.logs[from].get(seq)
    }

    pub(crate) fn vector_time(&self) -> &VectorClock {
        self.mat.row(self.id)
    }

    pub(crate) fn delivered_count(&self, peer: NodeId) -> u64 {
        self.mat.row(self.id).get(peer)
    }

    pub(crate) fn seen_by(&self, peer: NodeId) -> &HashSet<MessageRef> {
        &self.saw[peer]
    }

    pub(crate) fn witnessed_by(&self, peer: NodeId) -> &HashSet<MessageRef> {
        &self.wit[peer]
    }
}
