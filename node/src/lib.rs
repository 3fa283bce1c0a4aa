//! # Quesera Node
//!
//! Quesera implements asynchronous fail-stop consensus for a fixed group of
//! participants, built from threshold logical clocks. Nodes do not share a
//! wall clock and no node ever acts as a leader: logical time advances on
//! each node as soon as a threshold of peers has acknowledged and witnessed
//! its messages, and each three-step round of that clock doubles as one
//! attempt at consensus. A round commits when the globally best-ranked
//! proposal of the round turns out to be the one the group confirmed and
//! reconfirmed, which random proposal tickets make happen in an expected
//! constant number of rounds.
//!
//! Two interchangeable cores are provided:
//!
//! * [`protocol`] — the live-messaging stack. A causal-order broadcast
//!   layer keeps matrix clocks and reorders deliveries, the threshold
//!   logical clock layer drives time-step advancement, and the consensus
//!   layer rides on top deciding commit or no-commit per round. Peering is
//!   abstracted behind [`protocol::PeerNetwork`]; any reliable FIFO
//!   transport will do.
//! * [`ondemand`] — the client-driven variant. Group state lives in one
//!   write-once-per-step register per member (the [`ondemand::Store`]
//!   trait), and any number of clients drive rounds by writing to and
//!   reading from those registers. No member ever runs node software.
//!
//! The [`cas`] module supplies the compare-and-set abstraction the
//! on-demand core can be layered over, together with an in-memory register
//! and a history checker for torture-testing external register drivers.

pub use crate::config::Configuration;
pub use crate::protocol::{Decision, Message, Node, PeerNetwork};

pub mod consensus_api {
    pub use crate::ondemand::{Client, Head, MemStore, Store, Value};
    pub use crate::protocol::{Decision, Node, PeerNetwork};
}

pub mod cas;
pub mod config;
pub mod logging;
pub mod ondemand;
pub mod protocol;
pub mod utilities;
