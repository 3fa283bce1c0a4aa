//! Client-driven consensus over per-member stores.
//!
//! Where the live-messaging stack in [`crate::protocol`] needs every group
//! member to run node software, this core only needs each member to expose
//! a passive write-once-per-step register (the [`Store`] trait). Any
//! number of clients drive consensus by writing proposals to the registers
//! and reading back which writes won; the registers themselves never talk
//! to each other.
//!
//! A round is four register steps: a threshold broadcast spreading every
//! client's proposals, then a second one spreading the best proposal the
//! first turned up. The round's winner is the best proposal in the final
//! receive set; it is committed when its own member's register confirms it
//! spread widely enough and nothing in the opening receive set rivals it.

pub use crate::ondemand::castore::CasStore;
pub use crate::ondemand::client::{Client, ClientError};
pub use crate::ondemand::store::{MemStore, Store, StoreError};
pub use crate::ondemand::value::{Head, Proposal, Value, ValueSet};

pub(crate) mod castore;
pub(crate) mod client;
pub(crate) mod store;
pub(crate) mod value;
