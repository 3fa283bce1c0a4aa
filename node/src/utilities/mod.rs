pub use crate::utilities::backoff::{BackoffPolicy, Interrupted};
pub use crate::utilities::entropy::{BoundedEntropy, Entropy, OsEntropy, SeededEntropy};

pub mod backoff;
pub mod entropy;
