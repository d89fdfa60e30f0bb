//! Per-collective algorithm enumerations, per spec §6.
//!
//! Every collective accepts at least an `automatic` algorithm selection;
//! anything unrecognized fails explicitly rather than silently falling
//! back to a default. Allreduce is the one collective with a second,
//! named algorithm (`host-transfer`). Since this whole engine *is* the
//! host-transfer backend, both values route through the same
//! implementation.

use hostxfer_core::error::{EngineError, Result};

/// Algorithm selection for `Allreduce`. `Automatic` and `HostTransfer`
/// both select this engine's implementation; there is no other
/// algorithm for this backend to dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllreduceAlgorithm {
    /// Let the backend choose (resolves to `HostTransfer` here).
    Automatic,
    /// Explicitly request the host-transfer implementation.
    HostTransfer,
}

impl AllreduceAlgorithm {
    /// Parse a user-supplied algorithm name, failing explicitly on
    /// anything unrecognized (spec §6).
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "automatic" => Ok(Self::Automatic),
            "host-transfer" => Ok(Self::HostTransfer),
            other => Err(EngineError::unknown_algorithm("Allreduce", other)),
        }
    }
}

impl Default for AllreduceAlgorithm {
    fn default() -> Self {
        Self::Automatic
    }
}

/// Algorithm selection for every other collective: this backend only
/// ever implements `automatic`, since none of the remaining collectives
/// expose a second named algorithm in the host-transfer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// The only selection this backend recognizes.
    #[default]
    Automatic,
}

impl Algorithm {
    /// Parse a user-supplied algorithm name for `collective`, failing
    /// explicitly on anything unrecognized.
    pub fn parse(collective: &'static str, name: &str) -> Result<Self> {
        match name {
            "automatic" => Ok(Self::Automatic),
            other => Err(EngineError::unknown_algorithm(collective, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allreduce_accepts_automatic_and_host_transfer() {
        assert_eq!(AllreduceAlgorithm::parse("automatic").unwrap(), AllreduceAlgorithm::Automatic);
        assert_eq!(AllreduceAlgorithm::parse("host-transfer").unwrap(), AllreduceAlgorithm::HostTransfer);
    }

    #[test]
    fn allreduce_rejects_unknown_algorithm() {
        assert!(AllreduceAlgorithm::parse("ring").is_err());
    }

    #[test]
    fn generic_algorithm_only_accepts_automatic() {
        assert_eq!(Algorithm::parse("Bcast", "automatic").unwrap(), Algorithm::Automatic);
        assert!(Algorithm::parse("Bcast", "binary-tree").is_err());
    }
}
