//! Error taxonomy for the codec, term, and data-access layers.
//!
//! Every fallible operation in this crate returns one of these kinds by
//! value; nothing is logged, retried, or swallowed internally (the
//! `tracing` spans emitted alongside are instrumentation, not recovery).

use thiserror::Error;

/// The distinct failure kinds callers must distinguish, per the
/// `InvalidArgument` / `InvalidTNetstring` / `UnsupportedTopLevelDataStructure`
/// / `InvalidChild` / `KeyNotFound` / `OutOfMemory` taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A null/empty out-param, missing key, or a term of the wrong type
    /// was passed where the operation requires something else.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The bytes do not parse as a well-formed tnetstring term: a bad or
    /// overlong length prefix, a missing colon, a payload that runs past
    /// the enclosing slice, or an invalid type tag.
    #[error("invalid tnetstring at byte {offset}: {reason}")]
    InvalidTNetstring {
        /// Byte offset, relative to the slice being parsed, where the
        /// malformed encoding was detected.
        offset: usize,
        reason: &'static str,
    },

    /// `create` was called on a tnetstring whose top-level term is not a
    /// dictionary.
    #[error("unsupported top-level data structure: expected `}}`, found `{found}`")]
    UnsupportedTopLevelDataStructure {
        /// The type tag byte that was actually found.
        found: u8,
    },

    /// The node's path to its root has been broken: an ancestor was
    /// overwritten, the node was orphaned by a sibling mutation, or it
    /// has otherwise fallen out of its parent's children list.
    #[error("child node is no longer attached to its root")]
    InvalidChild,

    /// A `get`/`remove` lookup did not find the requested key.
    #[error("key not found")]
    KeyNotFound,

    /// A fallible allocation (growing the root buffer) failed. The
    /// structure is left exactly as it was before the call.
    #[error("out of memory")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, Error>;
