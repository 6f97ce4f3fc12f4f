//! Lazy, in-place, mutable access to a tagged-netstring (tnetstring)
//! dictionary held as a single contiguous byte buffer.
//!
//! A [`DataAccess`] is a handle onto one dictionary node within a tree of
//! nested dictionaries sharing one owned buffer. `get` returns a
//! zero-copy [`Term`] view; `set`/`remove` mutate the buffer in place,
//! shifting bytes and rewriting length prefixes only where the edit
//! actually requires it. See `tree` for the mutation engine and `term`
//! for the tnetstring parsing/construction primitives.

mod codec;
mod error;
mod term;
mod tree;

pub use codec::{is_valid_type, Tag, MAX_PREFIX_DIGITS};
pub use error::{Error, Result};
pub use term::{Term, DEFAULT_FLOAT_PRECISION};
pub use tree::{DataAccess, MIN_ROOT_LEN};

use std::sync::Once;

/// Installs a default `tracing_subscriber` once, for binaries and tests
/// that want diagnostic output without wiring up their own subscriber.
/// Library consumers who install their own subscriber are unaffected;
/// this only ever runs once per process regardless of how many times
/// it's called.
pub fn ensure_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}
