//! A typed view over a slice of bytes that is a single tnetstring
//! encoding: `<len>:<payload><type>`. A [`Term`] is either *owning* (built
//! by [`Term::create`], heap-allocated) or *nested* (borrows a slice, or
//! borrows through a live read-guard on a [`crate::tree::Tree`] so that
//! `get`/`as_term` stay zero-copy even though the underlying buffer is
//! behind a `RefCell`).

use std::cell::Ref;
use std::fmt;

use crate::codec::{self, Tag, MAX_PREFIX_DIGITS};
use crate::error::Error;
use crate::tree::Tree;

/// Decimal places used when formatting a float payload. The reader
/// accepts any precision; only the writer is pinned to this value
/// (matches the original `FLOAT_DECIMAL_PRECISION`).
pub const DEFAULT_FLOAT_PRECISION: usize = 3;

enum Payload<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
    Tracked { guard: Ref<'a, Tree>, start: usize, end: usize },
}

/// One tnetstring-encoded value, viewed as a byte slice plus parsed
/// offsets. See the module docs for the owning-vs-nested distinction.
pub struct Term<'a> {
    payload: Payload<'a>,
    tag: Tag,
    payload_off: usize,
    payload_len: usize,
}

impl<'a> Term<'a> {
    /// Builds an owning term: `"<len>:" + payload + type`.
    pub fn create(payload: &[u8], tag: Tag) -> Result<Term<'static>, Error> {
        let prefix_len = codec::digit_count(payload.len());
        if prefix_len > MAX_PREFIX_DIGITS {
            return Err(Error::InvalidArgument(
                "payload length exceeds the maximum prefix width",
            ));
        }
        let total_len = prefix_len + 1 + payload.len() + 1;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total_len)
            .map_err(|_| Error::OutOfMemory)?;
        bytes.extend_from_slice(payload.len().to_string().as_bytes());
        bytes.push(b':');
        bytes.extend_from_slice(payload);
        bytes.push(tag.as_byte());
        Ok(Term {
            payload: Payload::Owned(bytes),
            tag,
            payload_off: prefix_len + 1,
            payload_len: payload.len(),
        })
    }

    /// Parses exactly one term starting at the beginning of `bytes`. The
    /// term's tail (including its type byte) must not exceed `bytes`; any
    /// bytes after the parsed term are simply not part of the returned
    /// view. Fails on a malformed prefix, a missing colon, an overrun, or
    /// an invalid type tag.
    pub fn create_nested(bytes: &'a [u8]) -> Result<Term<'a>, Error> {
        let (payload_len, colon_index) = codec::parse_prefix(bytes)?;
        let payload_off = colon_index + 1;
        let tag_index = payload_off + payload_len;
        let tag_byte = *bytes.get(tag_index).ok_or(Error::InvalidTNetstring {
            offset: tag_index,
            reason: "missing type tag byte",
        })?;
        let tag = Tag::from_byte(tag_byte).ok_or(Error::InvalidTNetstring {
            offset: tag_index,
            reason: "invalid type tag byte",
        })?;
        let total_len = tag_index + 1;
        Ok(Term {
            payload: Payload::Borrowed(&bytes[..total_len]),
            tag,
            payload_off,
            payload_len,
        })
    }

    pub(crate) fn from_tracked(guard: Ref<'a, Tree>, start: usize, end: usize, tag: Tag, payload_off: usize, payload_len: usize) -> Term<'a> {
        Term {
            payload: Payload::Tracked { guard, start, end },
            tag,
            payload_off,
            payload_len,
        }
    }

    /// The address of the `Tree` this term is borrowed through, if any.
    /// Used by [`crate::tree::DataAccess::create_nested`] to check that a
    /// term handed back to it actually came from the same tree.
    pub(crate) fn tree_ptr(&self) -> Option<*const Tree> {
        match &self.payload {
            Payload::Tracked { guard, .. } => Some(&**guard as *const Tree),
            _ => None,
        }
    }

    /// The absolute `[start, end)` byte range within the tree's buffer
    /// this term occupies, if it is a tracked (tree-borrowed) term.
    pub(crate) fn tracked_range(&self) -> Option<(usize, usize)> {
        match &self.payload {
            Payload::Tracked { start, end, .. } => Some((*start, *end)),
            _ => None,
        }
    }

    /// Convenience constructor for a boolean term (`true`/`false` ASCII
    /// literal payloads, per the wire format).
    pub fn boolean(value: bool) -> Term<'static> {
        Term::create(if value { b"true" } else { b"false" }, Tag::Boolean)
            .expect("boolean payload never exceeds the prefix width limit")
    }

    /// Convenience constructor for the null term (`0:~`, empty payload).
    pub fn null() -> Term<'static> {
        Term::create(b"", Tag::Null).expect("empty payload never exceeds the prefix width limit")
    }

    /// Convenience constructor for a string term.
    pub fn string(value: &[u8]) -> Result<Term<'static>, Error> {
        Term::create(value, Tag::String)
    }

    /// Convenience constructor for an integer term (ASCII decimal,
    /// optional leading `-`).
    pub fn integer(value: i64) -> Term<'static> {
        Term::create(value.to_string().as_bytes(), Tag::Integer)
            .expect("formatted i64 never exceeds the prefix width limit")
    }

    /// Convenience constructor for a float term, formatted to
    /// [`DEFAULT_FLOAT_PRECISION`] decimal places (the reader accepts any
    /// precision; only the writer is pinned).
    pub fn float(value: f64) -> Term<'static> {
        let formatted = format!("{:.*}", DEFAULT_FLOAT_PRECISION, value);
        Term::create(formatted.as_bytes(), Tag::Float)
            .expect("formatted f64 never exceeds the prefix width limit")
    }

    /// The full encoded tnetstring bytes for this term, including its
    /// length prefix, colon, payload and type tag.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Owned(v) => v.as_slice(),
            Payload::Borrowed(s) => s,
            Payload::Tracked { guard, start, end } => &guard.buffer[*start..*end],
        }
    }

    /// Just the payload bytes (between the colon and the type tag).
    pub fn payload(&self) -> &[u8] {
        &self.as_bytes()[self.payload_off..self.payload_off + self.payload_len]
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Total encoded length, i.e. `as_bytes().len()`.
    pub fn total_len(&self) -> usize {
        self.payload_off + self.payload_len + 1
    }

    /// Copies this term's bytes into a freshly owned, `'static` term.
    /// Used to snapshot a term that aliases a tree's buffer before that
    /// tree is mutated out from under it.
    pub fn to_owned_term(&self) -> Term<'static> {
        Term {
            payload: Payload::Owned(self.as_bytes().to_vec()),
            tag: self.tag,
            payload_off: self.payload_off,
            payload_len: self.payload_len,
        }
    }
}

impl fmt::Debug for Term<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Term")
            .field("tag", &self.tag)
            .field("payload", &String::from_utf8_lossy(self.payload()))
            .finish()
    }
}
