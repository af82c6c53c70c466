//! Binary codec for ordered key/value collections.
//!
//! # Wire format
//!
//! All integers are `u32` in host byte order:
//!
//! ```text
//! count
//! { key_len, value_len } × count
//! { key bytes, 0x00, value bytes, 0x00 } × count
//! ```
//!
//! Deleted pairs of a collection are skipped. Extra pairs are always
//! encoded before the collection's own pairs, and a `max` of 0 means no
//! cap. When the cap applies, the tail of the collection is dropped.

use std::mem::size_of;

use wasmbind_common::CodecError;

const FIELD: usize = size_of::<u32>();

/// A key/value pair of byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    deleted: bool,
}

impl Pair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            deleted: false,
        }
    }

    /// Mark the pair deleted; it stays in place but is never encoded.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn encoded_len(&self) -> usize {
        2 * FIELD + self.key.len() + 1 + self.value.len() + 1
    }
}

/// Pairs in encoding order: all extras, then the live pairs of `pairs`,
/// capped at `max` when non-zero.
fn selected<'a>(
    pairs: &'a [Pair],
    extras: &'a [Pair],
    max: usize,
) -> impl Iterator<Item = &'a Pair> + Clone {
    let cap = if max == 0 { usize::MAX } else { max };

    extras
        .iter()
        .chain(pairs.iter().filter(|pair| !pair.deleted))
        .take(cap)
}

/// Exact number of bytes [`marshal`] writes for the same arguments.
pub fn size(pairs: &[Pair], extras: &[Pair], max: usize) -> usize {
    selected(pairs, extras, max).fold(FIELD, |size, pair| size + pair.encoded_len())
}

/// Encode into `buf`.
///
/// Returns the capped pair count when `max` truncated the output, `None`
/// when every pair was written.
///
/// # Errors
///
/// - `BufferTooSmall` if `buf` is shorter than [`size`]
/// - `LengthOverflow` if a count or length does not fit in a `u32`
pub fn marshal(
    pairs: &[Pair],
    extras: &[Pair],
    buf: &mut [u8],
    max: usize,
) -> Result<Option<usize>, CodecError> {
    let needed = size(pairs, extras, max);
    if buf.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }

    let total = extras.len() + pairs.iter().filter(|pair| !pair.deleted).count();
    let chosen = selected(pairs, extras, max);
    let count = chosen.clone().count();

    let mut pos = put_len(buf, 0, count)?;

    for pair in chosen.clone() {
        pos = put_len(buf, pos, pair.key.len())?;
        pos = put_len(buf, pos, pair.value.len())?;
    }

    for pair in chosen {
        pos = put_bytes(buf, pos, &pair.key);
        pos = put_bytes(buf, pos, &pair.value);
    }

    debug_assert_eq!(pos, needed);

    Ok((count < total).then_some(count))
}

/// Encode into a freshly allocated buffer.
pub fn encode(
    pairs: &[Pair],
    extras: &[Pair],
    max: usize,
) -> Result<(Vec<u8>, Option<usize>), CodecError> {
    let mut buf = vec![0; size(pairs, extras, max)];
    let truncated = marshal(pairs, extras, &mut buf, max)?;
    Ok((buf, truncated))
}

fn put_len(buf: &mut [u8], pos: usize, len: usize) -> Result<usize, CodecError> {
    let field = u32::try_from(len).map_err(|_| CodecError::LengthOverflow { len })?;
    buf[pos..pos + FIELD].copy_from_slice(&field.to_ne_bytes());
    Ok(pos + FIELD)
}

fn put_bytes(buf: &mut [u8], pos: usize, bytes: &[u8]) -> usize {
    let end = pos + bytes.len();
    buf[pos..end].copy_from_slice(bytes);
    buf[end] = 0;
    end + 1
}

/// Decode a buffer produced by [`marshal`] (or by a guest).
///
/// An empty buffer decodes to no pairs. On any error nothing decoded so
/// far is returned.
///
/// # Errors
///
/// - `Truncated` if the buffer ends before the declared content
/// - `Allocation` if the pair storage cannot be reserved
pub fn unmarshal(buf: &[u8]) -> Result<Vec<Pair>, CodecError> {
    let mut reader = Reader { buf, pos: 0 };

    if buf.is_empty() {
        return Ok(Vec::new());
    }

    let count = reader.read_len()?;

    // The length table must be present before anything is allocated
    let table = count.checked_mul(2 * FIELD).ok_or(CodecError::Truncated {
        needed: usize::MAX,
        available: buf.len(),
    })?;
    reader.ensure(table)?;

    let mut lens = Vec::new();
    lens.try_reserve_exact(count)
        .map_err(|_| CodecError::Allocation { requested: count })?;
    for _ in 0..count {
        let key_len = reader.read_len()?;
        let value_len = reader.read_len()?;
        lens.push((key_len, value_len));
    }

    let mut pairs = Vec::new();
    pairs
        .try_reserve_exact(count)
        .map_err(|_| CodecError::Allocation { requested: count })?;

    for (key_len, value_len) in lens {
        let key = reader.read_terminated(key_len)?;
        let value = reader.read_terminated(value_len)?;
        pairs.push(Pair::new(key, value));
    }

    Ok(pairs)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        self.ensure(FIELD)?;

        let mut field = [0; FIELD];
        field.copy_from_slice(&self.buf[self.pos..self.pos + FIELD]);
        self.pos += FIELD;

        Ok(u32::from_ne_bytes(field) as usize)
    }

    /// `len` bytes followed by their terminator.
    fn read_terminated(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        let needed = len.checked_add(1).ok_or(CodecError::LengthOverflow { len })?;
        self.ensure(needed)?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| CodecError::Allocation { requested: len })?;
        bytes.extend_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += needed;

        Ok(bytes)
    }
}

/// A key/value collection plus the extra pairs encoded ahead of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairsMap {
    pub pairs: Vec<Pair>,
    pub extras: Vec<Pair>,
}

impl PairsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from decoded pairs.
    pub fn from_pairs(pairs: Vec<Pair>) -> Self {
        Self {
            pairs,
            extras: Vec::new(),
        }
    }

    /// Value of the first live pair with this key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|pair| !pair.deleted && pair.key == key)
            .map(|pair| pair.value.as_slice())
    }

    /// Append a pair.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pairs.push(Pair::new(key, value));
    }

    /// Delete every live pair with this key. Returns how many were deleted.
    pub fn remove(&mut self, key: &[u8]) -> usize {
        let mut removed = 0;
        for pair in self.pairs.iter_mut().filter(|p| !p.deleted && p.key == key) {
            pair.delete();
            removed += 1;
        }
        removed
    }

    /// Number of pairs that would be encoded without a cap.
    pub fn len(&self) -> usize {
        self.extras.len() + self.pairs.iter().filter(|pair| !pair.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See [`size`].
    pub fn encoded_size(&self, max: usize) -> usize {
        size(&self.pairs, &self.extras, max)
    }

    /// See [`marshal`].
    pub fn marshal(&self, buf: &mut [u8], max: usize) -> Result<Option<usize>, CodecError> {
        marshal(&self.pairs, &self.extras, buf, max)
    }
}
