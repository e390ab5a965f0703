//! User key ranges addressed by a batch read.

use bytes::Bytes;

/// One half-open key interval `[start, end)`. An empty `end` means "to the
/// end of the keyspace".
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyRange {
    pub start: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// An ordered set of disjoint key ranges.
///
/// The dispatcher treats the set as opaque: splitting against region
/// boundaries is the region cache's job, and re-unioning for a whole-batch
/// retry is a flat concatenation of the per-region pieces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRanges {
    ranges: Vec<KeyRange>,
}

impl KeyRanges {
    pub fn new(ranges: Vec<KeyRange>) -> Self {
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[KeyRange] {
        &self.ranges
    }

    pub fn into_vec(self) -> Vec<KeyRange> {
        self.ranges
    }

    /// Append every range into `out`, used when unioning a batch's regions
    /// back into one build input.
    pub fn collect_into(&self, out: &mut Vec<KeyRange>) {
        out.extend(self.ranges.iter().cloned());
    }
}

impl From<Vec<KeyRange>> for KeyRanges {
    fn from(ranges: Vec<KeyRange>) -> Self {
        Self::new(ranges)
    }
}
