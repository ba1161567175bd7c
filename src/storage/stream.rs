//! The stream value type: an append-only, ID-ordered log of field/value entries.
//!
//! There is no precedent for this in the reference server (it only ever implements string
//! `GET`/`SET`), so the shapes here are original, built directly against the invariants in
//! the data-model section of the spec and following the surrounding code's conventions
//! (plain structs, `thiserror` for the error enum, binary search over a `Vec` rather than a
//! tree — the entry count per stream is expected to be modest).

use std::fmt;

pub type Field = (Vec<u8>, Vec<u8>);

/// A stream entry ID: a lexicographically ordered pair of non-negative 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        StreamId { ms, seq }
    }

    /// Parse a fully-qualified `ms-seq` or bare `ms` id (the latter defaults `seq` to 0,
    /// used for partial XRANGE bounds).
    pub fn parse(text: &str) -> Result<StreamId, StreamError> {
        match text.split_once('-') {
            Some((ms, seq)) => Ok(StreamId {
                ms: ms
                    .parse()
                    .map_err(|_| StreamError::InvalidId(text.to_string()))?,
                seq: seq
                    .parse()
                    .map_err(|_| StreamError::InvalidId(text.to_string()))?,
            }),
            None => Ok(StreamId {
                ms: text
                    .parse()
                    .map_err(|_| StreamError::InvalidId(text.to_string()))?,
                seq: 0,
            }),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<Field>,
}

#[derive(Debug, Default, Clone)]
pub struct StreamData {
    entries: Vec<StreamEntry>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidId(String),
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    MustBeGreaterThanZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    NotMonotonic,
}

/// The three forms an XADD ID argument can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSpec {
    Explicit(StreamId),
    AutoSeq(u64),
    AutoBoth,
}

impl IdSpec {
    pub fn parse(text: &str) -> Result<IdSpec, StreamError> {
        if text == "*" {
            return Ok(IdSpec::AutoBoth);
        }
        match text.split_once('-') {
            Some((ms, "*")) => Ok(IdSpec::AutoSeq(
                ms.parse().map_err(|_| StreamError::InvalidId(text.to_string()))?,
            )),
            Some((ms, seq)) => Ok(IdSpec::Explicit(StreamId {
                ms: ms.parse().map_err(|_| StreamError::InvalidId(text.to_string()))?,
                seq: seq.parse().map_err(|_| StreamError::InvalidId(text.to_string()))?,
            })),
            None => Ok(IdSpec::Explicit(StreamId {
                ms: text.parse().map_err(|_| StreamError::InvalidId(text.to_string()))?,
                seq: 0,
            })),
        }
    }
}

/// Either well-known sentinel or a concrete ID, used for `XRANGE` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    NegativeInfinity,
    PositiveInfinity,
    Id(StreamId),
}

impl RangeBound {
    pub fn parse_start(text: &str) -> Result<RangeBound, StreamError> {
        match text {
            "-" => Ok(RangeBound::NegativeInfinity),
            "+" => Ok(RangeBound::PositiveInfinity),
            other => Ok(RangeBound::Id(StreamId::parse(other)?)),
        }
    }

    pub fn parse_end(text: &str) -> Result<RangeBound, StreamError> {
        match text {
            "-" => Ok(RangeBound::NegativeInfinity),
            "+" => Ok(RangeBound::PositiveInfinity),
            other => {
                // A bare `ms` on the upper bound means "every sequence number within that
                // millisecond", so it defaults to the maximum seq rather than 0.
                match other.split_once('-') {
                    Some(_) => Ok(RangeBound::Id(StreamId::parse(other)?)),
                    None => Ok(RangeBound::Id(StreamId {
                        ms: other
                            .parse()
                            .map_err(|_| StreamError::InvalidId(other.to_string()))?,
                        seq: u64::MAX,
                    })),
                }
            }
        }
    }
}

impl StreamData {
    pub fn top(&self) -> Option<StreamId> {
        self.entries.last().map(|e| e.id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve an XADD ID spec against the stream's current top, without mutating it.
    pub fn resolve_id(&self, spec: &IdSpec, now_ms: u64) -> Result<StreamId, StreamError> {
        let top = self.top();
        let candidate = match spec {
            IdSpec::Explicit(id) => *id,
            IdSpec::AutoSeq(ms) => StreamId::new(*ms, self.next_seq_for(*ms, top)),
            IdSpec::AutoBoth => StreamId::new(now_ms, self.next_seq_for(now_ms, top)),
        };

        match top {
            Some(top) if candidate <= top => Err(StreamError::NotMonotonic),
            None if candidate <= StreamId::ZERO => Err(StreamError::MustBeGreaterThanZero),
            _ => Ok(candidate),
        }
    }

    fn next_seq_for(&self, ms: u64, top: Option<StreamId>) -> u64 {
        match top {
            Some(top) if top.ms == ms => top.seq + 1,
            Some(_) => 0,
            None => {
                if ms == 0 {
                    1
                } else {
                    0
                }
            }
        }
    }

    /// Append a pre-resolved ID. Caller is responsible for having resolved/validated it via
    /// `resolve_id` against the same snapshot (no other mutation may happen in between,
    /// which holds here since the whole store sits behind one mutex).
    pub fn append(&mut self, id: StreamId, fields: Vec<Field>) {
        self.entries.push(StreamEntry { id, fields });
    }

    fn bound_to_id(bound: RangeBound, negative_infinity: StreamId, positive_infinity: StreamId) -> StreamId {
        match bound {
            RangeBound::NegativeInfinity => negative_infinity,
            RangeBound::PositiveInfinity => positive_infinity,
            RangeBound::Id(id) => id,
        }
    }

    /// Inclusive range query, both bounds resolved via binary search over the sorted
    /// (by construction) entry vector.
    pub fn range(&self, start: RangeBound, end: RangeBound) -> Vec<StreamEntry> {
        let lo = Self::bound_to_id(start, StreamId::ZERO, StreamId::new(u64::MAX, u64::MAX));
        let hi = Self::bound_to_id(end, StreamId::ZERO, StreamId::new(u64::MAX, u64::MAX));
        if lo > hi {
            return Vec::new();
        }
        let lower = self.entries.partition_point(|e| e.id < lo);
        let upper = self.entries.partition_point(|e| e.id <= hi);
        self.entries[lower..upper].to_vec()
    }

    /// Entries with ID strictly greater than `start`.
    pub fn after(&self, start: StreamId) -> Vec<StreamEntry> {
        let idx = self.entries.partition_point(|e| e.id <= start);
        self.entries[idx..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(ms: u64, seq: u64) -> StreamId {
        StreamId::new(ms, seq)
    }

    #[test]
    fn auto_sequence_increments_within_same_ms() {
        let mut stream = StreamData::default();
        let first = stream.resolve_id(&IdSpec::AutoSeq(5), 0).unwrap();
        assert_eq!(first, id(5, 1));
        stream.append(first, vec![]);
        let second = stream.resolve_id(&IdSpec::AutoSeq(5), 0).unwrap();
        assert_eq!(second, id(5, 2));
    }

    #[test]
    fn auto_sequence_resets_to_zero_for_later_ms() {
        let mut stream = StreamData::default();
        stream.append(id(5, 1), vec![]);
        let next = stream.resolve_id(&IdSpec::AutoSeq(6), 0).unwrap();
        assert_eq!(next, id(6, 0));
    }

    #[test]
    fn explicit_id_must_be_strictly_increasing() {
        let mut stream = StreamData::default();
        stream.append(id(5, 0), vec![]);
        assert_eq!(
            stream.resolve_id(&IdSpec::Explicit(id(4, 0)), 0),
            Err(StreamError::NotMonotonic)
        );
        assert_eq!(
            stream.resolve_id(&IdSpec::Explicit(id(5, 0)), 0),
            Err(StreamError::NotMonotonic)
        );
    }

    #[test]
    fn empty_stream_rejects_0_0() {
        let stream = StreamData::default();
        assert_eq!(
            stream.resolve_id(&IdSpec::Explicit(StreamId::ZERO), 0),
            Err(StreamError::MustBeGreaterThanZero)
        );
        assert!(stream.resolve_id(&IdSpec::Explicit(id(0, 1)), 0).is_ok());
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let mut stream = StreamData::default();
        for (ms, seq) in [(1, 0), (2, 0), (3, 0)] {
            stream.append(id(ms, seq), vec![]);
        }
        let result = stream.range(RangeBound::Id(id(1, 0)), RangeBound::Id(id(2, 0)));
        let ids: Vec<_> = result.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![id(1, 0), id(2, 0)]);
    }

    #[test]
    fn range_with_start_after_end_is_empty() {
        let mut stream = StreamData::default();
        stream.append(id(1, 0), vec![]);
        assert!(stream.range(RangeBound::Id(id(5, 0)), RangeBound::Id(id(1, 0))).is_empty());
    }

    #[test]
    fn after_is_strictly_exclusive_of_start() {
        let mut stream = StreamData::default();
        for (ms, seq) in [(1, 0), (2, 0), (3, 0)] {
            stream.append(id(ms, seq), vec![]);
        }
        let ids: Vec<_> = stream.after(id(1, 0)).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![id(2, 0), id(3, 0)]);
    }
}
