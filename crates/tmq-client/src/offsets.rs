//! Topic-partition-offset model and its wire conversions
//!
//! A partition is one vgroup of a topic. Lookups for assignment, commit and
//! position compare partitions by `(topic, vgroup)` only; the offset rides
//! along.

use crate::error::{Error, Result};
use crate::protocol::{OffsetReq, TopicVgroupId, WireAssignment};
use serde::Serialize;
use std::fmt;

/// A signed 64-bit offset with a sentinel for "unset"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Offset(pub i64);

impl Offset {
    /// Sentinel the server uses for an unset or invalid offset
    pub const INVALID: Offset = Offset(-2147467247);

    pub fn is_valid(&self) -> bool {
        *self != Offset::INVALID
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Default for Offset {
    fn default() -> Self {
        Offset::INVALID
    }
}

impl From<i64> for Offset {
    fn from(v: i64) -> Self {
        Offset(v)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("INVALID")
        }
    }
}

/// One vgroup of one topic, optionally with an offset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: Offset::INVALID,
        }
    }

    pub fn with_offset(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = offset.into();
        self
    }

    /// Equality by `(topic, partition)`, ignoring the offset
    pub fn same_partition(&self, other: &TopicPartition) -> bool {
        self.partition == other.partition && self.topic == other.topic
    }

    pub(crate) fn to_wire(&self) -> TopicVgroupId {
        TopicVgroupId {
            topic: self.topic.clone(),
            vgroup_id: self.partition,
        }
    }

    pub(crate) fn offset_request(&self, req_id: u64) -> OffsetReq {
        OffsetReq {
            req_id,
            topic: self.topic.clone(),
            vgroup_id: self.partition,
            offset: self.offset.0,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A partition assignment with its readable offset range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub partition: TopicPartition,
    pub begin: i64,
    pub end: i64,
}

impl Assignment {
    pub(crate) fn from_wire(topic: &str, wire: &WireAssignment) -> Self {
        Self {
            partition: TopicPartition::new(topic, wire.vgroup_id).with_offset(wire.offset),
            begin: wire.begin,
            end: wire.end,
        }
    }
}

/// Convert caller partitions into the wire `{topic, vgroup_id}` list
pub(crate) fn to_wire_ids(partitions: &[TopicPartition]) -> Vec<TopicVgroupId> {
    partitions.iter().map(TopicPartition::to_wire).collect()
}

/// Pair each input partition with the offset at the same index
///
/// The server answers committed/position queries positionally; a length
/// mismatch means the response does not describe the request.
pub fn reassemble(partitions: &[TopicPartition], offsets: &[i64]) -> Result<Vec<TopicPartition>> {
    if partitions.len() != offsets.len() {
        return Err(Error::decode(format!(
            "requested {} partitions but the server returned {} offsets",
            partitions.len(),
            offsets.len()
        )));
    }
    Ok(partitions
        .iter()
        .zip(offsets)
        .map(|(tp, offset)| TopicPartition::new(tp.topic.clone(), tp.partition).with_offset(*offset))
        .collect())
}
