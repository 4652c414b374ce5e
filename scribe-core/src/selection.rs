//! Cursor and selection ranges, re-mapped through operations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::OtError;
use crate::operation::{Op, Operation, MAX_UNITS};

/// A cursor (`anchor == head`) or a selected span.
///
/// `anchor` may be greater than `head` for a backwards selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Range {
    pub anchor: usize,
    pub head: usize,
}

impl Range {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn cursor(position: usize) -> Self {
        Self::new(position, position)
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }

    /// Position of this range in the document produced by `op`.
    pub fn transform(&self, op: &Operation) -> Range {
        Range {
            anchor: transform_index(self.anchor, op),
            head: transform_index(self.head, op),
        }
    }
}

/// Zero or more ranges belonging to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub ranges: Vec<Range>,
}

impl Selection {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn transform(&self, op: &Operation) -> Selection {
        Selection {
            ranges: self.ranges.iter().map(|r| r.transform(op)).collect(),
        }
    }

    /// Wire form: `{"ranges": [{"anchor": a, "head": h}, ...]}`.
    pub fn marshal(&self) -> Value {
        let ranges: Vec<Value> = self
            .ranges
            .iter()
            .map(|r| json!({ "anchor": r.anchor, "head": r.head }))
            .collect();
        json!({ "ranges": ranges })
    }

    /// Decode the wire form, rejecting missing or mistyped fields.
    pub fn unmarshal(value: &Value) -> Result<Selection, OtError> {
        let ranges = value
            .get("ranges")
            .and_then(Value::as_array)
            .ok_or_else(|| OtError::unmarshal("selection must carry a 'ranges' array"))?;

        let ranges = ranges
            .iter()
            .map(|range| {
                let anchor = offset(range, "anchor")?;
                let head = offset(range, "head")?;
                Ok(Range { anchor, head })
            })
            .collect::<Result<Vec<_>, OtError>>()?;

        Ok(Selection { ranges })
    }
}

fn offset(range: &Value, field: &str) -> Result<usize, OtError> {
    range
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n <= MAX_UNITS)
        .ok_or_else(|| {
            OtError::unmarshal(format!(
                "range needs an integer '{field}' between 0 and {MAX_UNITS}"
            ))
        })
}

/// Map a document offset through `op`.
///
/// Text inserted at or before the offset pushes it right. An offset inside a
/// deleted span collapses to the start of that span.
pub fn transform_index(mut i: usize, op: &Operation) -> usize {
    let encoding = op.encoding();
    let mut j = 0;
    for step in op.ops() {
        if j > i {
            break;
        }
        match step {
            Op::Retain(n) => j = j.saturating_add(*n),
            Op::Insert(s) => {
                let len = encoding.unit_len(s);
                i = i.saturating_add(len);
                j = j.saturating_add(len);
            }
            Op::Delete(n) => i = j.max(i.saturating_sub(*n)),
        }
    }
    i
}
