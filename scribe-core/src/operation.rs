//! Text operations: sequences of retain/delete/insert steps over a document.
//!
//! An [`Operation`] is built incrementally and kept in canonical form at all
//! times:
//!
//! ```text
//! retain(1).retain(2)          → [Retain(3)]
//! insert("a").insert("b")      → [Insert("ab")]
//! delete(1).insert("x")        → [Insert("x"), Delete(1)]
//! ```
//!
//! On the wire an operation is a flat JSON array: positive integers retain,
//! negative integers delete, strings insert.

use std::fmt;

use serde_json::Value;

use crate::encoding::TextEncoding;
use crate::error::OtError;
use crate::selection::Selection;

/// Largest document length, count or offset accepted from the wire.
pub const MAX_UNITS: usize = u32::MAX as usize;

/// A single primitive step of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Copy the next `n` units of the base document unchanged.
    Retain(usize),
    /// Drop the next `n` units of the base document.
    Delete(usize),
    /// Emit text that is not present in the base document.
    Insert(String),
}

impl Op {
    pub fn is_retain(&self) -> bool {
        matches!(self, Op::Retain(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete(_))
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Op::Insert(_))
    }
}

/// An ordered list of [`Op`]s together with the document lengths it maps
/// between.
///
/// `base_len` is the length a document must have for the operation to apply,
/// `target_len` the length of the result. Both are only ever changed by the
/// builder methods, so they always agree with the op list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Operation {
    ops: Vec<Op>,
    base_len: usize,
    target_len: usize,
    encoding: TextEncoding,
    meta: Option<Selection>,
}

impl Operation {
    /// Empty operation measuring text in code points.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty operation measuring text in the given units.
    pub fn with_encoding(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            ..Self::default()
        }
    }

    /// Skip `n` units. Merges with a trailing retain.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        match self.ops.last_mut() {
            Some(Op::Retain(last)) => *last += n,
            _ => self.ops.push(Op::Retain(n)),
        }
        self
    }

    /// Delete `n` units. Merges with a trailing delete.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        match self.ops.last_mut() {
            Some(Op::Delete(last)) => *last += n,
            _ => self.ops.push(Op::Delete(n)),
        }
        self
    }

    /// Insert `s`. An insert that follows a delete is moved in front of it.
    pub fn insert(&mut self, s: &str) -> &mut Self {
        if s.is_empty() {
            return self;
        }
        self.target_len += self.encoding.unit_len(s);

        if let Some(Op::Insert(last)) = self.ops.last_mut() {
            last.push_str(s);
            return self;
        }

        let len = self.ops.len();
        if matches!(self.ops.last(), Some(Op::Delete(_))) {
            // Canonical order is insert-before-delete.
            if len >= 2 {
                if let Op::Insert(prev) = &mut self.ops[len - 2] {
                    prev.push_str(s);
                    return self;
                }
            }
            self.ops.insert(len - 1, Op::Insert(s.to_owned()));
        } else {
            self.ops.push(Op::Insert(s.to_owned()));
        }
        self
    }

    /// Attach a selection that travels with the operation.
    pub fn with_meta(mut self, selection: Selection) -> Self {
        self.meta = Some(selection);
        self
    }

    pub fn set_meta(&mut self, meta: Option<Selection>) {
        self.meta = meta;
    }

    pub fn meta(&self) -> Option<&Selection> {
        self.meta.as_ref()
    }

    pub fn take_meta(&mut self) -> Option<Selection> {
        self.meta.take()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn base_len(&self) -> usize {
        self.base_len
    }

    pub fn target_len(&self) -> usize {
        self.target_len
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// True if applying the operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        match self.ops.as_slice() {
            [] | [Op::Retain(_)] => true,
            _ => false,
        }
    }

    /// Apply the operation to `document`, returning the new text.
    pub fn apply(&self, document: &str) -> Result<String, OtError> {
        match self.encoding {
            TextEncoding::Utf8 => {
                let units: Vec<char> = document.chars().collect();
                let out = self.apply_units(&units, |s, out| out.extend(s.chars()))?;
                Ok(out.into_iter().collect())
            }
            TextEncoding::Utf16 => {
                let units: Vec<u16> = document.encode_utf16().collect();
                let out = self.apply_units(&units, |s, out| out.extend(s.encode_utf16()))?;
                Ok(String::from_utf16_lossy(&out))
            }
        }
    }

    fn apply_units<U: Copy>(
        &self,
        units: &[U],
        insert: impl Fn(&str, &mut Vec<U>),
    ) -> Result<Vec<U>, OtError> {
        if units.len() != self.base_len {
            return Err(OtError::BaseLengthMismatch {
                expected: self.base_len,
                actual: units.len(),
            });
        }

        let mut out = Vec::with_capacity(self.target_len);
        let mut i = 0;
        for op in &self.ops {
            match op {
                Op::Retain(n) => {
                    let span = units.get(i..i + n).ok_or(OtError::BaseLengthMismatch {
                        expected: self.base_len,
                        actual: units.len(),
                    })?;
                    out.extend_from_slice(span);
                    i += n;
                }
                Op::Insert(s) => insert(s, &mut out),
                Op::Delete(n) => i += n,
            }
        }
        Ok(out)
    }

    /// Wire form: retains as positive integers, deletes as negative integers,
    /// inserts as strings.
    pub fn marshal(&self) -> Vec<Value> {
        self.ops
            .iter()
            .map(|op| match op {
                Op::Retain(n) => Value::from(*n as i64),
                Op::Delete(n) => Value::from(-(*n as i64)),
                Op::Insert(s) => Value::from(s.as_str()),
            })
            .collect()
    }

    /// Rebuild an operation (measured in code points) from its wire form.
    pub fn unmarshal(values: &[Value]) -> Result<Self, OtError> {
        Self::unmarshal_with(values, TextEncoding::default())
    }

    /// Rebuild an operation from its wire form, measuring text in `encoding`.
    ///
    /// Zero counts are ignored and fractional counts are truncated. Lengths
    /// beyond [`MAX_UNITS`] are rejected.
    pub fn unmarshal_with(values: &[Value], encoding: TextEncoding) -> Result<Self, OtError> {
        let mut op = Operation::with_encoding(encoding);
        for value in values {
            match value {
                Value::String(s) => {
                    let len = encoding.unit_len(s);
                    within_limit(op.target_len, len)?;
                    op.insert(s);
                }
                Value::Number(n) => {
                    let count = n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                        .ok_or_else(|| OtError::unmarshal(format!("count {n} out of range")))?;
                    let len = usize::try_from(count.unsigned_abs())
                        .map_err(|_| OtError::unmarshal(format!("count {count} out of range")))?;
                    within_limit(op.base_len, len)?;
                    if count > 0 {
                        within_limit(op.target_len, len)?;
                        op.retain(len);
                    } else {
                        op.delete(len);
                    }
                }
                other => {
                    return Err(OtError::unmarshal(format!(
                        "expected integer or string op, got {other}"
                    )))
                }
            }
        }
        Ok(op)
    }
}

fn within_limit(total: usize, n: usize) -> Result<(), OtError> {
    match total.checked_add(n) {
        Some(sum) if sum <= MAX_UNITS => Ok(()),
        _ => Err(OtError::unmarshal(format!(
            "operation longer than {MAX_UNITS} units"
        ))),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match op {
                Op::Retain(n) => write!(f, "{n}")?,
                Op::Delete(n) => write!(f, "-{n}")?,
                Op::Insert(s) => write!(f, "{s:?}")?,
            }
        }
        write!(f, "]")
    }
}
