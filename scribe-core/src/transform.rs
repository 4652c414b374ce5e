//! Reconciliation of two concurrent operations.
//!
//! Given `a` and `b` that both apply to the same document, [`transform`]
//! produces `(a', b')` such that
//!
//! ```text
//! apply(apply(s, a), b') == apply(apply(s, b), a')
//! ```
//!
//! When both sides insert at the same position, `a`'s text is placed first.

use crate::error::OtError;
use crate::operation::{Op, Operation};

/// Transform `a` against `b`.
///
/// The outputs carry `a`'s encoding and no selection meta.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::BaseLengthMismatch {
            expected: a.base_len(),
            actual: b.base_len(),
        });
    }
    if a.encoding() != b.encoding() {
        return Err(OtError::EncodingMismatch {
            left: a.encoding(),
            right: b.encoding(),
        });
    }

    let encoding = a.encoding();
    let mut a_prime = Operation::with_encoding(encoding);
    let mut b_prime = Operation::with_encoding(encoding);

    let mut ops_a = a.ops().iter().cloned();
    let mut ops_b = b.ops().iter().cloned();
    let mut op_a = ops_a.next();
    let mut op_b = ops_b.next();

    loop {
        match (op_a.take(), op_b.take()) {
            (None, None) => break,

            (Some(Op::Insert(s)), rest_b) => {
                b_prime.retain(encoding.unit_len(&s));
                a_prime.insert(&s);
                op_a = ops_a.next();
                op_b = rest_b;
            }

            (rest_a, Some(Op::Insert(s))) => {
                a_prime.retain(encoding.unit_len(&s));
                b_prime.insert(&s);
                op_a = rest_a;
                op_b = ops_b.next();
            }

            (Some(Op::Retain(na)), Some(Op::Retain(nb))) => {
                let (min, rest_a, rest_b) = consume(na, nb, Op::Retain, Op::Retain);
                a_prime.retain(min);
                b_prime.retain(min);
                op_a = rest_a.or_else(|| ops_a.next());
                op_b = rest_b.or_else(|| ops_b.next());
            }

            // Both sides removed the same span; neither output needs to.
            (Some(Op::Delete(na)), Some(Op::Delete(nb))) => {
                let (_, rest_a, rest_b) = consume(na, nb, Op::Delete, Op::Delete);
                op_a = rest_a.or_else(|| ops_a.next());
                op_b = rest_b.or_else(|| ops_b.next());
            }

            (Some(Op::Delete(na)), Some(Op::Retain(nb))) => {
                let (min, rest_a, rest_b) = consume(na, nb, Op::Delete, Op::Retain);
                a_prime.delete(min);
                op_a = rest_a.or_else(|| ops_a.next());
                op_b = rest_b.or_else(|| ops_b.next());
            }

            (Some(Op::Retain(na)), Some(Op::Delete(nb))) => {
                let (min, rest_a, rest_b) = consume(na, nb, Op::Retain, Op::Delete);
                b_prime.delete(min);
                op_a = rest_a.or_else(|| ops_a.next());
                op_b = rest_b.or_else(|| ops_b.next());
            }

            (None, Some(_)) | (Some(_), None) => return Err(OtError::TransformFailed),
        }
    }

    Ok((a_prime, b_prime))
}

/// Consume the overlap of two counted ops, returning the overlap and the
/// residual of whichever side was longer.
fn consume(
    na: usize,
    nb: usize,
    kind_a: fn(usize) -> Op,
    kind_b: fn(usize) -> Op,
) -> (usize, Option<Op>, Option<Op>) {
    use std::cmp::Ordering;

    match na.cmp(&nb) {
        Ordering::Greater => (nb, Some(kind_a(na - nb)), None),
        Ordering::Less => (na, None, Some(kind_b(nb - na))),
        Ordering::Equal => (na, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::TextEncoding;
    use crate::selection::{Range, Selection};

    fn assert_converges(s: &str, expected: &str, a: &Operation, b: &Operation) {
        let (a1, b1) = transform(a, b).unwrap();
        let left = b1.apply(&a.apply(s).unwrap()).unwrap();
        let right = a1.apply(&b.apply(s).unwrap()).unwrap();
        assert_eq!(left, expected);
        assert_eq!(right, expected);
    }

    #[test]
    fn test_base_length_mismatch() {
        let mut a = Operation::new();
        a.retain(1);
        let mut b = Operation::new();
        b.retain(2);
        assert!(matches!(
            transform(&a, &b),
            Err(OtError::BaseLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_encoding_mismatch() {
        let mut a = Operation::new();
        a.retain(1);
        let mut b = Operation::with_encoding(TextEncoding::Utf16);
        b.retain(1);
        assert!(matches!(
            transform(&a, &b),
            Err(OtError::EncodingMismatch { .. })
        ));
    }

    #[test]
    fn test_transform_converges() {
        let mut a = Operation::new();
        a.retain(4)
            .delete(1)
            .insert("wa")
            .retain(4)
            .insert("beautiful ")
            .retain(4)
            .delete(3)
            .insert(".");
        let mut b = Operation::new();
        b.delete(2)
            .insert("H")
            .retain(5)
            .delete(1)
            .insert("정말로")
            .retain(1)
            .delete(4)
            .insert("man")
            .delete(2)
            .retain(1);
        assert_converges("She is a girl!!!", "He was 정말로 beautiful man.", &a, &b);
    }

    #[test]
    fn test_transform_converges_utf16() {
        let mut a = Operation::with_encoding(TextEncoding::Utf16);
        a.retain(4)
            .delete(1)
            .insert("wa")
            .retain(5)
            .insert("beautiful ")
            .retain(4)
            .delete(3)
            .insert(".");
        let mut b = Operation::with_encoding(TextEncoding::Utf16);
        b.delete(2)
            .insert("H")
            .retain(5)
            .delete(2)
            .insert("👍👍")
            .retain(1)
            .delete(4)
            .insert("man")
            .delete(2)
            .retain(1);
        assert_converges("She is 😝 girl👧!", "He was 👍👍 beautiful man.", &a, &b);
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_put_a_first() {
        let mut a = Operation::new();
        a.retain(1).insert("A").retain(1);
        let mut b = Operation::new();
        b.retain(1).insert("B").retain(1);
        assert_converges("xy", "xABy", &a, &b);

        let (a1, b1) = transform(&a, &b).unwrap();
        let mut expected_a1 = Operation::new();
        expected_a1.retain(1).insert("A").retain(2);
        let mut expected_b1 = Operation::new();
        expected_b1.retain(2).insert("B").retain(1);
        assert_eq!(a1, expected_a1);
        assert_eq!(b1, expected_b1);
    }

    #[test]
    fn test_overlapping_deletes_are_elided() {
        let mut a = Operation::new();
        a.retain(1).delete(3).retain(2);
        let mut b = Operation::new();
        b.retain(2).delete(3).retain(1);

        let (a1, b1) = transform(&a, &b).unwrap();
        let mut expected_a1 = Operation::new();
        expected_a1.retain(1).delete(1).retain(1);
        let mut expected_b1 = Operation::new();
        expected_b1.retain(1).delete(1).retain(1);
        assert_eq!(a1, expected_a1);
        assert_eq!(b1, expected_b1);
        assert_converges("abcdef", "af", &a, &b);
    }

    #[test]
    fn test_delete_against_insert_inside_span() {
        let mut a = Operation::new();
        a.delete(4);
        let mut b = Operation::new();
        b.retain(2).insert("XY").retain(2);
        assert_converges("abcd", "XY", &a, &b);
    }

    #[test]
    fn test_outputs_have_no_meta() {
        let mut a = Operation::new();
        a.retain(2);
        let a = a.with_meta(Selection::new(vec![Range::new(1, 1)]));
        let mut b = Operation::new();
        b.insert("x").retain(2);
        let (a1, b1) = transform(&a, &b).unwrap();
        assert!(a1.meta().is_none());
        assert!(b1.meta().is_none());
    }

    #[test]
    fn test_lengths_line_up() {
        let mut a = Operation::new();
        a.retain(3).insert("hello").delete(2);
        let mut b = Operation::new();
        b.delete(1).retain(2).insert("!").retain(2);
        let (a1, b1) = transform(&a, &b).unwrap();
        assert_eq!(a1.base_len(), b.target_len());
        assert_eq!(b1.base_len(), a.target_len());
        assert_eq!(
            a.target_len() + b1.target_len() - b1.base_len(),
            b.target_len() + a1.target_len() - a1.base_len()
        );
    }
}
