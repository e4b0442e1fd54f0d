//! Rich-text delta model.
//!
//! A delta is an ordered list of `insert` / `retain` / `delete` ops, the
//! same JSON shape the browser editor emits:
//!
//! ```text
//! {"ops":[{"retain":5},{"insert":" world","attributes":{"bold":true}},{"delete":2}]}
//! ```
//!
//! A *document* is a delta made only of inserts. Changes are applied to a
//! document with [`Delta::apply_to`]; operations that were authored
//! concurrently are rebased with [`Delta::transform`].
//!
//! Lengths are counted in `char`s. An embed (image, formula, ...) has
//! length 1.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Formatting attributes attached to an insert or retain.
pub type Attributes = Map<String, Value>;

/// Inserted content: either text or a single embedded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Insert {
    Text(String),
    Embed(Map<String, Value>),
}

impl Insert {
    fn len(&self) -> usize {
        match self {
            Insert::Text(text) => text.chars().count(),
            Insert::Embed(_) => 1,
        }
    }
}

/// A single delta instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Op {
    Insert {
        insert: Insert,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Retain {
        retain: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Delete {
        delete: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Insert,
    Retain,
    Delete,
}

impl Op {
    /// Length of the op in document positions.
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { insert, .. } => insert.len(),
            Op::Retain { retain, .. } => *retain,
            Op::Delete { delete } => *delete,
        }
    }

    /// Whether the op covers zero positions (and is therefore invalid).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Op::Insert { attributes, .. } | Op::Retain { attributes, .. } => attributes.as_ref(),
            Op::Delete { .. } => None,
        }
    }

    fn kind(&self) -> OpKind {
        match self {
            Op::Insert { .. } => OpKind::Insert,
            Op::Retain { .. } => OpKind::Retain,
            Op::Delete { .. } => OpKind::Delete,
        }
    }

    /// Empty attribute maps are stored as `None` so equality is structural.
    fn normalized(self) -> Self {
        match self {
            Op::Insert { insert, attributes } => Op::Insert {
                insert,
                attributes: attributes.filter(|a| !a.is_empty()),
            },
            Op::Retain { retain, attributes } => Op::Retain {
                retain,
                attributes: attributes.filter(|a| !a.is_empty()),
            },
            delete => delete,
        }
    }

    /// Cut `len` positions starting at `offset` out of this op.
    fn slice(&self, offset: usize, len: usize) -> Op {
        match self {
            Op::Insert {
                insert: Insert::Text(text),
                attributes,
            } => Op::Insert {
                insert: Insert::Text(text.chars().skip(offset).take(len).collect()),
                attributes: attributes.clone(),
            },
            Op::Insert { .. } => self.clone(),
            Op::Retain { attributes, .. } => Op::Retain {
                retain: len,
                attributes: attributes.clone(),
            },
            Op::Delete { .. } => Op::Delete { delete: len },
        }
    }

    /// Apply a retain's formatting to a piece of document content.
    fn with_formatting(self, change: &Attributes) -> Op {
        match self {
            Op::Insert { insert, attributes } => Op::Insert {
                insert,
                attributes: compose_attributes(attributes.as_ref(), change),
            },
            Op::Retain { retain, attributes } => Op::Retain {
                retain,
                attributes: compose_attributes(attributes.as_ref(), change),
            },
            delete => delete,
        }
    }
}

/// Structural errors raised while validating or applying a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// An op covers zero positions.
    EmptyOp { index: usize },
    /// A retain or delete reaches past the end of the document.
    OutOfBounds { end: usize, length: usize },
    /// The base of an apply contains something other than inserts.
    NotADocument { index: usize },
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaError::EmptyOp { index } => write!(f, "Op {index} has zero length"),
            DeltaError::OutOfBounds { end, length } => {
                write!(f, "Delta reaches position {end} but document length is {length}")
            }
            DeltaError::NotADocument { index } => {
                write!(f, "Op {index} of the base is not an insert")
            }
        }
    }
}

impl std::error::Error for DeltaError {}

/// An ordered sequence of delta ops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<Op>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// A document holding `text` with no formatting.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new().insert(text)
    }

    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(Op::Insert {
            insert: Insert::Text(text.into()),
            attributes: None,
        });
        self
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.push(Op::Insert {
            insert: Insert::Text(text.into()),
            attributes: Some(attributes),
        });
        self
    }

    pub fn insert_embed(mut self, embed: Map<String, Value>) -> Self {
        self.push(Op::Insert {
            insert: Insert::Embed(embed),
            attributes: None,
        });
        self
    }

    pub fn retain(mut self, len: usize) -> Self {
        self.push(Op::Retain {
            retain: len,
            attributes: None,
        });
        self
    }

    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        self.push(Op::Retain {
            retain: len,
            attributes: Some(attributes),
        });
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Op::Delete { delete: len });
        self
    }

    /// Append an op, merging it with the previous one where possible.
    ///
    /// Zero-length ops are dropped. An insert pushed after a delete is
    /// placed before it, so equivalent deltas have one canonical form.
    pub fn push(&mut self, op: Op) -> &mut Self {
        if op.is_empty() {
            return self;
        }
        let op = op.normalized();

        let len = self.ops.len();
        if let Some(Op::Delete { delete }) = self.ops.last_mut() {
            match op {
                Op::Delete { delete: more } => {
                    *delete = delete.saturating_add(more);
                    return self;
                }
                Op::Insert { .. } => {
                    if len >= 2 && try_merge(&mut self.ops[len - 2], &op) {
                        return self;
                    }
                    self.ops.insert(len - 1, op);
                    return self;
                }
                Op::Retain { .. } => {}
            }
        }

        if let Some(last) = self.ops.last_mut() {
            if try_merge(last, &op) {
                return self;
            }
        }
        self.ops.push(op);
        self
    }

    /// Total length covered by the ops.
    pub fn length(&self) -> usize {
        self.ops.iter().map(Op::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether this delta only contains inserts.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, Op::Insert { .. }))
    }

    /// Concatenated text of all text inserts; embeds are skipped.
    pub fn plain_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Insert {
                    insert: Insert::Text(text),
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Reject zero-length ops.
    pub fn validate(&self) -> Result<(), DeltaError> {
        match self.ops.iter().position(Op::is_empty) {
            Some(index) => Err(DeltaError::EmptyOp { index }),
            None => Ok(()),
        }
    }

    /// Apply this change to `document`, returning the new document.
    ///
    /// `document` is left untouched; on error nothing is produced.
    pub fn apply_to(&self, document: &Delta) -> Result<Delta, DeltaError> {
        if let Some(index) = document
            .ops
            .iter()
            .position(|op| !matches!(op, Op::Insert { .. }))
        {
            return Err(DeltaError::NotADocument { index });
        }
        self.validate()?;

        let length = document.length();
        let mut base = OpCursor::new(&document.ops);
        let mut position = 0usize;
        let mut out = Delta {
            ops: Vec::with_capacity(document.ops.len() + self.ops.len()),
        };

        for op in &self.ops {
            match op {
                Op::Insert { .. } => {
                    out.push(op.clone());
                }
                Op::Retain { retain, attributes } => {
                    let end = position.saturating_add(*retain);
                    if end > length {
                        return Err(DeltaError::OutOfBounds { end, length });
                    }
                    let mut left = *retain;
                    while left > 0 {
                        let piece = base.next(left);
                        left -= piece.len();
                        match attributes {
                            Some(change) => out.push(piece.with_formatting(change)),
                            None => out.push(piece),
                        };
                    }
                    position = end;
                }
                Op::Delete { delete } => {
                    let end = position.saturating_add(*delete);
                    if end > length {
                        return Err(DeltaError::OutOfBounds { end, length });
                    }
                    let mut left = *delete;
                    while left > 0 {
                        left -= base.next(left).len();
                    }
                    position = end;
                }
            }
        }

        while base.has_next() {
            out.push(base.next(usize::MAX));
        }
        Ok(out)
    }

    /// Rebase `other` so it can be applied after `self`.
    ///
    /// Both deltas must have been authored against the same base. When both
    /// insert at the same position, `priority = true` puts `self`'s insert
    /// first.
    pub fn transform(&self, other: &Delta, priority: bool) -> Delta {
        let mut this = OpCursor::new(&self.ops);
        let mut that = OpCursor::new(&other.ops);
        let mut out = Delta::new();

        while this.has_next() || that.has_next() {
            if this.peek_kind() == OpKind::Insert
                && (priority || that.peek_kind() != OpKind::Insert)
            {
                let skipped = this.next(usize::MAX).len();
                out.push(Op::Retain {
                    retain: skipped,
                    attributes: None,
                });
            } else if that.peek_kind() == OpKind::Insert {
                out.push(that.next(usize::MAX));
            } else {
                let len = this.peek_len().min(that.peek_len());
                let this_op = this.next(len);
                let that_op = that.next(len);
                if let Op::Delete { .. } = this_op {
                    // Already removed by `self`.
                    continue;
                }
                match that_op {
                    Op::Retain { attributes, .. } => {
                        out.push(Op::Retain {
                            retain: len,
                            attributes: transform_attributes(
                                this_op.attributes(),
                                attributes.as_ref(),
                                priority,
                            ),
                        });
                    }
                    other => {
                        out.push(other);
                    }
                }
            }
        }

        out.chop()
    }

    /// Drop a trailing unformatted retain.
    pub fn chop(mut self) -> Self {
        if let Some(Op::Retain {
            attributes: None, ..
        }) = self.ops.last()
        {
            self.ops.pop();
        }
        self
    }
}

fn try_merge(last: &mut Op, op: &Op) -> bool {
    match (last, op) {
        (
            Op::Insert {
                insert: Insert::Text(text),
                attributes,
            },
            Op::Insert {
                insert: Insert::Text(more),
                attributes: other,
            },
        ) => {
            if *attributes != *other {
                return false;
            }
            text.push_str(more);
            true
        }
        (
            Op::Retain { retain, attributes },
            Op::Retain {
                retain: more,
                attributes: other,
            },
        ) => {
            if *attributes != *other {
                return false;
            }
            *retain = retain.saturating_add(*more);
            true
        }
        _ => false,
    }
}

/// Merge `change` into `base`; a `null` value removes the key.
fn compose_attributes(base: Option<&Attributes>, change: &Attributes) -> Option<Attributes> {
    let mut merged = base.cloned().unwrap_or_default();
    for (key, value) in change {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    Some(merged).filter(|m| !m.is_empty())
}

fn transform_attributes(
    this: Option<&Attributes>,
    that: Option<&Attributes>,
    priority: bool,
) -> Option<Attributes> {
    let Some(this) = this else {
        return that.cloned();
    };
    let that = that?;
    if !priority {
        return Some(that.clone());
    }
    let kept: Attributes = that
        .iter()
        .filter(|(key, _)| !this.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Some(kept).filter(|m| !m.is_empty())
}

/// Walks a list of ops, handing out pieces of at most a requested length.
///
/// Past the end it yields an unbounded retain.
struct OpCursor<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_kind(&self) -> OpKind {
        self.ops
            .get(self.index)
            .map_or(OpKind::Retain, Op::kind)
    }

    fn next(&mut self, max: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain {
                retain: max,
                attributes: None,
            };
        };
        let remaining = op.len() - self.offset;
        let take = remaining.min(max);
        let piece = if self.offset == 0 && take == remaining {
            op.clone()
        } else {
            op.slice(self.offset, take)
        };
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        piece
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("attributes must be an object"),
        }
    }

    #[test]
    fn test_insert_into_empty_document() {
        let doc = Delta::new();
        let change = Delta::new().insert("hello");
        let result = change.apply_to(&doc).unwrap();
        assert_eq!(result.plain_text(), "hello");
        assert!(result.is_document());
    }

    #[test]
    fn test_retain_insert_delete() {
        let doc = Delta::from_text("hello world");
        let change = Delta::new().retain(5).insert(",").delete(1).insert(" ");
        let result = change.apply_to(&doc).unwrap();
        assert_eq!(result.plain_text(), "hello, world");
        assert_eq!(result.length(), 12);
    }

    #[test]
    fn test_apply_formatting_splits_text() {
        let doc = Delta::from_text("hello");
        let change = Delta::new().retain(1).retain_with(3, attrs(json!({"bold": true})));
        let result = change.apply_to(&doc).unwrap();

        assert_eq!(result.ops.len(), 3);
        assert_eq!(
            result.ops[1],
            Op::Insert {
                insert: Insert::Text("ell".into()),
                attributes: Some(attrs(json!({"bold": true}))),
            }
        );
        assert_eq!(result.plain_text(), "hello");
    }

    #[test]
    fn test_null_attribute_removes_formatting() {
        let doc = Delta::new().insert_with("abc", attrs(json!({"bold": true})));
        let change = Delta::new().retain_with(3, attrs(json!({"bold": null})));
        let result = change.apply_to(&doc).unwrap();
        assert_eq!(result, Delta::from_text("abc"));
    }

    #[test]
    fn test_apply_out_of_bounds_is_rejected() {
        let doc = Delta::from_text("abc");
        let retain = Delta::new().retain(4).insert("x");
        assert_eq!(
            retain.apply_to(&doc),
            Err(DeltaError::OutOfBounds { end: 4, length: 3 })
        );

        let delete = Delta::new().retain(2).delete(2);
        assert!(delete.apply_to(&doc).is_err());
        // Base untouched
        assert_eq!(doc.plain_text(), "abc");
    }

    #[test]
    fn test_apply_rejects_empty_ops() {
        let doc = Delta::from_text("abc");
        let change = Delta {
            ops: vec![Op::Retain {
                retain: 0,
                attributes: None,
            }],
        };
        assert_eq!(change.apply_to(&doc), Err(DeltaError::EmptyOp { index: 0 }));
    }

    #[test]
    fn test_apply_onto_non_document_fails() {
        let base = Delta::new().retain(3);
        let change = Delta::new().insert("x");
        assert_eq!(
            change.apply_to(&base),
            Err(DeltaError::NotADocument { index: 0 })
        );
    }

    #[test]
    fn test_multibyte_characters_count_as_one() {
        let doc = Delta::from_text("héllo🙂");
        assert_eq!(doc.length(), 6);
        let change = Delta::new().retain(5).delete(1).insert("!");
        assert_eq!(change.apply_to(&doc).unwrap().plain_text(), "héllo!");
    }

    #[test]
    fn test_embed_has_length_one() {
        let mut image = Map::new();
        image.insert("image".into(), json!("cat.png"));
        let doc = Delta::from_text("ab").insert_embed(image).insert("cd");
        assert_eq!(doc.length(), 5);

        let change = Delta::new().retain(2).delete(1);
        let result = change.apply_to(&doc).unwrap();
        assert_eq!(result, Delta::from_text("abcd"));
    }

    #[test]
    fn test_push_merges_and_reorders() {
        let delta = Delta::new().insert("a").insert("b").retain(1).retain(2);
        assert_eq!(delta.ops.len(), 2);

        // insert after delete lands before it
        let delta = Delta::new().retain(1).delete(2).insert("x");
        assert_eq!(delta, Delta::new().retain(1).insert("x").delete(2));

        // zero-length ops disappear
        assert!(Delta::new().insert("").retain(0).delete(0).is_empty());
    }

    #[test]
    fn test_json_shape_matches_editor() {
        let delta = Delta::new()
            .retain(5)
            .insert_with("!", attrs(json!({"italic": true})))
            .delete(1);
        let encoded = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            encoded,
            json!({"ops": [
                {"retain": 5},
                {"insert": "!", "attributes": {"italic": true}},
                {"delete": 1}
            ]})
        );

        let decoded: Delta = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, delta);
    }

    #[test]
    fn test_decode_embed_insert() {
        let decoded: Delta =
            serde_json::from_value(json!({"ops": [{"insert": {"image": "x.png"}}]})).unwrap();
        assert!(matches!(
            decoded.ops[0],
            Op::Insert {
                insert: Insert::Embed(_),
                ..
            }
        ));
    }

    fn converges(doc: &Delta, a: &Delta, b: &Delta) {
        let left = a
            .transform(b, true)
            .apply_to(&a.apply_to(doc).unwrap())
            .unwrap();
        let right = b
            .transform(a, false)
            .apply_to(&b.apply_to(doc).unwrap())
            .unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_concurrent_inserts_same_position() {
        let doc = Delta::from_text("abc");
        let a = Delta::new().retain(1).insert("X");
        let b = Delta::new().retain(1).insert("Y");

        assert_eq!(a.transform(&b, true), Delta::new().retain(2).insert("Y"));
        assert_eq!(a.transform(&b, false), Delta::new().retain(1).insert("Y"));
        converges(&doc, &a, &b);

        let merged = a.transform(&b, true).apply_to(&a.apply_to(&doc).unwrap()).unwrap();
        assert_eq!(merged.plain_text(), "aXYbc");
    }

    #[test]
    fn test_transform_insert_against_delete() {
        let doc = Delta::from_text("abcdef");
        let a = Delta::new().retain(1).delete(3);
        let b = Delta::new().retain(3).insert("Z");

        assert_eq!(a.transform(&b, true), Delta::new().retain(1).insert("Z"));
        converges(&doc, &a, &b);
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let doc = Delta::from_text("abcdef");
        let a = Delta::new().retain(1).delete(3);
        let b = Delta::new().retain(2).delete(3);
        converges(&doc, &a, &b);

        let result = b
            .transform(&a, false)
            .apply_to(&b.apply_to(&doc).unwrap())
            .unwrap();
        assert_eq!(result.plain_text(), "af");
    }

    #[test]
    fn test_transform_formatting_priority() {
        let doc = Delta::from_text("abc");
        let a = Delta::new().retain_with(3, attrs(json!({"color": "red"})));
        let b = Delta::new().retain_with(3, attrs(json!({"color": "blue", "bold": true})));

        // With priority, `a`'s color wins and only `bold` survives from `b`.
        assert_eq!(
            a.transform(&b, true),
            Delta::new().retain_with(3, attrs(json!({"bold": true})))
        );
        converges(&doc, &a, &b);
    }

    #[test]
    fn test_transform_against_empty_is_identity() {
        let b = Delta::new().retain(2).insert("q").delete(1);
        assert_eq!(Delta::new().transform(&b, true), b);
    }

    #[test]
    fn test_delta_error_display() {
        let err = DeltaError::OutOfBounds { end: 9, length: 3 };
        assert!(err.to_string().contains('9'));
        assert!(err.to_string().contains('3'));
    }
}
