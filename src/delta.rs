//! Delta: rich-text documents and the edits applied to them.
//!
//! DESIGN
//! ======
//! Wire-compatible with Quill deltas: `{"ops": [...]}` where each op is one
//! of `{"insert": ..}`, `{"retain": n}` or `{"delete": n}`. A document is a
//! delta made only of inserts. Inserts carry either a text run or a typed
//! placeholder object (signature block, long-response area, line segment,
//! version table).
//!
//! Lengths are counted in Unicode scalar values; every placeholder counts
//! as one unit. Cursor offsets reported by clients use the same units.
//!
//! `transform` is the Quill transform for one pair of operations. It is
//! sound for a single pair but nothing above it tracks client ack state,
//! so the service makes no convergence claim for arbitrary interleavings.

use serde::{Deserialize, Serialize};

/// Formatting attributes attached to inserts and retains.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Stand-in for the embedded character of a placeholder in plain text.
pub const PLACEHOLDER_MARKER: char = '\u{FFFC}';

// =============================================================================
// TYPES
// =============================================================================

/// Typed embedded objects. Serialized as single-key objects, e.g.
/// `{"signature": {"signer": "board"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Placeholder {
    Signature(serde_json::Value),
    LongResponse(serde_json::Value),
    LineSegment(serde_json::Value),
    VersionTable(serde_json::Value),
}

impl Placeholder {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Signature(_) => "signature",
            Self::LongResponse(_) => "longResponse",
            Self::LineSegment(_) => "lineSegment",
            Self::VersionTable(_) => "versionTable",
        }
    }
}

/// Payload of an insert op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Insert {
    Text(String),
    Placeholder(Placeholder),
}

/// One delta op.
#[derive(Debug, Clone, PartialEq, Serialize)]
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

/// Wire shape of an op before the exactly-one-kind check.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOp {
    #[serde(default)]
    insert: Option<Insert>,
    #[serde(default)]
    retain: Option<usize>,
    #[serde(default)]
    delete: Option<usize>,
    #[serde(default)]
    attributes: Option<Attributes>,
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = RawOp::deserialize(deserializer)?;
        match (raw.insert, raw.retain, raw.delete) {
            (Some(insert), None, None) => Ok(Self::Insert { insert, attributes: raw.attributes }),
            (None, Some(retain), None) => Ok(Self::Retain { retain, attributes: raw.attributes }),
            (None, None, Some(delete)) if raw.attributes.is_none() => Ok(Self::Delete { delete }),
            (None, None, Some(_)) => Err(D::Error::custom("delete op cannot carry attributes")),
            _ => Err(D::Error::custom("op must have exactly one of insert, retain or delete")),
        }
    }
}

/// Ordered list of ops. Either a document (inserts only) or a change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("operation has no ops")]
    Empty,
    #[error("op {index} has zero length")]
    ZeroLength { index: usize },
    #[error("operation reaches position {required} but the document has length {length}")]
    OutOfBounds { required: usize, length: usize },
    #[error("content contains retain or delete ops")]
    NotADocument,
}

impl crate::message::ErrorCode for DeltaError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotADocument => "E_CORRUPT_DOCUMENT",
            _ => "E_MALFORMED_OPERATION",
        }
    }
}

// =============================================================================
// OP
// =============================================================================

impl Op {
    /// Length in content units. Trailing implicit retains use `usize::MAX`.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Insert { insert: Insert::Text(text), .. } => text.chars().count(),
            Self::Insert { insert: Insert::Placeholder(_), .. } => 1,
            Self::Retain { retain, .. } => *retain,
            Self::Delete { delete } => *delete,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert { .. })
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    #[must_use]
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Self::Insert { attributes, .. } | Self::Retain { attributes, .. } => attributes.as_ref(),
            Self::Delete { .. } => None,
        }
    }

    /// Apply a retain's attributes onto a document piece.
    fn with_composed_attributes(self, change: Option<&Attributes>) -> Self {
        let Some(change) = change else {
            return self;
        };
        match self {
            Self::Insert { insert, attributes } => {
                Self::Insert { insert, attributes: compose_attributes(attributes.as_ref(), change) }
            }
            other => other,
        }
    }
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

impl Delta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw ops, merging neighbours the same way `push` does.
    #[must_use]
    pub fn from_ops(ops: Vec<Op>) -> Self {
        let mut delta = Self::new();
        for op in ops {
            delta.push(op);
        }
        delta
    }

    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(Op::Insert { insert: Insert::Text(text.into()), attributes: None });
        self
    }

    #[must_use]
    pub fn insert_with(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        let attributes = (!attributes.is_empty()).then_some(attributes);
        self.push(Op::Insert { insert: Insert::Text(text.into()), attributes });
        self
    }

    #[must_use]
    pub fn insert_placeholder(mut self, placeholder: Placeholder) -> Self {
        self.push(Op::Insert { insert: Insert::Placeholder(placeholder), attributes: None });
        self
    }

    #[must_use]
    pub fn retain(mut self, len: usize) -> Self {
        self.push(Op::Retain { retain: len, attributes: None });
        self
    }

    #[must_use]
    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        let attributes = (!attributes.is_empty()).then_some(attributes);
        self.push(Op::Retain { retain: len, attributes });
        self
    }

    #[must_use]
    pub fn delete(mut self, len: usize) -> Self {
        self.push(Op::Delete { delete: len });
        self
    }

    /// Append an op, merging with the previous one where possible.
    ///
    /// Inserts are placed before a trailing delete so equivalent deltas have
    /// one canonical form.
    pub fn push(&mut self, op: Op) {
        if op.is_empty() {
            return;
        }

        let mut index = self.ops.len();
        if let (Some(Op::Delete { delete }), Op::Delete { delete: more }) = (self.ops.last_mut(), &op) {
            *delete = delete.saturating_add(*more);
            return;
        }
        if op.is_insert() && self.ops.last().is_some_and(Op::is_delete) {
            index -= 1;
        }

        if index > 0 {
            if let Some(merged) = merge_ops(&self.ops[index - 1], &op) {
                self.ops[index - 1] = merged;
                return;
            }
        }
        self.ops.insert(index, op);
    }

    /// Drop a trailing plain retain; it carries no information.
    #[must_use]
    pub fn chop(mut self) -> Self {
        if let Some(Op::Retain { attributes: None, .. }) = self.ops.last() {
            self.ops.pop();
        }
        self
    }
}

fn merge_ops(prev: &Op, next: &Op) -> Option<Op> {
    match (prev, next) {
        (
            Op::Insert { insert: Insert::Text(a), attributes: attrs_a },
            Op::Insert { insert: Insert::Text(b), attributes: attrs_b },
        ) if attrs_a == attrs_b => {
            Some(Op::Insert { insert: Insert::Text(format!("{a}{b}")), attributes: attrs_a.clone() })
        }
        (Op::Retain { retain: a, attributes: attrs_a }, Op::Retain { retain: b, attributes: attrs_b })
            if attrs_a == attrs_b =>
        {
            Some(Op::Retain { retain: a.saturating_add(*b), attributes: attrs_a.clone() })
        }
        _ => None,
    }
}

// =============================================================================
// INSPECTION
// =============================================================================

impl Delta {
    /// Total length of all ops.
    #[must_use]
    pub fn length(&self) -> usize {
        self.ops.iter().map(Op::len).fold(0, usize::saturating_add)
    }

    /// True when every op is an insert.
    #[must_use]
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(Op::is_insert)
    }

    /// Reject shapes that cannot describe an edit.
    ///
    /// # Errors
    ///
    /// Returns `Empty` for a delta without ops and `ZeroLength` for ops that
    /// cover no content.
    pub fn validate(&self) -> Result<(), DeltaError> {
        if self.ops.is_empty() {
            return Err(DeltaError::Empty);
        }
        if let Some(index) = self.ops.iter().position(Op::is_empty) {
            return Err(DeltaError::ZeroLength { index });
        }
        Ok(())
    }

    /// Flatten a document to plain text. Placeholders become
    /// [`PLACEHOLDER_MARKER`] so offsets stay aligned.
    #[must_use]
    pub fn to_plain_text(&self) -> String {
        extract_text_from_delta(self)
    }
}

/// Flatten inserts to plain text. Retains and deletes contribute nothing;
/// each placeholder contributes one [`PLACEHOLDER_MARKER`].
#[must_use]
pub fn extract_text_from_delta(content: &Delta) -> String {
    let mut text = String::new();
    for op in &content.ops {
        match op {
            Op::Insert { insert: Insert::Text(run), .. } => text.push_str(run),
            Op::Insert { insert: Insert::Placeholder(_), .. } => text.push(PLACEHOLDER_MARKER),
            Op::Retain { .. } | Op::Delete { .. } => {}
        }
    }
    text
}

// =============================================================================
// ITERATOR
// =============================================================================

/// Walks ops while allowing callers to take partial ops. Past the end it
/// yields an unbounded retain, which is what transform expects.
struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self { ops, index: 0, offset: 0 }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        self.ops
            .get(self.index)
            .map_or(usize::MAX, |op| op.len() - self.offset)
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_insert)
    }

    fn next(&mut self, max: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain { retain: usize::MAX, attributes: None };
        };

        let offset = self.offset;
        let remaining = op.len() - offset;
        let take = remaining.min(max);
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }

        match op {
            Op::Delete { .. } => Op::Delete { delete: take },
            Op::Retain { attributes, .. } => Op::Retain { retain: take, attributes: attributes.clone() },
            Op::Insert { insert: Insert::Text(text), attributes } => Op::Insert {
                insert: Insert::Text(text.chars().skip(offset).take(take).collect()),
                attributes: attributes.clone(),
            },
            Op::Insert { insert: Insert::Placeholder(_), .. } => op.clone(),
        }
    }
}

// =============================================================================
// APPLY
// =============================================================================

impl Delta {
    /// Apply this change to a document and return the new document.
    ///
    /// # Errors
    ///
    /// Returns `NotADocument` if `document` contains retains or deletes and
    /// `OutOfBounds` if a retain or delete runs past the end of it.
    pub fn apply_to(&self, document: &Delta) -> Result<Delta, DeltaError> {
        if !document.is_document() {
            return Err(DeltaError::NotADocument);
        }

        let length = document.length();
        let mut base = OpIter::new(&document.ops);
        let mut out = Delta::new();
        let mut position = 0usize;

        for op in &self.ops {
            match op {
                Op::Insert { .. } => out.push(op.clone()),
                Op::Retain { retain, attributes } => {
                    let required = position.saturating_add(*retain);
                    if required > length {
                        return Err(DeltaError::OutOfBounds { required, length });
                    }
                    let mut remaining = *retain;
                    while remaining > 0 {
                        let piece = base.next(remaining);
                        remaining -= piece.len();
                        out.push(piece.with_composed_attributes(attributes.as_ref()));
                    }
                    position = required;
                }
                Op::Delete { delete } => {
                    let required = position.saturating_add(*delete);
                    if required > length {
                        return Err(DeltaError::OutOfBounds { required, length });
                    }
                    let mut remaining = *delete;
                    while remaining > 0 {
                        remaining -= base.next(remaining).len();
                    }
                    position = required;
                }
            }
        }

        while base.has_next() {
            out.push(base.next(usize::MAX));
        }
        Ok(out)
    }

    /// Copy of the document range `[start, end)`.
    fn slice(&self, start: usize, end: usize) -> Delta {
        let mut iter = OpIter::new(&self.ops);
        let mut skipped = 0;
        while skipped < start && iter.has_next() {
            skipped += iter.next(start - skipped).len();
        }
        let mut out = Delta::new();
        let mut taken = start;
        while taken < end && iter.has_next() {
            let piece = iter.next(end - taken);
            taken += piece.len();
            out.push(piece);
        }
        out
    }
}

// =============================================================================
// TRANSFORM
// =============================================================================

impl Delta {
    /// Rewrite `other` so it applies after `self`, both having been authored
    /// against the same document. With `priority`, inserts from `self` at
    /// the same position land first.
    #[must_use]
    pub fn transform(&self, other: &Delta, priority: bool) -> Delta {
        let mut this_iter = OpIter::new(&self.ops);
        let mut other_iter = OpIter::new(&other.ops);
        let mut out = Delta::new();

        while this_iter.has_next() || other_iter.has_next() {
            if this_iter.peek_is_insert() && (priority || !other_iter.peek_is_insert()) {
                let len = this_iter.next(usize::MAX).len();
                out.push(Op::Retain { retain: len, attributes: None });
            } else if other_iter.peek_is_insert() {
                out.push(other_iter.next(usize::MAX));
            } else {
                let len = this_iter.peek_len().min(other_iter.peek_len());
                let this_op = this_iter.next(len);
                let other_op = other_iter.next(len);
                if this_op.is_delete() {
                    // Already gone; nothing left for `other` to touch.
                    continue;
                }
                if other_op.is_delete() {
                    out.push(other_op);
                } else {
                    let attributes = transform_attributes(this_op.attributes(), other_op.attributes(), priority);
                    out.push(Op::Retain { retain: len, attributes });
                }
            }
        }
        out.chop()
    }

    /// Build the change that undoes `self` when applied to `self.apply_to(base)`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if `self` does not fit `base`.
    pub fn invert(&self, base: &Delta) -> Result<Delta, DeltaError> {
        let length = base.length();
        let mut inverted = Delta::new();
        let mut base_index = 0usize;

        for op in &self.ops {
            match op {
                Op::Insert { .. } => inverted.push(Op::Delete { delete: op.len() }),
                Op::Retain { retain, attributes: None } => {
                    inverted.push(Op::Retain { retain: *retain, attributes: None });
                    base_index = base_index.saturating_add(*retain);
                }
                Op::Retain { retain: len, attributes: Some(_) } | Op::Delete { delete: len } => {
                    let end = base_index.saturating_add(*len);
                    if end > length {
                        return Err(DeltaError::OutOfBounds { required: end, length });
                    }
                    for base_op in base.slice(base_index, end).ops {
                        if op.is_delete() {
                            inverted.push(base_op);
                        } else {
                            let attributes = invert_attributes(op.attributes(), base_op.attributes());
                            inverted.push(Op::Retain { retain: base_op.len(), attributes });
                        }
                    }
                    base_index = end;
                }
            }
        }
        Ok(inverted.chop())
    }
}

// =============================================================================
// ATTRIBUTES
// =============================================================================

fn compose_attributes(base: Option<&Attributes>, change: &Attributes) -> Option<Attributes> {
    let mut out = base.cloned().unwrap_or_default();
    for (key, value) in change {
        if value.is_null() {
            out.remove(key);
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    (!out.is_empty()).then_some(out)
}

fn transform_attributes(applied: Option<&Attributes>, incoming: Option<&Attributes>, priority: bool) -> Option<Attributes> {
    let incoming = incoming?;
    let Some(applied) = applied.filter(|_| priority) else {
        return Some(incoming.clone());
    };
    let out: Attributes = incoming
        .iter()
        .filter(|(key, _)| !applied.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!out.is_empty()).then_some(out)
}

fn invert_attributes(change: Option<&Attributes>, base: Option<&Attributes>) -> Option<Attributes> {
    let empty = Attributes::new();
    let change = change.unwrap_or(&empty);
    let base = base.unwrap_or(&empty);

    let mut out = Attributes::new();
    for (key, value) in base {
        if change.get(key).is_some_and(|c| c != value) {
            out.insert(key.clone(), value.clone());
        }
    }
    for key in change.keys() {
        if !base.contains_key(key) {
            out.insert(key.clone(), serde_json::Value::Null);
        }
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
#[path = "delta_test.rs"]
mod tests;
