//! Reconciliation of an edited text buffer against the line collection.
//!
//! The buffer is split into lines; each line maps to one record of the
//! form `{ content, fingerprint }`. Reconciliation produces the minimal set
//! of structural edits:
//!
//! | Situation | Edit |
//! |-----------|------|
//! | more lines than records | append the extra lines |
//! | fewer lines than records | truncate trailing records |
//! | line differs from record | overwrite the differing fields |
//!
//! The fingerprint is a cheap checksum used as a fast path. Equal checksums
//! do not prove equal content ("ab" and "ba" collide), so content is always
//! compared before a record is skipped.

use crate::document::{DocError, Document};
use crate::state::Value;
use serde::{Deserialize, Serialize};

/// Collection holding the document lines.
pub const LINES_CONTAINER: &str = "elements";

/// Field holding the line text.
pub const CONTENT_FIELD: &str = "content";

/// Field holding the line fingerprint.
pub const FINGERPRINT_FIELD: &str = "fingerprint";

/// Line separator of the text buffer.
pub const LINE_SEPARATOR: char = '\n';

/// Checksum of a line: the wrapping sum of its Unicode scalar values.
#[must_use]
pub fn fingerprint(content: &str) -> i64 {
    content
        .chars()
        .fold(0i64, |acc, c| acc.wrapping_add(i64::from(u32::from(c))))
}

/// One line of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    /// Checksum of `content`
    pub fingerprint: i64,
    /// Line text without separator
    pub content: String,
}

impl LineRecord {
    /// Create a record, computing its fingerprint.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            fingerprint: fingerprint(&content),
            content,
        }
    }

    fn matches(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.content == other.content
    }
}

/// A structural edit against the line collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOp {
    /// Append a record at the end
    Append(LineRecord),
    /// Replace the record at `index`
    Overwrite {
        /// Line index
        index: usize,
        /// New record value
        record: LineRecord,
    },
    /// Drop every record at or after `len`
    Truncate {
        /// Resulting collection length
        len: usize,
    },
}

/// The edits turning the current records into a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Edits in application order
    pub ops: Vec<LineOp>,
}

impl Reconciliation {
    /// Whether any edit is needed.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.ops.is_empty()
    }
}

/// Split a buffer into line records.
#[must_use]
pub fn split_lines(buffer: &str) -> Vec<LineRecord> {
    buffer.split(LINE_SEPARATOR).map(LineRecord::new).collect()
}

/// Compute the edits turning `current` into the lines of `buffer`.
#[must_use]
pub fn plan(buffer: &str, current: &[LineRecord]) -> Reconciliation {
    let candidates = split_lines(buffer);
    let mut ops = Vec::new();

    for (index, (candidate, existing)) in candidates.iter().zip(current).enumerate() {
        if !candidate.matches(existing) {
            ops.push(LineOp::Overwrite {
                index,
                record: candidate.clone(),
            });
        }
    }

    if candidates.len() > current.len() {
        ops.extend(
            candidates
                .into_iter()
                .skip(current.len())
                .map(LineOp::Append),
        );
    } else if candidates.len() < current.len() {
        ops.push(LineOp::Truncate {
            len: candidates.len(),
        });
    }

    Reconciliation { ops }
}

/// Read the line records of a document's visible state.
#[must_use]
pub fn read_records(doc: &Document) -> Vec<LineRecord> {
    (0..doc.len(LINES_CONTAINER))
        .map(|index| {
            let content = doc
                .get_field(LINES_CONTAINER, index, CONTENT_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let fingerprint = doc
                .get_field(LINES_CONTAINER, index, FINGERPRINT_FIELD)
                .and_then(Value::as_int)
                .unwrap_or_default();
            LineRecord {
                fingerprint,
                content,
            }
        })
        .collect()
}

/// The text buffer of a document's visible state.
#[must_use]
pub fn buffer_text(doc: &Document) -> String {
    read_records(doc)
        .into_iter()
        .map(|record| record.content)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply edits to the document in a single commit.
///
/// Only fields whose stored value differs are written.
///
/// # Errors
///
/// Returns [`DocError::Detached`] if the document is checked out, or an
/// index error if the edits do not match the live collection. A failed
/// apply leaves the document as it was.
pub fn apply(doc: &mut Document, reconciliation: &Reconciliation) -> Result<bool, DocError> {
    if !reconciliation.changed() {
        return Ok(false);
    }
    let mut txn = doc.transact()?;
    for op in &reconciliation.ops {
        match op {
            LineOp::Append(record) => {
                let index = txn.len(LINES_CONTAINER);
                txn.insert(LINES_CONTAINER, index)?;
                txn.set(LINES_CONTAINER, index, CONTENT_FIELD, record.content.as_str())?;
                txn.set(LINES_CONTAINER, index, FINGERPRINT_FIELD, record.fingerprint)?;
            }
            LineOp::Overwrite { index, record } => {
                let content = txn
                    .get_field(LINES_CONTAINER, *index, CONTENT_FIELD)
                    .and_then(Value::as_str);
                if content != Some(record.content.as_str()) {
                    txn.set(LINES_CONTAINER, *index, CONTENT_FIELD, record.content.as_str())?;
                }
                let stored = txn
                    .get_field(LINES_CONTAINER, *index, FINGERPRINT_FIELD)
                    .and_then(Value::as_int);
                if stored != Some(record.fingerprint) {
                    txn.set(LINES_CONTAINER, *index, FINGERPRINT_FIELD, record.fingerprint)?;
                }
            }
            LineOp::Truncate { len } => {
                while txn.len(LINES_CONTAINER) > *len {
                    let last = txn.len(LINES_CONTAINER) - 1;
                    txn.delete(LINES_CONTAINER, last)?;
                }
            }
        }
    }
    Ok(txn.commit())
}

/// Reconcile the document with an edited buffer.
///
/// Returns whether anything changed. Calling it again with the same buffer
/// returns `false` and commits nothing.
///
/// # Errors
///
/// Returns [`DocError::Detached`] if an edit is needed while the document
/// is checked out.
pub fn reconcile(doc: &mut Document, buffer: &str) -> Result<bool, DocError> {
    let reconciliation = plan(buffer, &read_records(doc));
    tracing::trace!(
        edits = reconciliation.ops.len(),
        lines = buffer.matches(LINE_SEPARATOR).count() + 1,
        "Planned reconciliation"
    );
    apply(doc, &reconciliation)
}
