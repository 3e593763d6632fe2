//! Version history for scrubbing through past states.
//!
//! Every committed change that is not itself a checkout appends the
//! document frontier observed right after it. Index `-1` denotes genesis,
//! `len - 1` the live head.

use linesync_core::{DocError, Document, Frontier};

/// Where the document currently stands in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    /// Empty genesis state (read-only)
    Genesis,
    /// A past version (read-only)
    Historical(usize),
    /// The live head; the only position accepting edits
    #[default]
    Live,
}

impl Position {
    /// Whether local edits may be committed.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Position::Live)
    }
}

/// Append-only sequence of frontiers with a current position.
#[derive(Debug, Clone, Default)]
pub struct VersionHistory {
    frontiers: Vec<Frontier>,
    position: Position,
}

impl VersionHistory {
    /// Create an empty history positioned at the live head.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from previously recorded frontiers.
    #[must_use]
    pub fn from_frontiers(frontiers: Vec<Frontier>) -> Self {
        Self {
            frontiers,
            position: Position::Live,
        }
    }

    /// Record the frontier of a committed change.
    ///
    /// Checkouts are ignored. Returns `true` if an entry was appended.
    pub fn record_on_commit(&mut self, frontier: &Frontier, is_checkout: bool) -> bool {
        if is_checkout {
            return false;
        }
        self.frontiers.push(frontier.clone());
        tracing::trace!(len = self.frontiers.len(), "Recorded version");
        true
    }

    /// Move the document to the version at `index`.
    ///
    /// `-1` checks out genesis, `len - 1` returns to the live head and any
    /// other index checks out that past version read-only.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::IndexOutOfRange`] for an index outside
    /// `[-1, len - 1]`, leaving the document untouched.
    pub fn checkout(&mut self, doc: &mut Document, index: i64) -> Result<Position, HistoryError> {
        let len = self.frontiers.len();
        let head = self.current_head();
        if index < -1 || index > head {
            return Err(HistoryError::IndexOutOfRange { index, len });
        }

        // With no history, -1 is also the live head.
        let position = if index == head {
            doc.checkout_to_latest();
            Position::Live
        } else if index == -1 {
            doc.checkout_to_genesis();
            Position::Genesis
        } else {
            let slot = usize::try_from(index)
                .map_err(|_| HistoryError::IndexOutOfRange { index, len })?;
            doc.checkout(&self.frontiers[slot])?;
            Position::Historical(slot)
        };

        tracing::debug!(index, len, ?position, "Checked out history entry");
        self.position = position;
        Ok(position)
    }

    /// Mark the live head as current without touching the document.
    pub fn reset_to_live(&mut self) {
        self.position = Position::Live;
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Current index in `[-1, len - 1]`.
    #[must_use]
    pub fn current_index(&self) -> i64 {
        match self.position {
            Position::Genesis => -1,
            Position::Historical(slot) => i64::try_from(slot).unwrap_or(i64::MAX),
            Position::Live => self.current_head(),
        }
    }

    /// Index of the live head (`len - 1`, `-1` when empty).
    #[must_use]
    pub fn current_head(&self) -> i64 {
        i64::try_from(self.frontiers.len()).unwrap_or(i64::MAX) - 1
    }

    /// Selectable index range `(-1, len - 1)`.
    #[must_use]
    pub fn range(&self) -> (i64, i64) {
        (-1, self.current_head())
    }

    /// Number of recorded versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frontiers.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frontiers.is_empty()
    }

    /// Recorded frontiers, oldest first.
    #[must_use]
    pub fn frontiers(&self) -> &[Frontier] {
        &self.frontiers
    }
}

/// Errors for history navigation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// Requested index outside `[-1, len - 1]`
    #[error("version index {index} out of range for history of length {len}")]
    IndexOutOfRange {
        /// Requested index
        index: i64,
        /// History length
        len: usize,
    },
    /// The document rejected the checkout
    #[error("checkout failed: {0}")]
    Checkout(#[from] DocError),
}
