use crate::engine::TokenId;
use crate::error::{Error, Result};

/// The only sequence a session ever decodes into.
pub const DEFAULT_SEQ_ID: i32 = 0;

/// One token submitted to a decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    /// Position of the token within its sequence
    pub position: usize,
    pub seq_id: i32,
    /// Whether the engine should keep logits for this entry
    pub output: bool,
}

/// A reusable, fixed-capacity buffer of tokens for one decode step.
///
/// The buffer never grows past its capacity; callers split longer inputs into
/// several decode steps themselves.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append a single token of the default sequence.
    pub fn add(&mut self, token: TokenId, position: usize, output: bool) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(Error::BatchCapacity {
                requested: self.entries.len() + 1,
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            position,
            seq_id: DEFAULT_SEQ_ID,
            output,
        });
        Ok(())
    }

    /// Replace the contents with `tokens` at consecutive positions starting at
    /// `start_position`.
    ///
    /// If `output_last` is set, logits are requested for the last token only.
    /// The batch is left untouched when `tokens` does not fit.
    pub fn fill(
        &mut self,
        tokens: &[TokenId],
        start_position: usize,
        output_last: bool,
    ) -> Result<()> {
        if tokens.len() > self.capacity {
            return Err(Error::BatchCapacity {
                requested: tokens.len(),
                capacity: self.capacity,
            });
        }

        self.entries.clear();
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            self.entries.push(BatchEntry {
                token,
                position: start_position + i,
                seq_id: DEFAULT_SEQ_ID,
                output: output_last && i == last,
            });
        }
        Ok(())
    }

    /// Index of the last entry flagged as an output.
    pub fn output_index(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.output)
    }

    /// Position of the first entry.
    pub fn start_position(&self) -> Option<usize> {
        self.entries.first().map(|e| e.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_assigns_consecutive_positions() {
        let mut batch = Batch::new(8);
        batch.fill(&[10, 11, 12], 5, true).unwrap();

        let positions: Vec<_> = batch.entries().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![5, 6, 7]);
        assert_eq!(batch.output_index(), Some(2));
        assert_eq!(batch.start_position(), Some(5));
        assert!(batch.entries().iter().all(|e| e.seq_id == DEFAULT_SEQ_ID));
    }

    #[test]
    fn fill_without_output() {
        let mut batch = Batch::new(4);
        batch.fill(&[1, 2], 0, false).unwrap();
        assert_eq!(batch.output_index(), None);
    }

    #[test]
    fn fill_rejects_overflow_and_keeps_contents() {
        let mut batch = Batch::new(2);
        batch.fill(&[7], 0, true).unwrap();

        let err = batch.fill(&[1, 2, 3], 0, true).unwrap_err();
        assert!(matches!(
            err,
            Error::BatchCapacity {
                requested: 3,
                capacity: 2
            }
        ));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries()[0].token, 7);
    }

    #[test]
    fn fill_replaces_previous_contents() {
        let mut batch = Batch::new(4);
        batch.fill(&[1, 2, 3, 4], 0, true).unwrap();
        batch.fill(&[9], 4, true).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries()[0].position, 4);
    }

    #[test]
    fn add_respects_capacity() {
        let mut batch = Batch::new(1);
        batch.add(3, 0, true).unwrap();
        assert!(batch.add(4, 1, true).is_err());
        batch.clear();
        assert!(batch.is_empty());
        batch.add(4, 1, true).unwrap();
        assert_eq!(batch.capacity(), 1);
    }
}
