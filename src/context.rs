use tracing::trace;

use crate::batch::Batch;
use crate::engine::EngineContext;
use crate::error::{Error, Result};

/// An engine context together with its position counter.
///
/// The position counter is the number of tokens already in the KV cache. It only
/// grows through [`InferenceContext::decode`] and never exceeds the capacity;
/// a decode that would overflow fails with [`Error::ContextFull`] instead of
/// truncating anything.
pub struct InferenceContext<C> {
    inner: C,
    position: usize,
}

impl<C: EngineContext> InferenceContext<C> {
    pub fn new(inner: C) -> Self {
        Self { inner, position: 0 }
    }

    /// Number of tokens decoded so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Maximum number of tokens the context can hold.
    pub fn capacity(&self) -> usize {
        self.inner.n_ctx()
    }

    /// Maximum number of tokens per decode step.
    pub fn batch_capacity(&self) -> usize {
        self.inner.n_batch()
    }

    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.position)
    }

    pub fn is_full(&self) -> bool {
        self.position >= self.capacity()
    }

    /// Decode `batch`, which must continue exactly at the current position.
    pub fn decode(&mut self, batch: &Batch) -> Result<()> {
        let Some(start) = batch.start_position() else {
            return Err(Error::Decode("cannot decode an empty batch".into()));
        };
        if start != self.position {
            return Err(Error::Decode(format!(
                "batch starts at position {} but the context is at {}",
                start, self.position
            )));
        }
        if batch.len() > self.remaining() {
            return Err(Error::ContextFull {
                position: self.position + batch.len(),
                n_ctx: self.capacity(),
            });
        }

        self.inner.decode(batch)?;
        self.position += batch.len();
        trace!(
            n_tokens = batch.len(),
            position = self.position,
            "decoded batch"
        );
        Ok(())
    }

    /// Logits produced by the most recent decode.
    pub fn logits(&self) -> Result<&[f32]> {
        self.inner.logits()
    }

    /// Clear the position counter and cache contents, keeping the allocation.
    pub fn reset(&mut self) {
        self.inner.clear();
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextParams;
    use crate::engine::Engine;
    use crate::engine::scripted::ScriptedEngine;

    fn params(ctx_size: usize, batch_size: usize) -> ContextParams {
        ContextParams {
            ctx_size: Some(ctx_size),
            batch_size,
            ..Default::default()
        }
    }

    #[test]
    fn decode_advances_position() {
        let engine = ScriptedEngine::new();
        let mut ctx = InferenceContext::new(engine.new_context(&params(8, 4)).unwrap());
        let mut batch = Batch::new(4);

        batch.fill(&[1, 2, 3], 0, true).unwrap();
        ctx.decode(&batch).unwrap();
        assert_eq!(ctx.position(), 3);
        assert_eq!(ctx.remaining(), 5);
        assert!(ctx.logits().is_ok());
    }

    #[test]
    fn decode_rejects_gaps() {
        let engine = ScriptedEngine::new();
        let mut ctx = InferenceContext::new(engine.new_context(&params(8, 4)).unwrap());
        let mut batch = Batch::new(4);

        batch.fill(&[1], 3, true).unwrap();
        assert!(matches!(ctx.decode(&batch), Err(Error::Decode(_))));
        assert_eq!(ctx.position(), 0);
    }

    #[test]
    fn decode_rejects_empty_batch() {
        let engine = ScriptedEngine::new();
        let mut ctx = InferenceContext::new(engine.new_context(&params(8, 4)).unwrap());
        assert!(ctx.decode(&Batch::new(4)).is_err());
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let engine = ScriptedEngine::new();
        let mut ctx = InferenceContext::new(engine.new_context(&params(4, 4)).unwrap());
        let mut batch = Batch::new(4);

        batch.fill(&[1, 2, 3], 0, true).unwrap();
        ctx.decode(&batch).unwrap();

        batch.fill(&[4, 5], 3, true).unwrap();
        let err = ctx.decode(&batch).unwrap_err();
        assert!(matches!(
            err,
            Error::ContextFull {
                position: 5,
                n_ctx: 4
            }
        ));
        assert_eq!(ctx.position(), 3);

        batch.fill(&[4], 3, true).unwrap();
        ctx.decode(&batch).unwrap();
        assert!(ctx.is_full());
    }

    #[test]
    fn reset_allows_reuse() {
        let engine = ScriptedEngine::new();
        let mut ctx = InferenceContext::new(engine.new_context(&params(4, 4)).unwrap());
        let mut batch = Batch::new(4);

        batch.fill(&[1, 2, 3, 4], 0, true).unwrap();
        ctx.decode(&batch).unwrap();
        ctx.reset();

        assert_eq!(ctx.position(), 0);
        assert!(ctx.logits().is_err());
        ctx.decode(&batch).unwrap();
        assert_eq!(ctx.position(), 4);
    }
}
