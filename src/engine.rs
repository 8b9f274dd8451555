//! The seam between the generation session and the inference engine.
//!
//! [`Engine`] is a loaded model together with its vocabulary; it is read-only once
//! loaded and can hand out any number of [`EngineContext`]s. A context holds the
//! working state (the KV cache) of exactly one session.
//!
//! The llama.cpp implementation is [`crate::Model`].

use crate::batch::Batch;
use crate::chat::ChatMessage;
use crate::config::ContextParams;
use crate::error::Result;

#[cfg(test)]
pub(crate) mod scripted;

/// A token id in the model's vocabulary (`0 <= id < n_vocab`).
pub type TokenId = i32;

/// A loaded model and its vocabulary.
pub trait Engine {
    /// The per-session working state created from this model.
    type Context<'m>: EngineContext
    where
        Self: 'm;

    /// Number of tokens in the vocabulary; also the length of a logits row.
    fn n_vocab(&self) -> usize;

    /// Context length the model was trained with.
    fn n_ctx_train(&self) -> usize;

    /// Convert text into tokens, optionally prefixed with the BOS token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    /// The raw bytes of a single token. These need not be valid UTF-8 on their own.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>>;

    fn token_bos(&self) -> TokenId;

    /// Whether `token` ends generation (EOS, EOT and similar).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Whether the model ships a chat template of its own.
    fn has_chat_template(&self) -> bool;

    /// Render `messages` with the model's own chat template.
    ///
    /// Fails with [`crate::Error::ChatTemplate`] if the model has none.
    fn apply_chat_template(&self, messages: &[ChatMessage], add_assistant: bool)
    -> Result<String>;

    /// Allocate a new context (KV cache) for this model.
    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>>;
}

/// Working state for one generation session.
pub trait EngineContext {
    /// Token capacity of the KV cache.
    fn n_ctx(&self) -> usize;

    /// Maximum number of tokens accepted by a single [`EngineContext::decode`].
    fn n_batch(&self) -> usize;

    /// Run one forward pass over `batch`, appending it to the KV cache.
    ///
    /// Logits are only kept for entries flagged as outputs.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits for the last output entry of the most recent decode.
    fn logits(&self) -> Result<&[f32]>;

    /// Drop the KV cache contents without releasing its memory.
    fn clear(&mut self);
}
