//! Text <-> token glue on top of an [`Engine`]'s vocabulary.

use encoding_rs::{Decoder, UTF_8};

use crate::engine::{Engine, TokenId};
use crate::error::{Error, Result};

/// Tokenize a prompt, rejecting input that yields no tokens.
pub fn tokenize_prompt<E: Engine + ?Sized>(
    engine: &E,
    text: &str,
    add_bos: bool,
) -> Result<Vec<TokenId>> {
    if text.is_empty() {
        return Err(Error::Tokenization("empty prompt".into()));
    }
    let tokens = engine
        .tokenize(text, add_bos)
        .map_err(|e| Error::Tokenization(format!("failed to tokenize prompt: {}", e)))?;

    let has_content = tokens.iter().any(|&t| !(add_bos && t == engine.token_bos()));
    if !has_content {
        return Err(Error::Tokenization(format!(
            "prompt {:?} produced no tokens",
            text
        )));
    }
    Ok(tokens)
}

/// Convert a whole token sequence back to text.
///
/// Invalid or incomplete UTF-8 is replaced with U+FFFD.
pub fn detokenize<E: Engine + ?Sized>(engine: &E, tokens: &[TokenId]) -> Result<String> {
    let mut bytes = Vec::new();
    for &token in tokens {
        bytes.extend(engine.token_to_bytes(token)?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Incremental UTF-8 decoding of token bytes.
///
/// A token may end in the middle of a multi-byte character. Those trailing bytes
/// stay buffered until the following tokens complete them, so every string
/// returned by [`Detokenizer::push`] consists of whole characters only.
pub struct Detokenizer {
    decoder: Decoder,
}

impl Detokenizer {
    pub fn new() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Feed the bytes of one token, returning the characters they complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 4);
        let mut text = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(bytes, &mut text, false);
        text
    }

    /// Drop any buffered partial character.
    pub fn reset(&mut self) {
        self.decoder = UTF_8.new_decoder_without_bom_handling();
    }
}

impl Default for Detokenizer {
    fn default() -> Self {
        Self::new()
    }
}
