//! An in-memory engine for tests.
//!
//! Tokenization is greedy longest-match over a small word list, with one
//! fallback token per byte so every input can be tokenized. The "model"
//! predicts whatever token was scripted for the position it just decoded, else
//! whatever was scripted to follow the token it just decoded, else EOS.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::batch::Batch;
use crate::chat::ChatMessage;
use crate::config::ContextParams;
use crate::engine::{Engine, EngineContext, TokenId};
use crate::error::{Error, Result};

pub(crate) const BOS: TokenId = 1;
pub(crate) const EOS: TokenId = 2;
/// Token id of the byte `0x00`; byte `b` has id `BYTE_BASE + b`.
pub(crate) const BYTE_BASE: TokenId = 3;
pub(crate) const N_VOCAB: usize = 32_000;

pub(crate) struct ScriptedEngine {
    pieces: HashMap<TokenId, Vec<u8>>,
    words: Vec<(Vec<u8>, TokenId)>,
    eog: HashSet<TokenId>,
    chat_template: bool,
    /// position of the last decoded token -> token the logits favour
    script: HashMap<usize, TokenId>,
    /// last decoded token -> token the logits favour, when no position matches
    follows: HashMap<TokenId, TokenId>,
    fail_at: Option<usize>,
    fail_context_create: bool,
    n_vocab: usize,
    decode_log: RefCell<Vec<usize>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        let mut engine = Self {
            pieces: HashMap::new(),
            words: Vec::new(),
            eog: HashSet::from([EOS]),
            chat_template: false,
            script: HashMap::new(),
            follows: HashMap::new(),
            fail_at: None,
            fail_context_create: false,
            n_vocab: N_VOCAB,
            decode_log: RefCell::new(Vec::new()),
        };
        engine.pieces.insert(BOS, Vec::new());
        engine.pieces.insert(EOS, Vec::new());
        for b in 0..=u8::MAX {
            engine.pieces.insert(BYTE_BASE + TokenId::from(b), vec![b]);
        }
        engine
            .with_word("Hello", 15339)
            .with_word(" world", 1917)
            .with_word(" there", 1070)
            .with_word("!", 0)
    }

    pub(crate) fn with_word(mut self, word: &str, id: TokenId) -> Self {
        self.pieces.insert(id, word.as_bytes().to_vec());
        self.words.push((word.as_bytes().to_vec(), id));
        self.words.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub(crate) fn with_chat_template(mut self) -> Self {
        self.chat_template = true;
        self
    }

    /// Extra end-of-generation token besides EOS.
    pub(crate) fn with_eog(mut self, token: TokenId) -> Self {
        self.eog.insert(token);
        self
    }

    /// After decoding position `position`, the logits favour `token`.
    pub(crate) fn predict(mut self, position: usize, token: TokenId) -> Self {
        self.script.insert(position, token);
        self
    }

    /// Script a reply: the first token is predicted after the last prompt
    /// token, each following one after the previous reply token.
    pub(crate) fn reply(mut self, prompt_len: usize, tokens: &[TokenId]) -> Self {
        for (i, &token) in tokens.iter().enumerate() {
            self.script.insert(prompt_len - 1 + i, token);
        }
        self
    }

    /// Whenever `prev` was the last decoded token, the logits favour `next`.
    pub(crate) fn follow(mut self, prev: TokenId, next: TokenId) -> Self {
        self.follows.insert(prev, next);
        self
    }

    /// Fail any decode that includes `position`.
    pub(crate) fn fail_decode_at(mut self, position: usize) -> Self {
        self.fail_at = Some(position);
        self
    }

    /// Refuse to allocate any context.
    pub(crate) fn fail_context_create(mut self) -> Self {
        self.fail_context_create = true;
        self
    }

    /// Report a vocabulary size that differs from the logits rows.
    pub(crate) fn with_n_vocab(mut self, n_vocab: usize) -> Self {
        self.n_vocab = n_vocab;
        self
    }

    /// Sizes of all batches decoded so far, across contexts.
    pub(crate) fn decode_log(&self) -> Vec<usize> {
        self.decode_log.borrow().clone()
    }

    pub(crate) fn byte_token(b: u8) -> TokenId {
        BYTE_BASE + TokenId::from(b)
    }
}

impl Engine for ScriptedEngine {
    type Context<'m> = ScriptedContext<'m>;

    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn n_ctx_train(&self) -> usize {
        4096
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        let mut rest = text.as_bytes();
        while !rest.is_empty() {
            match self.words.iter().find(|(w, _)| rest.starts_with(w)) {
                Some((word, id)) => {
                    tokens.push(*id);
                    rest = &rest[word.len()..];
                }
                None => {
                    tokens.push(Self::byte_token(rest[0]));
                    rest = &rest[1..];
                }
            }
        }
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>> {
        self.pieces
            .get(&token)
            .cloned()
            .ok_or_else(|| Error::Tokenization(format!("unknown token {}", token)))
    }

    fn token_bos(&self) -> TokenId {
        BOS
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.eog.contains(&token)
    }

    fn has_chat_template(&self) -> bool {
        self.chat_template
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        if !self.chat_template {
            return Err(Error::ChatTemplate("model has no chat template".into()));
        }
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str(&format!(
                "<|im_start|>{}\n{}<|im_end|>\n",
                message.role.as_str(),
                message.content
            ));
        }
        if add_assistant {
            prompt.push_str("<|im_start|>assistant\n");
        }
        Ok(prompt)
    }

    fn new_context(&self, params: &ContextParams) -> Result<ScriptedContext<'_>> {
        if self.fail_context_create {
            return Err(Error::ContextCreate("out of memory".into()));
        }
        let n_ctx = params.ctx_size.unwrap_or(self.n_ctx_train());
        if n_ctx == 0 {
            return Err(Error::ContextCreate("n_ctx must be positive".into()));
        }
        Ok(ScriptedContext {
            engine: self,
            n_ctx,
            n_batch: params.batch_size,
            cache: Vec::new(),
            logits: None,
        })
    }
}

pub(crate) struct ScriptedContext<'m> {
    engine: &'m ScriptedEngine,
    n_ctx: usize,
    n_batch: usize,
    cache: Vec<TokenId>,
    logits: Option<Vec<f32>>,
}

impl EngineContext for ScriptedContext<'_> {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        if batch.len() > self.n_batch {
            return Err(Error::Decode("batch larger than n_batch".into()));
        }
        if self.cache.len() + batch.len() > self.n_ctx {
            return Err(Error::Decode("KV cache is full".into()));
        }
        if let Some(fail_at) = self.engine.fail_at {
            if batch.entries().iter().any(|e| e.position == fail_at) {
                return Err(Error::Decode(format!("injected failure at {}", fail_at)));
            }
        }

        for entry in batch.entries() {
            if entry.position != self.cache.len() {
                return Err(Error::Decode(format!(
                    "non-contiguous position {} (cache holds {})",
                    entry.position,
                    self.cache.len()
                )));
            }
            self.cache.push(entry.token);
        }
        self.engine.decode_log.borrow_mut().push(batch.len());

        self.logits = batch.output_index().map(|i| {
            let entry = batch.entries()[i];
            let next = self
                .engine
                .script
                .get(&entry.position)
                .or_else(|| self.engine.follows.get(&entry.token))
                .copied()
                .unwrap_or(EOS);
            let mut row = vec![0.0; N_VOCAB];
            row[next as usize] = 10.0;
            row
        });
        Ok(())
    }

    fn logits(&self) -> Result<&[f32]> {
        self.logits
            .as_deref()
            .ok_or_else(|| Error::Decode("no logits available".into()))
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.logits = None;
    }
}
