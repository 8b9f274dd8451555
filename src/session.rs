use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::batch::Batch;
use crate::chat::{ChatMessage, ChatTemplateFormat};
use crate::config::ContextParams;
use crate::context::InferenceContext;
use crate::engine::{Engine, TokenId};
use crate::error::{Error, Result};
use crate::sampler::{Sampler, SamplerParams};
use crate::tokenizer::{Detokenizer, tokenize_prompt};

/// Lifecycle of a [`Session`].
///
/// `Idle -> Prompting -> Generating -> Done`; `Errored` is absorbing until
/// [`Session::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Prompting,
    Generating,
    Done,
    Errored,
}

/// Input to [`Session::initialize`].
#[derive(Debug, Clone, Copy)]
pub enum Prompt<'a> {
    /// Raw text, or a single user message when a template is used
    Text(&'a str),
    /// A conversation
    Messages(&'a [ChatMessage]),
}

impl<'a> From<&'a str> for Prompt<'a> {
    fn from(text: &'a str) -> Self {
        Prompt::Text(text)
    }
}

impl<'a> From<&'a String> for Prompt<'a> {
    fn from(text: &'a String) -> Self {
        Prompt::Text(text)
    }
}

impl<'a> From<&'a [ChatMessage]> for Prompt<'a> {
    fn from(messages: &'a [ChatMessage]) -> Self {
        Prompt::Messages(messages)
    }
}

impl<'a> From<&'a Vec<ChatMessage>> for Prompt<'a> {
    fn from(messages: &'a Vec<ChatMessage>) -> Self {
        Prompt::Messages(messages)
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The model produced an end-of-generation token
    EndOfSequence,
    /// The context has no room for another token
    ContextFull,
    /// The configured `max_tokens` were generated
    MaxTokens,
}

/// Result of one [`Session::next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Newly completed text. Empty when the token ended inside a multi-byte
    /// character that later tokens will complete.
    Text(String),
    /// Generation is over; no text was produced by this step.
    End(StopReason),
}

/// Token counts and timings of the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prompt_time: Duration,
    pub generation_time: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f32 {
        let secs = self.generation_time.as_secs_f32();
        if secs > 0.0 {
            self.generated_tokens as f32 / secs
        } else {
            0.0
        }
    }
}

/// An incremental generation session.
///
/// The session exclusively owns its context, batch buffer and sampler; only the
/// model is shared. It is driven by the caller one step at a time:
///
/// ```no_run
/// # use llama_session::{Model, ModelParams, ContextParams, SamplerParams, Step};
/// # fn main() -> llama_session::Result<()> {
/// let model = Model::load(&ModelParams::from_path("model.gguf"))?;
/// let mut session = model.create_session(&ContextParams::default(), SamplerParams::default())?;
///
/// session.initialize("Once upon a time", false)?;
/// while let Step::Text(text) = session.next()? {
///     print!("{}", text);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Session<'m, E: Engine + 'm> {
    model: &'m E,
    ctx: InferenceContext<E::Context<'m>>,
    batch: Batch,
    sampler: Sampler,
    detokenizer: Detokenizer,
    template: ChatTemplateFormat,
    max_tokens: Option<usize>,
    state: SessionState,
    stop_reason: Option<StopReason>,
    stats: GenerationStats,
    generation_start: Option<Instant>,
}

impl<'m, E: Engine + 'm> Session<'m, E> {
    /// Create a session with its own context on `model`.
    pub fn new(model: &'m E, params: &ContextParams, sampler: SamplerParams) -> Result<Self> {
        params.validate()?;
        let ctx = InferenceContext::new(model.new_context(params)?);
        let batch_capacity = params.batch_size.min(ctx.batch_capacity());

        info!(
            n_ctx = ctx.capacity(),
            n_batch = batch_capacity,
            greedy = sampler.is_greedy(),
            "created session"
        );

        Ok(Self {
            model,
            ctx,
            batch: Batch::new(batch_capacity),
            sampler: Sampler::new(sampler),
            detokenizer: Detokenizer::new(),
            template: ChatTemplateFormat::default(),
            max_tokens: params.max_tokens,
            state: SessionState::Idle,
            stop_reason: None,
            stats: GenerationStats::default(),
            generation_start: None,
        })
    }

    /// Use `template` when a prompt is rendered as a conversation.
    pub fn with_template(mut self, template: ChatTemplateFormat) -> Self {
        self.template = template;
        self
    }

    pub fn model(&self) -> &'m E {
        self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == SessionState::Done
    }

    /// Why the last generation ended, once the session is `Done`.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Number of tokens in the context.
    pub fn position(&self) -> usize {
        self.ctx.position()
    }

    /// Token capacity of the context.
    pub fn capacity(&self) -> usize {
        self.ctx.capacity()
    }

    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Render a prompt into the text that will be tokenized.
    pub fn render_prompt<'p>(&self, prompt: impl Into<Prompt<'p>>, use_template: bool) -> Result<String> {
        match (prompt.into(), use_template) {
            (Prompt::Text(text), false) => Ok(text.to_string()),
            (Prompt::Text(text), true) => {
                self.template
                    .render(self.model, &[ChatMessage::user(text)], true)
            }
            (Prompt::Messages(messages), true) => self.template.render(self.model, messages, true),
            (Prompt::Messages(messages), false) => Ok(messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }

    /// Load a prompt into a fresh context and get ready to generate.
    ///
    /// Allowed from `Idle`, `Generating` (abandoning the current generation)
    /// and `Done`. Rendering or tokenization errors leave the session as it
    /// was; a prompt that does not fit or a failing decode move it to
    /// `Errored`.
    pub fn initialize<'p>(&mut self, prompt: impl Into<Prompt<'p>>, use_template: bool) -> Result<()> {
        if matches!(self.state, SessionState::Errored | SessionState::Prompting) {
            return Err(self.violation("initialize"));
        }

        let text = self.render_prompt(prompt, use_template)?;
        debug!("Prompt: {}", text);

        let tokens = tokenize_prompt(self.model, &text, true)?;
        let n_ctx = self.ctx.capacity();
        info!(
            n_prompt = tokens.len(),
            n_ctx,
            n_batch = self.batch.capacity(),
            "initializing session"
        );

        if tokens.len() > n_ctx {
            self.state = SessionState::Errored;
            return Err(Error::PromptTooLong {
                n_prompt: tokens.len(),
                n_ctx,
            });
        }

        self.clear();
        self.state = SessionState::Prompting;
        let start = Instant::now();

        if let Err(e) = self.decode_prompt(&tokens) {
            self.state = SessionState::Errored;
            return Err(e);
        }

        self.stats.prompt_tokens = tokens.len();
        self.stats.prompt_time = start.elapsed();
        self.generation_start = Some(Instant::now());
        self.state = SessionState::Generating;
        debug!(
            "prompt decoded in {:.2} s",
            self.stats.prompt_time.as_secs_f32()
        );
        Ok(())
    }

    fn decode_prompt(&mut self, tokens: &[TokenId]) -> Result<()> {
        let n_chunks = tokens.len().div_ceil(self.batch.capacity());
        for (i, chunk) in tokens.chunks(self.batch.capacity()).enumerate() {
            let is_last = i + 1 == n_chunks;
            self.batch.fill(chunk, self.ctx.position(), is_last)?;
            self.ctx.decode(&self.batch).map_err(|e| match e {
                Error::Decode(msg) => Error::Decode(format!("llama_decode() failed: {}", msg)),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Generate the next piece of text.
    ///
    /// Only valid while `Generating`; any other state yields
    /// [`Error::ProtocolViolation`]. An end-of-generation token takes precedence
    /// over a full context, which takes precedence over `max_tokens`.
    pub fn next(&mut self) -> Result<Step> {
        if self.state != SessionState::Generating {
            return Err(self.violation("next"));
        }

        match self.step() {
            Ok(step) => Ok(step),
            Err(e) => {
                warn!("generation failed: {}", e);
                self.state = SessionState::Errored;
                Err(e)
            }
        }
    }

    fn step(&mut self) -> Result<Step> {
        let logits = self.ctx.logits()?;
        let n_vocab = self.model.n_vocab();
        if logits.len() != n_vocab {
            return Err(Error::Sampling(format!(
                "logits row has {} entries, vocabulary has {}",
                logits.len(),
                n_vocab
            )));
        }
        let token = self.sampler.sample(logits)?;

        if self.model.is_eog(token) {
            trace!("End of generation token detected: {token}");
            return Ok(self.finish(StopReason::EndOfSequence));
        }
        if self.ctx.is_full() {
            return Ok(self.finish(StopReason::ContextFull));
        }
        if self
            .max_tokens
            .is_some_and(|max| self.stats.generated_tokens >= max)
        {
            return Ok(self.finish(StopReason::MaxTokens));
        }

        self.sampler.accept(token);
        let bytes = self.model.token_to_bytes(token).map_err(|e| {
            Error::Tokenization(format!("Failed to convert token to bytes: {}", e))
        })?;
        let text = self.detokenizer.push(&bytes);
        trace!(name: "token-gen", "Generated token: {}", text);

        self.batch.clear();
        self.batch.add(token, self.ctx.position(), true)?;
        self.ctx.decode(&self.batch)?;
        self.stats.generated_tokens += 1;

        Ok(Step::Text(text))
    }

    fn finish(&mut self, reason: StopReason) -> Step {
        self.state = SessionState::Done;
        self.stop_reason = Some(reason);
        self.detokenizer.reset();
        if let Some(start) = self.generation_start.take() {
            self.stats.generation_time = start.elapsed();
        }

        info!(
            "decoded {} tokens in {:.2} s, speed {:.2} t/s ({:?})",
            self.stats.generated_tokens,
            self.stats.generation_time.as_secs_f32(),
            self.stats.tokens_per_second(),
            reason
        );
        Step::End(reason)
    }

    /// Generate a complete response to `prompt`.
    ///
    /// Equivalent to [`Session::initialize`] followed by [`Session::next`] until
    /// the end, concatenating the text. On failure the partial text is dropped
    /// and only the error is returned.
    pub fn respond<'p>(&mut self, prompt: impl Into<Prompt<'p>>, use_template: bool) -> Result<String> {
        self.initialize(prompt, use_template)?;
        let mut output = String::new();
        for text in self.stream() {
            output.push_str(&text?);
        }
        Ok(output)
    }

    /// Iterate over the remaining text of the current generation.
    pub fn stream(&mut self) -> Stream<'_, 'm, E> {
        Stream { session: self }
    }

    /// Return to `Idle` from any state, clearing the context and sampler.
    pub fn reset(&mut self) {
        self.clear();
        self.state = SessionState::Idle;
        debug!("session reset");
    }

    fn clear(&mut self) {
        self.ctx.reset();
        self.sampler.reset();
        self.detokenizer.reset();
        self.batch.clear();
        self.stop_reason = None;
        self.stats = GenerationStats::default();
        self.generation_start = None;
    }

    fn violation(&self, operation: &'static str) -> Error {
        Error::ProtocolViolation {
            state: self.state,
            operation,
        }
    }
}

/// Iterator over the text pieces of a generation, see [`Session::stream`].
///
/// Ends after the stop condition or after the first error.
pub struct Stream<'s, 'm, E: Engine + 'm> {
    session: &'s mut Session<'m, E>,
}

impl<'m, E: Engine + 'm> Iterator for Stream<'_, 'm, E> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.session.state() != SessionState::Generating {
            return None;
        }
        match self.session.next() {
            Ok(Step::Text(text)) => Some(Ok(text)),
            Ok(Step::End(_)) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
