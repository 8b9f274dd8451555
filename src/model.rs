use std::ffi::CString;
use std::num::NonZeroU32;
use std::pin::pin;
use std::sync::Arc;

use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::params::kv_overrides::ParamOverrideValue;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use tracing::{debug, info};

use crate::backend::backend;
use crate::batch::Batch;
use crate::chat::{ChatMessage, ChatSession, ChatTemplateFormat};
use crate::config::{ContextParams, ModelParams, OverrideValue};
use crate::engine::{Engine, EngineContext, TokenId};
use crate::error::{Error, Result};
use crate::sampler::SamplerParams;
use crate::session::Session;

/// Offload everything unless told otherwise
const ALL_GPU_LAYERS: u32 = 1000;

/// A loaded llama.cpp model.
///
/// Read-only once loaded; any number of sessions can be created from it, each
/// with its own context.
pub struct Model {
    pub(crate) model: LlamaModel,
    // dropped after the model
    backend: Arc<LlamaBackend>,
}

impl Model {
    /// Load a model with the given parameters
    pub fn load(params: &ModelParams) -> Result<Self> {
        if !params.model_path.is_file() {
            return Err(Error::ModelLoad(format!(
                "{} is not a readable file",
                params.model_path.display()
            )));
        }
        let backend = backend()?;

        // Create model parameters
        let model_params = {
            #[cfg(any(feature = "cuda", feature = "vulkan", feature = "metal"))]
            let model_params = if !params.disable_gpu {
                LlamaModelParams::default()
                    .with_n_gpu_layers(params.gpu_layers.unwrap_or(ALL_GPU_LAYERS))
            } else {
                LlamaModelParams::default().with_n_gpu_layers(0)
            };
            #[cfg(not(any(feature = "cuda", feature = "vulkan", feature = "metal")))]
            let model_params = LlamaModelParams::default();
            model_params
        };

        let mut model_params = pin!(model_params);

        // Apply key-value overrides
        for (k, v) in params.parsed_overrides()? {
            let k = CString::new(k.as_bytes())
                .map_err(|e| Error::Parse(format!("invalid key {}: {}", k, e)))?;
            model_params
                .as_mut()
                .append_kv_override(k.as_c_str(), param_override(v));
        }

        let model = LlamaModel::load_from_file(&backend, &params.model_path, &model_params)
            .map_err(|e| Error::ModelLoad(format!("unable to load model: {}", e)))?;

        info!(
            path = %params.model_path.display(),
            n_vocab = model.n_vocab(),
            n_ctx_train = model.n_ctx_train(),
            "loaded model"
        );

        Ok(Self { model, backend })
    }

    /// Create a new generation session with its own context
    pub fn create_session(
        &self,
        context_params: &ContextParams,
        sampler_params: SamplerParams,
    ) -> Result<Session<'_, Model>> {
        Session::new(self, context_params, sampler_params)
    }

    /// Create a new chat session with this model
    pub fn create_chat_session(
        &self,
        context_params: &ContextParams,
        sampler_params: SamplerParams,
    ) -> Result<ChatSession<'_, Model>> {
        Ok(ChatSession::new(
            self.create_session(context_params, sampler_params)?,
        ))
    }

    /// Create a new chat session with a custom template
    pub fn create_chat_session_with_template(
        &self,
        template: ChatTemplateFormat,
        context_params: &ContextParams,
        sampler_params: SamplerParams,
    ) -> Result<ChatSession<'_, Model>> {
        let session = self
            .create_session(context_params, sampler_params)?
            .with_template(template);
        Ok(ChatSession::new(session))
    }

    /// Create a new chat session with a system message
    pub fn create_chat_session_with_system(
        &self,
        system_message: &str,
        context_params: &ContextParams,
        sampler_params: SamplerParams,
    ) -> Result<ChatSession<'_, Model>> {
        let mut session = self.create_chat_session(context_params, sampler_params)?;
        session.add_system_message(system_message);
        Ok(session)
    }

    /// Generate a chat response for a single user message
    /// This is a convenience method that creates a new session, formats the
    /// message with the chat template and generates until the end
    pub fn chat_completion(
        &self,
        user_message: &str,
        context_params: &ContextParams,
        sampler_params: SamplerParams,
    ) -> Result<String> {
        self.create_session(context_params, sampler_params)?
            .respond(user_message, true)
    }

    /// Generate text from a prompt using a one-time session
    pub fn text_completion(
        &self,
        prompt: &str,
        context_params: &ContextParams,
        sampler_params: SamplerParams,
    ) -> Result<String> {
        self.create_session(context_params, sampler_params)?
            .respond(prompt, false)
    }
}

impl Engine for Model {
    type Context<'m> = ModelContext<'m>;

    fn n_vocab(&self) -> usize {
        self.model.n_vocab() as usize
    }

    fn n_ctx_train(&self) -> usize {
        self.model.n_ctx_train() as usize
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let add_bos = if add_bos {
            AddBos::Always
        } else {
            AddBos::Never
        };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| Error::Tokenization(format!("failed to tokenize {text:?}: {}", e)))
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| Error::Tokenization(format!("token {}: {}", token, e)))
    }

    fn token_bos(&self) -> TokenId {
        self.model.token_bos().0
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn has_chat_template(&self) -> bool {
        self.model.chat_template(None).is_ok()
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        let template = self
            .model
            .chat_template(None)
            .map_err(|e| Error::ChatTemplate(format!("model has no chat template: {}", e)))?;
        let chat = messages
            .iter()
            .map(|message| {
                LlamaChatMessage::new(message.role.as_str().to_string(), message.content.clone())
                    .map_err(|e| Error::ChatTemplate(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.model
            .apply_chat_template(&template, &chat, add_assistant)
            .map_err(|e| Error::ChatTemplate(e.to_string()))
    }

    fn new_context(&self, params: &ContextParams) -> Result<ModelContext<'_>> {
        let batch_size = u32::try_from(params.batch_size)
            .map_err(|_| Error::Config(format!("batch_size {} is too large", params.batch_size)))?;

        // Initialize the context
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(
                params
                    .ctx_size
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(NonZeroU32::new),
            )
            .with_n_batch(batch_size);

        if let Some(threads) = params.threads {
            ctx_params = ctx_params.with_n_threads(threads as i32);
        }
        if let Some(threads_batch) = params.threads_batch.or(params.threads) {
            ctx_params = ctx_params.with_n_threads_batch(threads_batch as i32);
        }

        let ctx = self.model.new_context(&self.backend, ctx_params).map_err(|e| {
            Error::ContextCreate(format!("unable to create the llama_context: {}", e))
        })?;
        debug!(n_ctx = ctx.n_ctx(), n_batch = ctx.n_batch(), "created llama_context");

        let batch = LlamaBatch::new(ctx.n_batch() as usize, 1);
        Ok(ModelContext {
            ctx,
            batch,
            logits_index: None,
        })
    }
}

/// A llama.cpp context together with the batch it decodes from.
pub struct ModelContext<'m> {
    ctx: LlamaContext<'m>,
    batch: LlamaBatch,
    logits_index: Option<i32>,
}

impl EngineContext for ModelContext<'_> {
    fn n_ctx(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn n_batch(&self) -> usize {
        self.ctx.n_batch() as usize
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        self.logits_index = None;
        self.batch.clear();
        for entry in batch.entries() {
            let position = i32::try_from(entry.position)
                .map_err(|_| Error::Decode(format!("position {} out of range", entry.position)))?;
            self.batch
                .add(
                    LlamaToken::new(entry.token),
                    position,
                    &[entry.seq_id],
                    entry.output,
                )
                .map_err(|e| Error::Decode(format!("failed to fill llama_batch: {}", e)))?;
        }

        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| Error::Decode(e.to_string()))?;

        self.logits_index = batch.output_index().map(|i| i as i32);
        Ok(())
    }

    fn logits(&self) -> Result<&[f32]> {
        match self.logits_index {
            Some(i) => Ok(self.ctx.get_logits_ith(i)),
            None => Err(Error::Decode(
                "no logits available, the last decode had no output token".into(),
            )),
        }
    }

    fn clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.batch.clear();
        self.logits_index = None;
    }
}

fn param_override(value: OverrideValue) -> ParamOverrideValue {
    match value {
        OverrideValue::Int(v) => ParamOverrideValue::Int(v),
        OverrideValue::Float(v) => ParamOverrideValue::Float(v),
        OverrideValue::Bool(v) => ParamOverrideValue::Bool(v),
    }
}
