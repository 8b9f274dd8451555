//! Pull-based, token-by-token chat completions on a local LLM.
//!
//! A [`Session`] turns a prompt (raw text or a conversation rendered through a
//! chat template) into a tokenized context, decodes it in batch-sized chunks and
//! then yields the completion one piece of text at a time:
//!
//! ```text
//! Idle --initialize--> Prompting --> Generating --next()...--> Done
//!                                         \--error--> Errored
//! ```
//!
//! Loading a model and opening sessions on it are separate steps, so one
//! [`Model`] can serve several sessions. The session logic only depends on the
//! [`Engine`]/[`EngineContext`] traits; [`Model`] implements them with
//! llama.cpp (cargo feature `llama`, on by default).
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

#[cfg(feature = "llama")]
pub mod backend;
pub mod batch;
pub mod chat;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
#[cfg(feature = "llama")]
mod model;
pub mod sampler;
pub mod session;
pub mod tokenizer;

pub use batch::{Batch, BatchEntry};
pub use chat::{
    ChatMessage, ChatRole, ChatSession, ChatTemplateFormat, ROLE_ASSISTANT, ROLE_SYSTEM,
    ROLE_USER,
};
pub use config::{ContextParams, ModelParams, SessionConfig};
pub use context::InferenceContext;
pub use engine::{Engine, EngineContext, TokenId};
pub use error::{Error, Result};
#[cfg(feature = "llama")]
pub use model::{Model, ModelContext};
pub use sampler::{Sampler, SamplerParams};
pub use session::{GenerationStats, Prompt, Session, SessionState, Step, StopReason, Stream};
pub use tokenizer::Detokenizer;
