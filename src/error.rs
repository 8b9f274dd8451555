use std::fmt;
use std::io;

use crate::session::SessionState;

/// Custom error type for llama-session
#[derive(Debug)]
pub enum Error {
    /// Error initializing the LLM backend
    BackendInit(String),
    /// Bad path, unreadable file, unsupported format or allocation failure while loading a model
    ModelLoad(String),
    /// The attention cache for a context could not be allocated
    ContextCreate(String),
    /// Input produced no valid tokens
    Tokenization(String),
    /// The tokenized prompt does not fit into the context
    PromptTooLong { n_prompt: usize, n_ctx: usize },
    /// Engine-level failure during a decode call
    Decode(String),
    /// More tokens were submitted to a batch than it can hold
    BatchCapacity { requested: usize, capacity: usize },
    /// A decode would move the position counter past the context capacity
    ContextFull { position: usize, n_ctx: usize },
    /// An operation was called in a state that does not allow it
    ProtocolViolation {
        state: SessionState,
        operation: &'static str,
    },
    /// The sampler could not pick a token
    Sampling(String),
    /// Error with chat template
    ChatTemplate(String),
    /// Error parsing parameters
    Parse(String),
    /// Invalid configuration
    Config(String),
    /// IO error
    Io(io::Error),
}

impl Error {
    /// Whether the error originates in the inference engine rather than in the caller.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            Error::BackendInit(_)
                | Error::ModelLoad(_)
                | Error::ContextCreate(_)
                | Error::Decode(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendInit(msg) => write!(f, "Backend initialization error: {}", msg),
            Error::ModelLoad(msg) => write!(f, "Model loading error: {}", msg),
            Error::ContextCreate(msg) => write!(f, "Context creation error: {}", msg),
            Error::Tokenization(msg) => write!(f, "Tokenization error: {}", msg),
            Error::PromptTooLong { n_prompt, n_ctx } => write!(
                f,
                "Prompt too long: {} tokens do not fit into a context of {} tokens",
                n_prompt, n_ctx
            ),
            Error::Decode(msg) => write!(f, "Decoding error: {}", msg),
            Error::BatchCapacity {
                requested,
                capacity,
            } => write!(
                f,
                "Batch capacity exceeded: {} tokens requested, capacity is {}",
                requested, capacity
            ),
            Error::ContextFull { position, n_ctx } => write!(
                f,
                "Context exhausted: position {} exceeds capacity {}",
                position, n_ctx
            ),
            Error::ProtocolViolation { state, operation } => write!(
                f,
                "Protocol violation: `{}` is not allowed in state {:?}",
                operation, state
            ),
            Error::Sampling(msg) => write!(f, "Sampling error: {}", msg),
            Error::ChatTemplate(msg) => write!(f, "Chat template error: {}", msg),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// A specialized Result type for llama-session operations
pub type Result<T> = std::result::Result<T, Error>;
