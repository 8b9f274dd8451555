use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::session::Session;

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// Role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System prompt
    System,
    /// User message
    User,
    /// Assistant message
    Assistant,
}

impl ChatRole {
    /// Convert the role to a string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => ROLE_SYSTEM,
            ChatRole::User => ROLE_USER,
            ChatRole::Assistant => ROLE_ASSISTANT,
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ROLE_SYSTEM => Ok(ChatRole::System),
            ROLE_USER => Ok(ChatRole::User),
            ROLE_ASSISTANT => Ok(ChatRole::Assistant),
            other => Err(Error::ChatTemplate(format!("unknown chat role `{}`", other))),
        }
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender
    pub role: ChatRole,
    /// The content of the message
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// How a conversation is turned into a single prompt string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplateFormat {
    /// Use the template embedded in the model, or [`ChatTemplateFormat::Fallback`]
    /// if the model has none
    #[default]
    ModelDefault,
    /// `<|{role}|>\n{content}\n` per message, then `<|assistant|>\n`
    Fallback,
    /// Custom per-message pattern with `{role}` and `{content}` placeholders
    Custom(String),
}

impl ChatTemplateFormat {
    /// Render `messages` into one prompt, optionally ending with the prefix of an
    /// assistant turn so the model continues as the assistant.
    pub fn render<E: Engine + ?Sized>(
        &self,
        engine: &E,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        match self {
            ChatTemplateFormat::ModelDefault if engine.has_chat_template() => {
                engine.apply_chat_template(messages, add_assistant)
            }
            ChatTemplateFormat::ModelDefault => {
                debug!("model has no chat template, using the fallback format");
                Ok(render_fallback(messages, add_assistant))
            }
            ChatTemplateFormat::Fallback => Ok(render_fallback(messages, add_assistant)),
            ChatTemplateFormat::Custom(pattern) => render_custom(pattern, messages, add_assistant),
        }
    }
}

fn render_fallback(messages: &[ChatMessage], add_assistant: bool) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&format!("<|{}|>\n{}\n", message.role, message.content));
    }
    if add_assistant {
        prompt.push_str(&format!("<|{}|>\n", ROLE_ASSISTANT));
    }
    prompt
}

fn render_custom(pattern: &str, messages: &[ChatMessage], add_assistant: bool) -> Result<String> {
    if !pattern.contains("{content}") {
        return Err(Error::ChatTemplate(
            "custom template must contain a `{content}` placeholder".into(),
        ));
    }

    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(
            &pattern
                .replace("{role}", message.role.as_str())
                .replace("{content}", &message.content),
        );
    }
    if add_assistant {
        let prefix = pattern
            .split("{content}")
            .next()
            .unwrap_or_default()
            .replace("{role}", ROLE_ASSISTANT);
        prompt.push_str(&prefix);
    }
    Ok(prompt)
}

/// A multi-turn conversation on top of a [`Session`].
///
/// Every turn renders the whole history with the chat template and generates the
/// assistant's answer, which is then appended to the history.
pub struct ChatSession<'m, E: Engine + 'm> {
    messages: Vec<ChatMessage>,
    session: Session<'m, E>,
}

impl<'m, E: Engine + 'm> ChatSession<'m, E> {
    pub fn new(session: Session<'m, E>) -> Self {
        Self {
            messages: Vec::new(),
            session,
        }
    }

    /// The messages in the conversation
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Get the last message in the chat session
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn session(&self) -> &Session<'m, E> {
        &self.session
    }

    /// Add a system message to the chat session
    pub fn add_system_message(&mut self, content: &str) {
        self.messages.push(ChatMessage::system(content));
    }

    /// Add a user message to the chat session
    pub fn add_user_message(&mut self, content: &str) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Add an assistant message to the chat session
    pub fn add_assistant_message(&mut self, content: &str) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Add a user message and generate the assistant's reply.
    ///
    /// On failure the user message is removed again and the underlying session
    /// is reset, so the conversation can be retried.
    pub fn respond(&mut self, user_message: &str) -> Result<String> {
        self.add_user_message(user_message);
        match self.generate() {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.messages.pop();
                self.session.reset();
                Err(e)
            }
        }
    }

    /// Generate an assistant reply to the conversation so far.
    pub fn generate(&mut self) -> Result<String> {
        let reply = self.session.respond(self.messages.as_slice(), true)?;
        self.add_assistant_message(&reply);
        Ok(reply)
    }

    /// Forget the conversation, keeping system messages.
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == ChatRole::System);
        self.session.reset();
    }
}
