use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::TemplateContext;
use super::template::PromptTemplate;
use super::TemplateError;
use crate::models::provider::{Message, MessageRole};

/// How a prompt's templates are fed from the inbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// System template rendered without context; caller system content is ignored.
    #[default]
    Static,
    /// System message content is the JSON context for the system template.
    DynamicSystem,
    /// Inline context renders the system template once; single turn, user text literal.
    DynamicSystemOnce,
    /// System and user messages each carry the JSON context for their own template.
    DynamicBoth,
}

impl PromptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptMode::Static => "static",
            PromptMode::DynamicSystem => "dynamic_system",
            PromptMode::DynamicSystemOnce => "dynamic_system_once",
            PromptMode::DynamicBoth => "dynamic_both",
        }
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed templates of one configured prompt.
#[derive(Debug, Clone)]
pub struct PromptSet {
    mode: PromptMode,
    system: PromptTemplate,
    user: Option<PromptTemplate>,
}

impl PromptSet {
    pub fn new(mode: PromptMode, system: &str, user: Option<&str>) -> Result<Self, TemplateError> {
        let system = PromptTemplate::parse(system)?;
        let user = user.map(PromptTemplate::parse).transpose()?;

        if mode == PromptMode::DynamicBoth && user.is_none() {
            return Err(TemplateError::MissingUserTemplate(mode.to_string()));
        }

        Ok(Self { mode, system, user })
    }

    pub fn mode(&self) -> PromptMode {
        self.mode
    }

    pub fn system(&self) -> &PromptTemplate {
        &self.system
    }

    pub fn user(&self) -> Option<&PromptTemplate> {
        self.user.as_ref()
    }

    /// Produces the message list sent upstream.
    ///
    /// With two or more non-system messages the request is a conversation: the
    /// rendered system prompt replaces the caller's system message in place (or
    /// is inserted first) and everything else is kept. Otherwise the result is
    /// exactly `[system, user]`. One-shot prompts are always single turn.
    pub fn render_messages(
        &self,
        messages: &[Message],
        inline_context: Option<&Value>,
    ) -> Result<Vec<Message>, TemplateError> {
        let system_index = messages.iter().position(|m| m.role == MessageRole::System);
        let system_context = self.system_context(system_index.map(|i| &messages[i]), inline_context)?;
        let system_prompt = self.system.render(&system_context)?;

        let conversation: Vec<&Message> = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .collect();

        if self.mode != PromptMode::DynamicSystemOnce && conversation.len() >= 2 {
            let mut shaped = messages.to_vec();
            match system_index {
                Some(i) => shaped[i] = Message::system(system_prompt),
                None => shaped.insert(0, Message::system(system_prompt)),
            }
            return Ok(shaped);
        }

        let user_text = conversation
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text().to_string())
            .unwrap_or_default();

        let user_prompt = match (self.mode, &self.user) {
            (PromptMode::DynamicBoth, Some(template)) => {
                template.render(&TemplateContext::from_json_str(&user_text)?)?
            }
            _ => user_text,
        };

        Ok(vec![Message::system(system_prompt), Message::user(user_prompt)])
    }

    fn system_context(
        &self,
        system_message: Option<&Message>,
        inline_context: Option<&Value>,
    ) -> Result<TemplateContext, TemplateError> {
        match self.mode {
            PromptMode::Static => Ok(TemplateContext::new()),
            PromptMode::DynamicSystemOnce => match inline_context {
                Some(value) => TemplateContext::from_json(value),
                None => message_context(system_message),
            },
            PromptMode::DynamicSystem | PromptMode::DynamicBoth => message_context(system_message),
        }
    }
}

fn message_context(message: Option<&Message>) -> Result<TemplateContext, TemplateError> {
    match message.map(|m| m.text().trim()) {
        None | Some("") => Ok(TemplateContext::new()),
        Some(text) => TemplateContext::from_json_str(text),
    }
}
