//! Model context assembly: system instructions, compacted history, then the
//! current turn.

use shellbot_history::{Interaction, Step};
use shellbot_llm::{ChatMessage, ToolCall, ToolCallFunction};

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    instructions: String,
}

impl ContextBuilder {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    pub fn build(&self, history: &[Interaction], prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        if !self.instructions.trim().is_empty() {
            messages.push(ChatMessage::system(self.instructions.clone()));
        }
        for interaction in history {
            messages.push(ChatMessage::user(interaction.user_message.content.clone()));
            for step in &interaction.steps {
                push_step(&mut messages, step);
            }
            messages.push(ChatMessage::assistant(
                interaction.final_message.content.clone(),
            ));
        }
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

/// Replay one step as an assistant tool request followed by its result.
pub fn push_step(messages: &mut Vec<ChatMessage>, step: &Step) {
    let preamble = step
        .assistant_message
        .as_ref()
        .map(|message| message.content.clone())
        .unwrap_or_default();
    messages.push(ChatMessage::assistant_tool_calls(
        preamble,
        vec![ToolCall {
            id: Some(step.tool_call_id.clone()),
            function: ToolCallFunction {
                name: step.tool_name.clone(),
                arguments: step.arguments.clone(),
            },
        }],
    ));
    messages.push(ChatMessage::tool_result(
        step.tool_call_id.clone(),
        step.result.to_model_text(),
    ));
}
