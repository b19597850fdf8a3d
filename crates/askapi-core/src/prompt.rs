//! Prompt construction for view generation and answer synthesis.

use crate::llm::{ChatMessage, Role};
use crate::model::{Record, ViewKind};

const SUMMARY_INSTRUCTION: &str = "Summarize this API doc chunk in <=6 lines. \
Focus on method/path, required parameters, and purpose:";

const QUESTION_INSTRUCTION: &str =
    "Generate 4 likely user questions about this API chunk (bulleted, concise):";

/// System prompt for the final answer.
pub const ANSWER_SYSTEM_PROMPT: &str = "Answer strictly using the provided API docs.\n\
Always include:\n\
1) Method & path\n\
2) Required params (name, in, type)\n\
3) Example curl (with base URL if present)\n\
If uncertain, say so and propose how to verify.\n\
Cite sources as (METHOD PATH/status) when relevant.";

/// Messages asking the LLM for one view of `record`.
///
/// Returns `None` for kinds that are not LLM-generated.
pub fn view_messages(kind: ViewKind, record: &Record) -> Option<Vec<ChatMessage>> {
    let instruction = match kind {
        ViewKind::Summary => SUMMARY_INSTRUCTION,
        ViewKind::Question => QUESTION_INSTRUCTION,
        ViewKind::Example | ViewKind::Metadata => return None,
    };
    Some(vec![ChatMessage::user(format!(
        "{}\n{}",
        instruction,
        record.render()
    ))])
}

/// One block of retrieved context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSection {
    /// Citation label, e.g. `GET /pets/{id}`.
    pub label: String,
    pub body: String,
}

/// Join context sections with separators the model can cite.
pub fn format_context(sections: &[ContextSection]) -> String {
    sections
        .iter()
        .map(|s| format!("### {}\n{}", s.label, s.body))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Messages for answer synthesis: instructions, prior turns, the question,
/// then the retrieved context.
pub fn answer_messages(question: &str, history: &[ChatMessage], context: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 3);
    messages.push(ChatMessage::system(ANSWER_SYSTEM_PROMPT));
    messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
    messages.push(ChatMessage::user(question));
    messages.push(ChatMessage::system(format!("Context:\n{}", context)));
    messages
}

/// Text embedded for retrieval: the question, preceded by the latest
/// earlier user turn so follow-ups like "and how do I delete it?" keep
/// their subject.
pub fn retrieval_query(question: &str, history: &[ChatMessage]) -> String {
    match history.iter().rev().find(|m| m.role == Role::User) {
        Some(prev) if !prev.content.trim().is_empty() => {
            format!("{}\n{}", prev.content.trim(), question.trim())
        }
        _ => question.trim().to_string(),
    }
}
