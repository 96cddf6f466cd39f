use common::types::ChatMessage;

/// Persona system message carrying the retrieved context, then the caller's
/// conversation unchanged and in order.
pub fn assemble_prompt(persona: &str, context: &str, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut prompt = Vec::with_capacity(messages.len().saturating_add(1));
    prompt.push(ChatMessage::system(system_message(persona, context)));
    prompt.extend(messages.iter().cloned());
    prompt
}

fn system_message(persona: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        "(no reference lines matched)"
    } else {
        context
    };
    format!(
        "{persona}\n\nReference lines you may draw on:\n{context}\n\nStay in character and answer the latest user message."
    )
}
