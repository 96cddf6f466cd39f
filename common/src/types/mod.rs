pub mod message;

pub use message::{ChatFragment, ChatMessage, ChatRequest, ChatResponse, MessageRole};
