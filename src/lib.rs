pub mod cli;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod server;
pub mod usage;

pub use models::{ChatCompletion, ChatMessage, ChatRequest, ResponseFragment, Usage};
pub use orchestrator::{ChatService, StreamOutcome, StreamReport};
