//! Services layer for annotext
//!
//! Provides the completion gateway abstraction, concrete provider gateways,
//! ranked provider fallback, and retrying calls.

pub mod fallback;
pub mod gateway;
pub mod llm;
pub mod openai;
pub mod retry;

pub use fallback::FallbackGateway;
pub use gateway::{extract_json_payload, CompletionGateway, CompletionPurpose, CompletionRequest};
pub use llm::{AnthropicGateway, LlmConfig};
pub use openai::OpenAiGateway;
pub use retry::{complete_and_parse, complete_with_retry, RetryPolicy};
