//! HTTP clients for Boreas's external collaborators: OpenAI-compatible LLM
//! backends and submit/poll video providers. All pipeline logic lives in
//! boreas-core; these only implement its capability traits.

pub mod llm;
pub mod video;

pub use llm::{ChatGenerator, LlmParser, LlmQualityScorer};
pub use video::HttpVideoProvider;
