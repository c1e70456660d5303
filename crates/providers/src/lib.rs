pub mod anthropic;
pub mod asksage;
pub mod bedrock;
pub mod network;
pub mod openai_compat;
pub mod registry;
pub mod sse;
pub mod tokens;
pub mod traits;
pub mod truncation;
pub(crate) mod eventstream;
pub(crate) mod pump;
pub(crate) mod util;

// Re-exports for convenience.
pub use network::AllowedHosts;
pub use registry::{build_model, ModelRegistry, ProviderEnv};
pub use traits::{CompletionRequest, LanguageModel, LanguageModelConfig};
pub use truncation::TruncatingModel;
pub use util::resolve_api_key;
