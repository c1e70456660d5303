//! Tool registry for threadmind.
//!
//! - [`ToolStore`]: name → descriptor map the model's tool calls resolve against
//! - [`ToolArgs`]: schema-checked accessor a resolver decodes its arguments with
//! - [`builtin`]: tools backed by the chat host (`lookup_user`, `read_post`)

pub mod args;
pub mod builtin;
pub mod store;

pub use args::ToolArgs;
pub use store::{LogTraceSink, Tool, ToolResolver, ToolStore, TraceSink};
