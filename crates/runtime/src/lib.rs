//! Chat-platform side of threadmind: bots, conversations, orchestration and
//! streaming answers into posts.

pub mod app;
pub mod bots;
pub mod cli;
pub mod context;
pub mod conversation;
pub mod filters;
pub mod meetings;
pub mod memory_host;
pub mod mention;
pub mod meta;
pub mod notices;
pub mod orchestrator;
pub mod service;
pub mod streams;
pub mod writer;

pub use app::Runtime;
pub use bots::{Bot, BotManager};
pub use service::{AnalysisKind, Conversations, StreamJob};
pub use writer::{WriteOutcome, WriteStatus};
