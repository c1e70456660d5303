pub mod capability;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod host;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
