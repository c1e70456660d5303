use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptsConfig {
    /// Directory of `*.tmpl` files that replace built-in templates of the
    /// same name.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}
