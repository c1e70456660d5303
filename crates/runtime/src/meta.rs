//! Conversation titles keyed by thread root (`LLM_PostMeta`).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tm_domain::error::Result;
use tm_domain::host::HostClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMeta {
    pub root_post_id: String,
    pub title: String,
}

#[async_trait::async_trait]
pub trait PostMetaStore: Send + Sync {
    /// Insert or replace the title of thread `root_post_id`.
    async fn upsert_title(&self, root_post_id: &str, title: &str) -> Result<()>;
    async fn get(&self, root_post_id: &str) -> Result<Option<PostMeta>>;
}

/// Stores rows in the host's key-value store, one key per thread.
pub struct KvPostMetaStore {
    host: Arc<dyn HostClient>,
}

impl KvPostMetaStore {
    pub fn new(host: Arc<dyn HostClient>) -> Self {
        Self { host }
    }

    fn key(root_post_id: &str) -> String {
        format!("post_meta/{root_post_id}")
    }
}

#[async_trait::async_trait]
impl PostMetaStore for KvPostMetaStore {
    async fn upsert_title(&self, root_post_id: &str, title: &str) -> Result<()> {
        let row = PostMeta {
            root_post_id: root_post_id.to_owned(),
            title: title.to_owned(),
        };
        self.host
            .kv_set(&Self::key(root_post_id), serde_json::to_vec(&row)?)
            .await
    }

    async fn get(&self, root_post_id: &str) -> Result<Option<PostMeta>> {
        match self.host.kv_get(&Self::key(root_post_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_host::MemoryHost;

    #[tokio::test]
    async fn upsert_replaces() {
        let store = KvPostMetaStore::new(Arc::new(MemoryHost::new()));
        assert!(store.get("root").await.unwrap().is_none());

        store.upsert_title("root", "First").await.unwrap();
        store.upsert_title("root", "Second").await.unwrap();

        let row = store.get("root").await.unwrap().unwrap();
        assert_eq!(row.title, "Second");
        assert_eq!(row.root_post_id, "root");
    }
}
