//! Live streams keyed by target post.
//!
//! Each streaming post gets a [`StreamHandle`]. Cancelling it aborts the
//! upstream request and makes the writer close the post with a cancelled
//! notice. At most one stream is live per post: registering a new one
//! cancels the one it replaces.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Registration of one stream. The generation distinguishes it from a later
/// registration for the same post.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub post_id: String,
    pub token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
pub struct StreamContexts {
    live: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_generation: AtomicU64,
}

impl StreamContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for `post_id`, cancelling any live one.
    pub fn register(&self, post_id: &str) -> StreamHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let replaced = self
            .live
            .lock()
            .insert(post_id.to_owned(), (generation, token.clone()));
        if let Some((_, old)) = replaced {
            tracing::debug!(post_id = %post_id, "replacing live stream");
            old.cancel();
        }
        StreamHandle {
            post_id: post_id.to_owned(),
            token,
            generation,
        }
    }

    /// Cancel the live stream of `post_id`. Returns true if one was found.
    pub fn cancel(&self, post_id: &str) -> bool {
        match self.live.lock().get(post_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop `handle`'s registration. A newer registration for the same
    /// post is left alone.
    pub fn remove(&self, handle: &StreamHandle) {
        let mut live = self.live.lock();
        if live
            .get(&handle.post_id)
            .is_some_and(|(generation, _)| *generation == handle.generation)
        {
            live.remove(&handle.post_id);
        }
    }

    /// Whether `handle` is still the live registration for its post.
    pub fn is_current(&self, handle: &StreamHandle) -> bool {
        self.live
            .lock()
            .get(&handle.post_id)
            .is_some_and(|(generation, _)| *generation == handle.generation)
    }

    pub fn is_running(&self, post_id: &str) -> bool {
        self.live.lock().contains_key(post_id)
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}
