//! In-process [`HostClient`] used by the CLI and the tests.
//!
//! Keeps users, channels, posts, files and key-value pairs in memory. Post
//! timestamps come from a strictly increasing clock so thread order is
//! always creation order.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use tm_domain::error::{Error, Result};
use tm_domain::host::{Channel, ChannelType, FileInfo, HostClient, HostPost, User};
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    users: HashMap<String, User>,
    channels: HashMap<String, Channel>,
    posts: HashMap<String, HostPost>,
    updates: HashMap<String, usize>,
    files: HashMap<String, (FileInfo, Vec<u8>)>,
    kv: HashMap<String, Vec<u8>>,
    locks: HashSet<String>,
    deactivated: HashSet<String>,
}

pub struct MemoryHost {
    state: Mutex<State>,
    clock: AtomicI64,
    unlocked: Notify,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            unlocked: Notify::new(),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    // ── Seeding ─────────────────────────────────────────────────────

    pub fn add_user(&self, mut user: User) -> User {
        if user.id.is_empty() {
            user.id = new_id();
        }
        self.state.lock().users.insert(user.id.clone(), user.clone());
        user
    }

    pub fn add_channel(&self, mut channel: Channel) -> Channel {
        if channel.id.is_empty() {
            channel.id = new_id();
        }
        self.state
            .lock()
            .channels
            .insert(channel.id.clone(), channel.clone());
        channel
    }

    pub fn add_file(&self, mut info: FileInfo, data: Vec<u8>) -> FileInfo {
        if info.id.is_empty() {
            info.id = new_id();
        }
        info.size = data.len() as u64;
        self.state
            .lock()
            .files
            .insert(info.id.clone(), (info.clone(), data));
        info
    }

    /// Store `post` as-is apart from a missing id or timestamp.
    pub fn insert_post(&self, mut post: HostPost) -> HostPost {
        if post.id.is_empty() {
            post.id = new_id();
        }
        if post.create_at == 0 {
            post.create_at = self.tick();
        }
        self.state.lock().posts.insert(post.id.clone(), post.clone());
        post
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn post(&self, post_id: &str) -> Option<HostPost> {
        self.state.lock().posts.get(post_id).cloned()
    }

    /// Posts of `channel_id`, oldest first.
    pub fn channel_posts(&self, channel_id: &str) -> Vec<HostPost> {
        let mut posts: Vec<HostPost> = self
            .state
            .lock()
            .posts
            .values()
            .filter(|p| p.channel_id == channel_id)
            .cloned()
            .collect();
        posts.sort_by_key(|p| p.create_at);
        posts
    }

    /// How many times `post_id` was updated after creation.
    pub fn update_count(&self, post_id: &str) -> usize {
        self.state
            .lock()
            .updates
            .get(post_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_deactivated(&self, user_id: &str) -> bool {
        self.state.lock().deactivated.contains(user_id)
    }

    fn direct_channel_name(a: &str, b: &str) -> String {
        if a <= b {
            format!("{a}__{b}")
        } else {
            format!("{b}__{a}")
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn not_found(what: &str, id: &str) -> Error {
    Error::Host(format!("{what} {id} not found"))
}

#[async_trait::async_trait]
impl HostClient for MemoryHost {
    async fn get_user(&self, user_id: &str) -> Result<User> {
        self.state
            .lock()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| not_found("user", user_id))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.state
            .lock()
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned()
            .ok_or_else(|| not_found("user", username))
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| not_found("channel", channel_id))
    }

    async fn get_direct_channel(&self, user_a: &str, user_b: &str) -> Result<Channel> {
        let name = Self::direct_channel_name(user_a, user_b);
        let mut state = self.state.lock();
        if let Some(existing) = state.channels.values().find(|c| c.name == name) {
            return Ok(existing.clone());
        }
        let channel = Channel {
            id: new_id(),
            team_id: String::new(),
            kind: ChannelType::Direct,
            name,
            display_name: String::new(),
        };
        state.channels.insert(channel.id.clone(), channel.clone());
        Ok(channel)
    }

    async fn get_post(&self, post_id: &str) -> Result<HostPost> {
        self.post(post_id).ok_or_else(|| not_found("post", post_id))
    }

    async fn get_post_thread(&self, post_id: &str) -> Result<Vec<HostPost>> {
        let state = self.state.lock();
        let anchor = state
            .posts
            .get(post_id)
            .ok_or_else(|| not_found("post", post_id))?;
        let root = anchor.thread_root().to_owned();
        let mut thread: Vec<HostPost> = state
            .posts
            .values()
            .filter(|p| p.id == root || p.root_id == root)
            .cloned()
            .collect();
        thread.sort_by_key(|p| p.create_at);
        Ok(thread)
    }

    async fn get_posts_since(&self, channel_id: &str, since_ms: i64) -> Result<Vec<HostPost>> {
        Ok(self
            .channel_posts(channel_id)
            .into_iter()
            .filter(|p| p.create_at >= since_ms)
            .collect())
    }

    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| not_found("file", file_id))
    }

    async fn read_file(&self, file_id: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let (_, data) = state
            .files
            .get(file_id)
            .ok_or_else(|| not_found("file", file_id))?;
        let end = data.len().min(max_bytes as usize);
        Ok(data[..end].to_vec())
    }

    async fn create_post(&self, post: HostPost) -> Result<HostPost> {
        if post.channel_id.is_empty() {
            return Err(Error::Host("post has no channel".into()));
        }
        let mut post = post;
        post.id = new_id();
        post.create_at = self.tick();
        self.state.lock().posts.insert(post.id.clone(), post.clone());
        Ok(post)
    }

    async fn update_post(&self, post: HostPost) -> Result<HostPost> {
        let mut state = self.state.lock();
        let existing = state
            .posts
            .get_mut(&post.id)
            .ok_or_else(|| not_found("post", &post.id))?;
        existing.message = post.message.clone();
        existing.props = post.props.clone();
        existing.attachments = post.attachments.clone();
        let updated = existing.clone();
        *state.updates.entry(post.id).or_default() += 1;
        Ok(updated)
    }

    async fn dm(&self, bot_user_id: &str, user_id: &str, mut post: HostPost) -> Result<HostPost> {
        let channel = self.get_direct_channel(bot_user_id, user_id).await?;
        post.channel_id = channel.id;
        post.user_id = bot_user_id.to_owned();
        self.create_post(post).await
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.state.lock().kv.insert(key.to_owned(), value);
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<()> {
        loop {
            let notified = self.unlocked.notified();
            if self.state.lock().locks.insert(key.to_owned()) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.state.lock().locks.remove(key);
        self.unlocked.notify_waiters();
        Ok(())
    }

    async fn ensure_bot_user(&self, username: &str, display_name: &str) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(user) = state
            .users
            .values_mut()
            .find(|u| u.username.eq_ignore_ascii_case(username))
        {
            if !user.is_bot {
                return Err(Error::Host(format!(
                    "username {username} belongs to a regular user"
                )));
            }
            user.nickname = display_name.to_owned();
            let id = user.id.clone();
            state.deactivated.remove(&id);
            return Ok(id);
        }
        let user = User {
            id: new_id(),
            username: username.to_owned(),
            nickname: display_name.to_owned(),
            is_bot: true,
            ..Default::default()
        };
        let id = user.id.clone();
        state.users.insert(id.clone(), user);
        Ok(id)
    }

    async fn deactivate_bot_user(&self, user_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.users.contains_key(user_id) {
            return Err(not_found("user", user_id));
        }
        state.deactivated.insert(user_id.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn thread_is_ordered_and_scoped() {
        let host = MemoryHost::new();
        let root = host
            .create_post(HostPost {
                channel_id: "c".into(),
                user_id: "u".into(),
                message: "root".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        for msg in ["one", "two"] {
            host.create_post(HostPost {
                channel_id: "c".into(),
                root_id: root.id.clone(),
                user_id: "u".into(),
                message: msg.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        host.create_post(HostPost {
            channel_id: "c".into(),
            user_id: "u".into(),
            message: "elsewhere".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let thread = host.get_post_thread(&root.id).await.unwrap();
        let msgs: Vec<_> = thread.iter().map(|p| p.message.as_str()).collect();
        assert_eq!(msgs, vec!["root", "one", "two"]);
    }

    #[tokio::test]
    async fn direct_channel_is_stable() {
        let host = MemoryHost::new();
        let a = host.get_direct_channel("bob", "alice").await.unwrap();
        let b = host.get_direct_channel("alice", "bob").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "alice__bob");
    }

    #[tokio::test]
    async fn bot_users_are_reused_and_reactivated() {
        let host = MemoryHost::new();
        let id = host.ensure_bot_user("matty", "Matty").await.unwrap();
        host.deactivate_bot_user(&id).await.unwrap();
        assert!(host.is_deactivated(&id));

        assert_eq!(host.ensure_bot_user("matty", "Matty").await.unwrap(), id);
        assert!(!host.is_deactivated(&id));
    }

    #[tokio::test]
    async fn read_file_caps_length() {
        let host = MemoryHost::new();
        let info = host.add_file(
            FileInfo {
                name: "a.txt".into(),
                mime_type: "text/plain".into(),
                ..Default::default()
            },
            b"abcdef".to_vec(),
        );
        assert_eq!(host.read_file(&info.id, 3).await.unwrap(), b"abc");
        assert_eq!(info.size, 6);
    }

    #[tokio::test]
    async fn lock_waits_for_unlock() {
        let host = Arc::new(MemoryHost::new());
        host.lock("k").await.unwrap();

        let waiter = {
            let host = host.clone();
            tokio::spawn(async move { host.lock("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        host.unlock("k").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
