//! Seam for meeting-transcript features.
//!
//! Transcription and its summaries live outside this crate. A host that has
//! them injects a [`MeetingsService`] once after the runtime is built; until
//! then transcript-backed operations fail with a configuration error.

use tm_domain::context::RequestContext;
use tm_domain::error::Result;
use tm_domain::host::HostPost;
use tm_domain::stream::TextStream;
use tm_providers::LanguageModel;
use tokio_util::sync::CancellationToken;

#[async_trait::async_trait]
pub trait MeetingsService: Send + Sync {
    /// File id of the captions attached to a recording post.
    async fn captions_file_id(&self, recording: &HostPost) -> Result<Option<String>>;

    /// Stream a summary of the transcript stored in `file_id`.
    async fn summarize_transcription(
        &self,
        model: &dyn LanguageModel,
        ctx: RequestContext,
        file_id: &str,
        cancel: CancellationToken,
    ) -> Result<TextStream>;
}
