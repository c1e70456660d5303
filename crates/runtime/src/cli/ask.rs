//! `threadmind ask`: one DM round trip against the in-memory host.

use crate::app::Runtime;
use crate::conversation::pending_tool_calls;
use crate::memory_host::MemoryHost;
use crate::service::StreamJob;
use crate::writer::{WriteOutcome, WriteStatus};
use anyhow::Context;
use std::sync::Arc;
use tm_domain::config::Config;
use tm_domain::host::{HostClient, HostPost, User};

pub async fn run(config: Arc<Config>, bot: Option<String>, message: String, approve_tools: bool) -> anyhow::Result<()> {
    let host = Arc::new(MemoryHost::new());
    let runtime = Runtime::build(config, host.clone()).await?;

    let bot = match bot {
        Some(name) => runtime
            .bots
            .get_bot(&name)
            .with_context(|| format!("no active bot named {name:?}"))?,
        None => runtime.bots.default_bot().context("no active bots configured")?,
    };

    let user = host.add_user(User {
        username: std::env::var("USER").unwrap_or_else(|_| "cli".into()),
        timezone: std::env::var("TZ").unwrap_or_default(),
        locale: std::env::var("LANG").unwrap_or_default(),
        ..Default::default()
    });
    let dm = host.get_direct_channel(bot.user_id(), &user.id).await?;
    let post = host.insert_post(HostPost {
        channel_id: dm.id,
        user_id: user.id.clone(),
        message,
        ..Default::default()
    });

    let job = runtime
        .conversations
        .handle_post(&post)
        .await?
        .context("the bot did not answer")?;
    let mut outcome = wait_or_stop(&runtime, job, &user.id).await?;

    while outcome.status == WriteStatus::ToolCallsPending {
        let pending = pending_tool_calls(&outcome.post);
        for call in &pending {
            eprintln!(
                "{} tool call {} {}",
                if approve_tools { "running" } else { "rejecting" },
                call.name,
                call.arguments
            );
        }
        let accepted: Vec<String> = if approve_tools {
            pending.into_iter().map(|c| c.id).collect()
        } else {
            Vec::new()
        };
        let job = runtime
            .conversations
            .handle_tool_call(&user.id, &outcome.post.id, &accepted)
            .await?;
        outcome = wait_or_stop(&runtime, job, &user.id).await?;
    }

    println!("{}", outcome.post.message);
    let status = outcome.status;
    runtime.shutdown().await;
    if status == WriteStatus::Failed {
        anyhow::bail!("completion failed, see logs");
    }
    Ok(())
}

/// Wait for `job`, stopping the stream on Ctrl-C.
async fn wait_or_stop(runtime: &Runtime, job: StreamJob, user_id: &str) -> anyhow::Result<WriteOutcome> {
    let post_id = job.post_id.clone();
    let wait = job.wait();
    tokio::pin!(wait);
    tokio::select! {
        outcome = &mut wait => Ok(outcome?),
        _ = tokio::signal::ctrl_c() => {
            runtime.conversations.stop(&post_id, user_id).await?;
            Ok(wait.await?)
        }
    }
}
