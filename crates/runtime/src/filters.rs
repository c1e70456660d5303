//! Which incoming posts may start a completion.
//!
//! These checks only look at the post itself. Whether it addresses a bot
//! (mention or DM) is decided afterwards by the bot manager.

use std::collections::HashSet;
use tm_domain::host::{props, HostPost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BotAuthored,
    Remote,
    Wrangler,
    FromPlugin,
    FromWebhook,
    FromBot,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::BotAuthored => "bot_authored",
            SkipReason::Remote => "remote",
            SkipReason::Wrangler => "wrangler",
            SkipReason::FromPlugin => "from_plugin",
            SkipReason::FromWebhook => "from_webhook",
            SkipReason::FromBot => "from_bot",
        }
    }
}

/// Why `post` must not trigger a completion, or `None` if it may.
pub fn skip_reason(post: &HostPost, bot_user_ids: &HashSet<String>) -> Option<SkipReason> {
    let activate = post.prop_bool(props::ACTIVATE_AI);
    if bot_user_ids.contains(&post.user_id) {
        Some(SkipReason::BotAuthored)
    } else if post.remote_id.as_deref().is_some_and(|r| !r.is_empty()) {
        Some(SkipReason::Remote)
    } else if post.prop_bool(props::WRANGLER) {
        Some(SkipReason::Wrangler)
    } else if post.prop_bool(props::FROM_PLUGIN) && !activate {
        Some(SkipReason::FromPlugin)
    } else if post.prop_bool(props::FROM_WEBHOOK) {
        Some(SkipReason::FromWebhook)
    } else if post.prop_bool(props::FROM_BOT) && !activate {
        Some(SkipReason::FromBot)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> HostPost {
        HostPost {
            id: "p".into(),
            channel_id: "c".into(),
            user_id: "u1".into(),
            message: "@matty hi".into(),
            ..Default::default()
        }
    }

    fn bots() -> HashSet<String> {
        HashSet::from(["bot1".to_owned()])
    }

    #[test]
    fn ordinary_post_passes() {
        assert_eq!(skip_reason(&post(), &bots()), None);
    }

    #[test]
    fn bot_authored_is_skipped() {
        let mut p = post();
        p.user_id = "bot1".into();
        assert_eq!(skip_reason(&p, &bots()), Some(SkipReason::BotAuthored));
    }

    #[test]
    fn remote_and_wrangler_are_skipped() {
        let mut p = post();
        p.remote_id = Some("r1".into());
        assert_eq!(skip_reason(&p, &bots()), Some(SkipReason::Remote));

        let mut p = post();
        p.set_prop(props::WRANGLER, true);
        assert_eq!(skip_reason(&p, &bots()), Some(SkipReason::Wrangler));
    }

    #[test]
    fn activate_ai_lets_plugin_and_bot_posts_through() {
        let mut p = post();
        p.set_prop(props::FROM_PLUGIN, true);
        assert_eq!(skip_reason(&p, &bots()), Some(SkipReason::FromPlugin));
        p.set_prop(props::ACTIVATE_AI, true);
        assert_eq!(skip_reason(&p, &bots()), None);

        let mut p = post();
        p.set_prop(props::FROM_BOT, "true");
        assert_eq!(skip_reason(&p, &bots()), Some(SkipReason::FromBot));
        p.set_prop(props::ACTIVATE_AI, "true");
        assert_eq!(skip_reason(&p, &bots()), None);
    }

    #[test]
    fn webhooks_are_always_skipped() {
        let mut p = post();
        p.set_prop(props::FROM_WEBHOOK, true);
        p.set_prop(props::ACTIVATE_AI, true);
        assert_eq!(skip_reason(&p, &bots()), Some(SkipReason::FromWebhook));
    }
}
