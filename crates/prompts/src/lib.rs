//! Named prompt templates.
//!
//! A template `T` is a pair of optional subtemplates `T.system` and
//! `T.user`. The built-in set is compiled into the binary; a configured
//! directory of `*.tmpl` files (named `T.system.tmpl` / `T.user.tmpl`)
//! replaces built-ins of the same name and may add new ones. Everything is
//! loaded once at startup and never changes afterwards.

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use std::path::Path;
use tm_domain::config::PromptsConfig;
use tm_domain::context::RequestContext;
use tm_domain::error::{Error, Result};

/// Names of the built-in templates.
pub mod names {
    pub const STANDARD_PERSONALITY: &str = "standard_personality";
    pub const DIRECT_MESSAGE_QUESTION: &str = "direct_message_question";
    pub const SUMMARIZE_THREAD: &str = "summarize_thread";
    pub const FIND_ACTION_ITEMS: &str = "find_action_items";
    pub const FIND_OPEN_QUESTIONS: &str = "find_open_questions";
    pub const CHANNEL_INTERVAL_SINCE: &str = "channel_interval_since";
    pub const TITLE_THREAD: &str = "title_thread";
}

const TEMPLATE_EXT: &str = "tmpl";

const BUILTIN: &[(&str, &str)] = &[
    (
        "standard_personality.system",
        include_str!("../templates/standard_personality.system.tmpl"),
    ),
    (
        "direct_message_question.system",
        include_str!("../templates/direct_message_question.system.tmpl"),
    ),
    (
        "summarize_thread.system",
        include_str!("../templates/summarize_thread.system.tmpl"),
    ),
    (
        "summarize_thread.user",
        include_str!("../templates/summarize_thread.user.tmpl"),
    ),
    (
        "find_action_items.system",
        include_str!("../templates/find_action_items.system.tmpl"),
    ),
    (
        "find_action_items.user",
        include_str!("../templates/find_action_items.user.tmpl"),
    ),
    (
        "find_open_questions.system",
        include_str!("../templates/find_open_questions.system.tmpl"),
    ),
    (
        "find_open_questions.user",
        include_str!("../templates/find_open_questions.user.tmpl"),
    ),
    (
        "channel_interval_since.system",
        include_str!("../templates/channel_interval_since.system.tmpl"),
    ),
    (
        "channel_interval_since.user",
        include_str!("../templates/channel_interval_since.user.tmpl"),
    ),
    (
        "title_thread.system",
        include_str!("../templates/title_thread.system.tmpl"),
    ),
    (
        "title_thread.user",
        include_str!("../templates/title_thread.user.tmpl"),
    ),
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rendered system/user pair of one template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// Read-only template set. Rendering takes `&self`, so one instance can be
/// shared across tasks behind an `Arc`.
pub struct Prompts {
    env: Environment<'static>,
}

impl std::fmt::Debug for Prompts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.env.templates().map(|(name, _)| name).collect();
        f.debug_struct("Prompts").field("templates", &names).finish()
    }
}

impl Prompts {
    /// Built-in templates only.
    pub fn builtin() -> Result<Self> {
        let mut env = new_env();
        for (name, source) in BUILTIN {
            add(&mut env, name.to_string(), source.to_string())?;
        }
        Ok(Self { env })
    }

    /// Built-ins overlaid with the configured directory, if any.
    pub fn from_config(config: &PromptsConfig) -> Result<Self> {
        let mut prompts = Self::builtin()?;
        if let Some(dir) = &config.directory {
            let loaded = prompts.overlay_dir(dir)?;
            tracing::info!(dir = %dir.display(), loaded, "loaded prompt templates");
        }
        Ok(prompts)
    }

    /// Add every `*.tmpl` file of `dir`, replacing same-named templates.
    fn overlay_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping template with non-utf8 name");
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            add(&mut self.env, name.to_owned(), source)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// True when `name.system` or `name.user` exists.
    pub fn has(&self, name: &str) -> bool {
        self.exists(&system_name(name)) || self.exists(&user_name(name))
    }

    fn exists(&self, full: &str) -> bool {
        self.env.get_template(full).is_ok()
    }

    /// Render both halves of template `name`. A missing half renders as
    /// the empty string; a template with neither half is an error.
    pub fn format(&self, name: &str, ctx: &RequestContext) -> Result<RenderedPrompt> {
        if !self.has(name) {
            return Err(Error::Template(format!("template {name} not found")));
        }
        Ok(RenderedPrompt {
            system: self.render_optional(&system_name(name), ctx)?,
            user: self.render_optional(&user_name(name), ctx)?,
        })
    }

    fn render_optional(&self, full: &str, ctx: &RequestContext) -> Result<String> {
        match self.env.get_template(full) {
            Ok(tmpl) => tmpl.render(ctx).map_err(template_error),
            Err(e) if e.kind() == ErrorKind::TemplateNotFound => Ok(String::new()),
            Err(e) => Err(template_error(e)),
        }
    }

    /// Render template text supplied at runtime against `ctx`.
    pub fn format_string(&self, raw: &str, ctx: &RequestContext) -> Result<String> {
        self.env.render_str(raw, ctx).map_err(template_error)
    }
}

fn new_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.set_trim_blocks(true);
    env
}

fn add(env: &mut Environment<'static>, name: String, source: String) -> Result<()> {
    env.add_template_owned(name.clone(), source)
        .map_err(|e| Error::Template(format!("{name}: {e}")))
}

fn template_error(e: minijinja::Error) -> Error {
    Error::Template(e.to_string())
}

fn system_name(name: &str) -> String {
    format!("{name}.system")
}

fn user_name(name: &str) -> String {
    format!("{name}.user")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_domain::context::{BotSummary, UserSummary};

    fn ctx() -> RequestContext {
        RequestContext::new(
            UserSummary {
                id: "u1".into(),
                username: "alice".into(),
                full_name: "Alice Liddell".into(),
                ..Default::default()
            },
            BotSummary {
                name: "matty".into(),
                display_name: "Matty".into(),
                ..Default::default()
            },
        )
        .with_time("Mon, 01 Jan 2024 09:00:00 +0000")
        .with_parameter("thread", "alice: hello\nbob: hi")
    }

    #[test]
    fn every_builtin_renders() {
        let prompts = Prompts::builtin().unwrap();
        for name in [
            names::STANDARD_PERSONALITY,
            names::DIRECT_MESSAGE_QUESTION,
            names::SUMMARIZE_THREAD,
            names::FIND_ACTION_ITEMS,
            names::FIND_OPEN_QUESTIONS,
            names::CHANNEL_INTERVAL_SINCE,
            names::TITLE_THREAD,
        ] {
            let out = prompts.format(name, &ctx()).unwrap();
            assert!(!out.system.is_empty(), "{name} has no system half");
        }
    }

    #[test]
    fn personality_mentions_bot_and_user() {
        let prompts = Prompts::builtin().unwrap();
        let out = prompts
            .format(names::DIRECT_MESSAGE_QUESTION, &ctx())
            .unwrap();
        assert!(out.system.contains("\"Matty\""));
        assert!(out.system.contains("@alice"));
        assert!(out.user.is_empty());
    }

    #[test]
    fn thread_parameter_lands_in_user_half() {
        let prompts = Prompts::builtin().unwrap();
        let out = prompts.format(names::SUMMARIZE_THREAD, &ctx()).unwrap();
        assert!(out.user.ends_with("alice: hello\nbob: hi"));
    }

    #[test]
    fn missing_template_is_error() {
        let prompts = Prompts::builtin().unwrap();
        let err = prompts.format("nope", &ctx()).unwrap_err();
        assert!(matches!(err, Error::Template(m) if m.contains("nope")));
    }

    #[test]
    fn format_string_renders_context() {
        let prompts = Prompts::builtin().unwrap();
        let out = prompts
            .format_string("{{ user.username }} asks {{ bot.display_name }}", &ctx())
            .unwrap();
        assert_eq!(out, "alice asks Matty");
    }

    #[test]
    fn broken_runtime_template_is_error() {
        let prompts = Prompts::builtin().unwrap();
        assert!(prompts.format_string("{% if %}", &ctx()).is_err());
    }

    #[test]
    fn directory_overrides_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("standard_personality.system.tmpl"),
            "I am {{ bot.name }}.",
        )
        .unwrap();
        std::fs::write(dir.path().join("haiku.user.tmpl"), "Write a haiku.").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let prompts = Prompts::from_config(&PromptsConfig {
            directory: Some(dir.path().to_path_buf()),
        })
        .unwrap();

        // Templates including the personality pick up the override.
        let dm = prompts
            .format(names::DIRECT_MESSAGE_QUESTION, &ctx())
            .unwrap();
        assert!(dm.system.starts_with("I am matty."));

        let haiku = prompts.format("haiku", &ctx()).unwrap();
        assert_eq!(haiku.system, "");
        assert_eq!(haiku.user, "Write a haiku.");
        assert!(!prompts.has("notes"));
    }

    #[test]
    fn missing_directory_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PromptsConfig {
            directory: Some(dir.path().join("absent")),
        };
        assert!(matches!(Prompts::from_config(&cfg), Err(Error::Io(_))));
    }
}
