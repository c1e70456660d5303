//! `@username` scanning over rendered markdown.
//!
//! Mentions inside inline code or code blocks do not count, so the text is
//! parsed first and only plain text nodes are scanned.

use comrak::nodes::NodeValue;
use comrak::{parse_document, Arena, Options};
use regex::Regex;
use std::sync::LazyLock;

// Constant pattern, so compiling it cannot fail at runtime.
static MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9][A-Za-z0-9._-]*)").expect("mention pattern compiles")
});

/// Text of `markdown` with code spans and code blocks removed. Block
/// boundaries become spaces so words never run together.
fn visible_text(markdown: &str) -> String {
    let arena = Arena::new();
    let root = parse_document(&arena, markdown, &Options::default());

    let mut out = String::with_capacity(markdown.len());
    for node in root.descendants() {
        match &node.data.borrow().value {
            NodeValue::Text(t) => {
                let t: &str = t.as_ref();
                out.push_str(t);
            }
            NodeValue::Code(_) | NodeValue::CodeBlock(_) | NodeValue::HtmlInline(_) => out.push(' '),
            NodeValue::SoftBreak | NodeValue::LineBreak => out.push(' '),
            NodeValue::Paragraph | NodeValue::Heading(_) | NodeValue::Item(_) => out.push(' '),
            _ => {}
        }
    }
    out
}

/// Every username mentioned outside code, in order of appearance.
/// A trailing `.` (sentence end) is not part of the username.
pub fn mentions(markdown: &str) -> Vec<String> {
    let text = visible_text(markdown);
    MENTION
        .captures_iter(&text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_owned())
        .filter(|m| !m.is_empty())
        .collect()
}

/// First mention matching one of `usernames` (case-insensitive).
pub fn first_mention_of<'a, I>(markdown: &str, usernames: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    mentions(markdown).into_iter().find(|m| {
        usernames
            .clone()
            .into_iter()
            .any(|u| u.eq_ignore_ascii_case(m))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mention() {
        assert_eq!(mentions("hey @matty, who is @alice?"), vec!["matty", "alice"]);
    }

    #[test]
    fn sentence_end_and_start_of_text() {
        assert_eq!(mentions("@matty"), vec!["matty"]);
        assert_eq!(mentions("ask @matty."), vec!["matty"]);
    }

    #[test]
    fn inline_code_is_ignored() {
        assert!(first_mention_of("try `@matty` for that", ["matty"]).is_none());
    }

    #[test]
    fn fenced_code_is_ignored() {
        let md = "look:\n\n```\n@matty help\n```\n";
        assert!(first_mention_of(md, ["matty"]).is_none());
    }

    #[test]
    fn mention_outside_code_still_found() {
        let md = "```\n@other\n```\n\nthen @Matty please";
        assert_eq!(first_mention_of(md, ["matty"]).as_deref(), Some("Matty"));
    }

    #[test]
    fn email_addresses_are_not_mentions() {
        assert!(mentions("mail alice@matty.com").is_empty());
    }

    #[test]
    fn first_matching_bot_wins() {
        let found = first_mention_of("@alice ask @gpt or @matty", ["matty", "gpt"]);
        assert_eq!(found.as_deref(), Some("gpt"));
    }
}
