//! Token counting for input budgeting.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn cl100k() -> Option<&'static CoreBPE> {
    CL100K
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "cl100k tokenizer unavailable, using estimate");
                None
            }
        })
        .as_ref()
}

/// Count with the cl100k BPE used by the OpenAI chat models.
pub fn count_cl100k(text: &str) -> usize {
    match cl100k() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => estimate(text),
    }
}

/// Vendor-neutral estimate: one token per four characters, rounded up.
pub fn estimate(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate(""), 0);
        assert_eq!(estimate("abc"), 1);
        assert_eq!(estimate("abcde"), 2);
    }

    #[test]
    fn cl100k_counts_words() {
        let n = count_cl100k("hello world");
        assert!((1..=4).contains(&n));
    }
}
