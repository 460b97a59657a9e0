//! Token count estimation for backends that do not report usage

/// Average characters per token for BPE vocabularies on mixed text
const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text`: one token per four characters, rounded
/// up, and never less than one for non-empty input.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Token accounting for one finished request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenCount {
    pub prompt: usize,
    pub completion: usize,
}

impl TokenCount {
    /// Prefer figures reported by the backend; estimate the prompt and count
    /// delivered fragments otherwise.
    pub fn resolve(
        prompt: &str,
        delivered_fragments: usize,
        reported: Option<crate::native::TokenUsage>,
    ) -> Self {
        match reported {
            Some(usage) => Self {
                prompt: usage.prompt_tokens,
                completion: usage.completion_tokens,
            },
            None => Self {
                prompt: estimate_tokens(prompt),
                completion: delivered_fragments,
            },
        }
    }

    pub fn total(&self) -> usize {
        self.prompt + self.completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::TokenUsage;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // counts characters, not bytes
        assert_eq!(estimate_tokens("日本語です"), 2);
    }

    #[test]
    fn test_resolve_prefers_reported_usage() {
        let reported = TokenUsage {
            prompt_tokens: 12,
            completion_tokens: 30,
        };
        let count = TokenCount::resolve("whatever", 5, Some(reported));
        assert_eq!(count, TokenCount { prompt: 12, completion: 30 });
        assert_eq!(count.total(), 42);

        let count = TokenCount::resolve("abcdefgh", 5, None);
        assert_eq!(count, TokenCount { prompt: 2, completion: 5 });
    }
}
