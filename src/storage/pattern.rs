use glob::{MatchOptions, Pattern};

const KEY_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Glob-style matcher for logical storage keys (`conversation:*:context`).
///
/// `*` spans any run of characters, including `:` separators, the same way
/// Redis `KEYS` does. A pattern that fails to parse is matched literally.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Glob(Pattern),
    Literal(String),
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Self {
        match Pattern::new(pattern) {
            Ok(p) => Self::Glob(p),
            Err(e) => {
                tracing::debug!(pattern, "invalid key pattern ({e}), matching literally");
                Self::Literal(pattern.to_string())
            }
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Glob(p) => p.matches_with(key, KEY_MATCH),
            Self::Literal(l) => l == key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        let p = KeyPattern::new("*");
        assert!(p.matches("conversation:abc:context"));
        assert!(p.matches("x"));
    }

    #[test]
    fn star_spans_one_segment() {
        let p = KeyPattern::new("conversation:*:context");
        assert!(p.matches("conversation:abc:context"));
        assert!(!p.matches("conversation:abc:messages"));
        assert!(!p.matches("active_conversations:user_123"));
    }

    #[test]
    fn prefix_patterns() {
        let p = KeyPattern::new("active_conversations:*");
        assert!(p.matches("active_conversations:user_123"));
        assert!(!p.matches("conversation:user_123"));
    }

    #[test]
    fn malformed_pattern_is_literal() {
        let p = KeyPattern::new("weird[key");
        assert!(p.matches("weird[key"));
        assert!(!p.matches("weirdkey"));
    }
}
