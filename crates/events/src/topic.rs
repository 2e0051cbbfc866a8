//! Topic-style routing key patterns.
//!
//! Keys are dot-separated words. In a pattern `*` matches exactly one word and `#`
//! matches zero or more words, as on a topic exchange.

/// Whether `key` matches `pattern`.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` swallows 0..=len words; try the shortest first.
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::matches;

    #[test]
    fn exact_keys() {
        assert!(matches("user.created", "user.created"));
        assert!(!matches("user.created", "user.deleted"));
        assert!(!matches("user.created", "user.created.v2"));
    }

    #[test]
    fn star_matches_one_word() {
        assert!(matches("user.*", "user.created"));
        assert!(!matches("user.*", "user"));
        assert!(!matches("user.*", "user.created.v2"));
        assert!(matches("*.created", "order.created"));
    }

    #[test]
    fn hash_matches_any_number_of_words() {
        assert!(matches("#", "anything.at.all"));
        assert!(matches("user.#", "user"));
        assert!(matches("user.#", "user.profile.updated"));
        assert!(matches("#.failed", "payment.capture.failed"));
        assert!(matches("order.#.shipped", "order.shipped"));
        assert!(matches("order.#.shipped", "order.eu.express.shipped"));
        assert!(!matches("order.#.shipped", "order.eu.delivered"));
    }
}
