//! Topic-exchange pattern matching.
//!
//! `*` matches exactly one segment and `#` matches zero or more segments.

use crate::namespace::{DELIMITER, MULTI_WORD_WILDCARD, SINGLE_WORD_WILDCARD};

/// Whether `routing_key` is routed to a binding with `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split(DELIMITER).collect();
    let key: Vec<&str> = routing_key.split(DELIMITER).collect();

    matches_segments(&pattern, &key)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),

        Some((&MULTI_WORD_WILDCARD, rest)) => {
            (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..]))
        }

        Some((&SINGLE_WORD_WILDCARD, rest)) => key
            .split_first()
            .is_some_and(|(_, key_rest)| matches_segments(rest, key_rest)),

        Some((word, rest)) => key
            .split_first()
            .is_some_and(|(segment, key_rest)| segment == word && matches_segments(rest, key_rest)),
    }
}
