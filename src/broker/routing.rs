//! Topic-exchange routing-key pattern matching.
//!
//! AMQP-style semantics over `.`-separated words:
//! - `*` matches exactly one word
//! - `#` matches zero or more words

/// Does `pattern` match `routing_key`?
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    matches_from(&pattern_parts, &key_parts)
}

fn matches_from(pattern: &[&str], key: &[&str]) -> bool {
    let mut pi = 0;
    let mut ki = 0;

    while pi < pattern.len() {
        let pp = pattern[pi];

        if pp == "#" {
            // # at the end matches everything remaining
            if pi == pattern.len() - 1 {
                return true;
            }
            // # in the middle: try the rest of the pattern at each position
            for ki_try in ki..=key.len() {
                if matches_from(&pattern[pi + 1..], &key[ki_try..]) {
                    return true;
                }
            }
            return false;
        }

        if ki >= key.len() {
            return false;
        }

        if pp == "*" || pp == key[ki] {
            pi += 1;
            ki += 1;
            continue;
        }

        return false;
    }

    pi == pattern.len() && ki == key.len()
}
