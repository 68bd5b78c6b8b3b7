//! AMQP topic routing-key patterns.
//!
//! Keys are dot-delimited words. In a binding pattern `*` matches exactly one
//! word and `#` matches zero or more words.

/// Returns true when `pattern` is a well-formed binding pattern: non-empty
/// words, with `*` and `#` only ever appearing as whole words.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    pattern.split('.').all(|word| {
        !word.is_empty()
            && (word == "*" || word == "#" || !word.contains(['*', '#']))
    })
}

/// Returns true when `routing_key` matches the binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };

    // reachable[j]: the pattern prefix consumed so far can match key[..j]
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for word in &pattern {
        let mut next = vec![false; key.len() + 1];
        match *word {
            "#" => {
                let mut seen = false;
                for j in 0..=key.len() {
                    seen |= reachable[j];
                    next[j] = seen;
                }
            }
            "*" => {
                for j in 0..key.len() {
                    next[j + 1] = reachable[j];
                }
            }
            literal => {
                for j in 0..key.len() {
                    next[j + 1] = reachable[j] && key[j] == literal;
                }
            }
        }
        reachable = next;
    }

    reachable[key.len()]
}

/// Returns true when `routing_key` matches any of `patterns`.
pub fn matches_any<S: AsRef<str>>(patterns: &[S], routing_key: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| matches(pattern.as_ref(), routing_key))
}
