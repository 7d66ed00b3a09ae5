//! Stream subject matching
//!
//! Subjects are dot-separated tokens. In a pattern, `*` matches exactly one
//! token and a trailing `>` matches one or more remaining tokens.

/// Whether `subject` is matched by `pattern`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(s)) if !s.is_empty() => continue,
            (Some(p), Some(s)) if p == s && !s.is_empty() => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether `pattern` is a well-formed subject or subject filter
pub fn is_valid_subject(pattern: &str) -> bool {
    let tokens: Vec<&str> = pattern.split('.').collect();
    tokens.iter().enumerate().all(|(i, t)| {
        !t.is_empty() && (*t != ">" || i == tokens.len() - 1) && !t.contains(char::is_whitespace)
    })
}
