// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subject naming and wildcard matching.
//!
//! Subjects are dot-separated tokens. In patterns `*` matches exactly one
//! token and `>` (only valid as the last token) matches one or more tokens.

/// Replace every character that is not allowed in a subject with `_`.
///
/// Allowed: ASCII letters, digits, `_`, `-`, `.`, and the wildcards `*` and `>`.
pub fn safe_subject(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '*' | '>') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Join a cluster prefix and a logical name into a full subject.
pub fn prefixed(prefix: &str, name: &str) -> String {
    format!("{prefix}.{name}")
}

/// Strip `<prefix>.` from a subject, if present.
pub fn strip_prefix<'a>(prefix: &str, subject: &'a str) -> &'a str {
    subject
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(subject)
}

/// Check whether `subject` matches `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(token)) => {
                if token.is_empty() {
                    return false;
                }
            }
            (Some(expected), Some(token)) => {
                if expected != token {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
