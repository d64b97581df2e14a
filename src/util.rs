//! Shared utility functions used across the codebase.

/// Parse an environment-style boolean value.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// any other present value is `false`, and `None` maps to `default`.
pub fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

/// Truncate `text` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

/// Keep the last `max_chars` characters of `text`, prefixing `...` when cut.
///
/// Failure output usually ends with the interesting part, so excerpts keep the tail.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", tail)
}

#[inline]
fn ascii_lower(byte: u8) -> u8 {
    match byte {
        b'A'..=b'Z' => byte + 32,
        _ => byte,
    }
}

fn starts_with_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .iter()
            .zip(needle)
            .all(|(h, n)| ascii_lower(*h) == ascii_lower(*n))
}

fn find_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() || needle.is_empty() {
        return None;
    }

    (0..=haystack.len() - needle.len())
        .find(|&idx| starts_with_ascii_case_insensitive(&haystack[idx..], needle))
}

/// ASCII case-insensitive substring test without allocating a lowered copy.
#[inline]
pub fn contains_ascii_case_insensitive(haystack: &str, needle: &str) -> bool {
    find_ascii_case_insensitive(haystack.as_bytes(), needle.as_bytes()).is_some()
}
