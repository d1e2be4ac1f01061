// src/sanitize.rs
// Masks identifiers and tokens in subprocess output before it reaches the terminal or logs.

use regex::Regex;
use std::sync::OnceLock;

fn guid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
        )
        .expect("GUID pattern is a valid regex")
    })
}

/// Truncates every GUID-shaped substring to its first 8 characters.
pub fn mask_guids(text: &str) -> String {
    guid_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            format!("{}...", &caps[0][..8])
        })
        .into_owned()
}

/// Prepares subprocess stderr for display: strips terminal escapes, masks
/// GUIDs and trims surrounding whitespace.
pub fn mask_sensitive(text: &str) -> String {
    let plain = strip_ansi_escapes::strip_str(text);
    mask_guids(plain.trim())
}
