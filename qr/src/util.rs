//! Small shared helpers

/// True for `None`, empty, or whitespace-only strings
pub fn is_blank(s: Option<&str>) -> bool {
    s.map(|s| s.trim().is_empty()).unwrap_or(true)
}

/// Filter a script slot down to something worth executing
pub fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

/// Truncate a string for log/event summaries, on a char boundary
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}
