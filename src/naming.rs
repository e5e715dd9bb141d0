pub const PREFIX_SEPARATOR: &str = "__";

const DESCRIPTION_LIMIT: usize = 120;

/// Lower-cases a server name, collapses every run of non-alphanumeric
/// characters into a single `_`, and trims leading/trailing separators.
/// An empty result is rejected at server-creation time by the store.
pub fn normalize_prefix(server_name: &str) -> String {
    let mut out = String::with_capacity(server_name.len());
    let mut pending_separator = false;
    for ch in server_name.chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            for lowered in ch.to_lowercase() {
                out.push(lowered);
            }
        } else {
            pending_separator = true;
        }
    }
    out
}

pub fn prefixed_name(prefix: &str, original: &str) -> String {
    format!("{prefix}{PREFIX_SEPARATOR}{original}")
}

/// Splits a prefixed name at the first `__`. Both halves must be non-empty.
pub fn parse_prefixed_name(name: &str) -> Option<(&str, &str)> {
    let (prefix, original) = name.split_once(PREFIX_SEPARATOR)?;
    if prefix.is_empty() || original.is_empty() {
        return None;
    }
    Some((prefix, original))
}

pub fn annotate_description(server_name: &str, description: &str) -> String {
    format!("[{server_name}] {description}")
}

/// Truncates a description to at most 120 characters, preferring to cut at
/// the last whitespace boundary within the last 40% of the window, and
/// appends a single ellipsis when anything was dropped.
pub fn compact_description(description: &str) -> String {
    let chars: Vec<char> = description.chars().collect();
    if chars.len() <= DESCRIPTION_LIMIT {
        return description.to_string();
    }

    let window = &chars[..DESCRIPTION_LIMIT];
    let earliest_cut = DESCRIPTION_LIMIT - (DESCRIPTION_LIMIT * 2 / 5);
    let cut = window
        .iter()
        .rposition(|ch| ch.is_whitespace())
        .filter(|index| *index >= earliest_cut)
        .unwrap_or(DESCRIPTION_LIMIT);

    let mut out: String = window[..cut].iter().collect();
    out.truncate(out.trim_end().len());
    out.push('…');
    out
}
