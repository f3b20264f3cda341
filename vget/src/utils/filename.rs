//! Filename sanitization for artifact naming.

/// Characters that are invalid in filenames on at least one platform.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const MAX_STEM_CHARS: usize = 120;

/// Sanitize a media title for use as a filename stem.
///
/// Control and invalid characters collapse to a single underscore, leading
/// and trailing dots/spaces are trimmed, and overlong names are cut so the
/// extension and partial-file suffixes still fit. An unusable input yields
/// `"download"`.
pub fn sanitize_stem(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed: String = result
        .trim_matches(|c| c == ' ' || c == '.')
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();

    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed
    }
}
