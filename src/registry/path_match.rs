//! Segment-wise file path matching
//!
//! A pattern selects a file when its segment sequence occurs as a
//! contiguous, whole-segment subsequence of the file's segments. This is
//! deliberately stricter than substring matching: `abc/def` must not match
//! `x/abcd/def/file.rs` or `x/abc/defg/file.rs`.

/// Normalize a path for matching: strip leading slashes, convert
/// backslashes to forward slashes, strip trailing slashes.
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified.trim_matches('/').to_string()
}

/// Whether `pattern` matches `file_path` segment-wise
///
/// Both inputs are normalized before comparison. A pattern with more
/// segments than the file can never match.
pub fn matches(file_path: &str, pattern: &str) -> bool {
    let file = normalize(file_path);
    let pattern = normalize(pattern);

    let file_segments: Vec<&str> = file.split('/').collect();
    let pattern_segments: Vec<&str> = pattern.split('/').collect();

    if pattern_segments.is_empty() || pattern_segments.len() > file_segments.len() {
        return false;
    }

    file_segments
        .windows(pattern_segments.len())
        .any(|window| window == pattern_segments.as_slice())
}
