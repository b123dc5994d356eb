//! Filename derivation and sanitization for written images.

use std::path::{Component, Path};

use url::Url;

/// Sanitizes a full filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters) with `_`, and rewrites
/// names that would resolve to `.` or `..`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Reduces arbitrary text to a compact filename component.
///
/// Runs of separators collapse to one `_`; leading/trailing `_` and `.` are
/// stripped, so the result is never a dot segment. May return an empty string.
#[must_use]
pub fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches(|c| c == '_' || c == '.').to_string()
}

/// Derives a filename from the last path segment of a URL.
///
/// Query string and fragment are ignored. Falls back to
/// `<host>_<hash of url>.bin` when the path has no usable segment.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.into(), |d| d);
        return sanitize_filename(&decoded);
    }

    let host = url
        .host_str()
        .map(|h| sanitize_filename_component(&h.replace('.', "-")))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "image".to_string());
    format!("{host}_{}.bin", short_digest(url.as_str()))
}

fn short_digest(value: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(&Sha256::digest(value.as_bytes())[..6])
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.jpg"), "file_name.jpg");
        assert_eq!(sanitize_filename("file\\name.jpg"), "file_name.jpg");
        assert_eq!(sanitize_filename("file:name.jpg"), "file_name.jpg");
        assert_eq!(sanitize_filename("file<name>.jpg"), "file_name_.jpg");
        assert_eq!(sanitize_filename("file|name.jpg"), "file_name.jpg");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename(""), "_");
    }

    #[test]
    fn test_sanitize_filename_component_collapses_separators() {
        assert_eq!(sanitize_filename_component("blue  sky / rain"), "blue_sky_rain");
        assert_eq!(sanitize_filename_component("rating:safe"), "rating_safe");
        assert_eq!(sanitize_filename_component("../etc"), "etc");
        assert_eq!(sanitize_filename_component(".."), "");
        assert_eq!(sanitize_filename_component("???"), "");
    }

    #[test]
    fn test_filename_from_url_uses_last_segment_without_query() {
        let url = Url::parse("https://cdn.example.com/data/ab/cd/abcdef.jpg?e=123&m=x").unwrap();
        assert_eq!(filename_from_url(&url), "abcdef.jpg");
    }

    #[test]
    fn test_filename_from_url_decodes_percent_escapes() {
        let url = Url::parse("https://cdn.example.com/a%20b.png").unwrap();
        assert_eq!(filename_from_url(&url), "a b.png");
    }

    #[test]
    fn test_filename_from_url_fallback_is_stable() {
        let url = Url::parse("https://cdn.example.com/").unwrap();
        let name = filename_from_url(&url);
        assert!(name.starts_with("cdn-example-com_"), "got {name}");
        assert!(name.ends_with(".bin"));
        assert_eq!(name, filename_from_url(&url));
    }
}
