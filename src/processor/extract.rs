//! Marker-delimited text extraction.
//!
//! Listing pages are scanned, not parsed: find a start marker, take the text
//! up to the next end marker, repeat until no start marker remains before the
//! section boundary. Extractors built on these helpers stay per-source so a
//! markup change only touches one processor.

/// Returns the text between the first `start` marker and the next `end` marker.
#[must_use]
pub fn first_between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(&haystack[from..from + len])
}

/// Returns every `start`..`end` slice in order.
///
/// Scanning stops at the first start marker without a matching end marker.
#[must_use]
pub fn all_between<'a>(haystack: &'a str, start: &str, end: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut rest = haystack;
    while let Some(at) = rest.find(start) {
        let from = at + start.len();
        let Some(len) = rest[from..].find(end) else {
            break;
        };
        found.push(&rest[from..from + len]);
        rest = &rest[from + len + end.len()..];
    }
    found
}

/// Splits `haystack` into records, each starting at one of `markers`.
///
/// A record runs until the next marker or the end of the text, so fields
/// looked up inside a record cannot leak in from its neighbour.
#[must_use]
pub fn records<'a>(haystack: &'a str, markers: &[&str]) -> Vec<&'a str> {
    let next_marker = |text: &str| -> Option<(usize, usize)> {
        markers
            .iter()
            .filter(|marker| !marker.is_empty())
            .filter_map(|marker| text.find(marker).map(|at| (at, marker.len())))
            .min_by_key(|&(at, _)| at)
    };

    let mut found = Vec::new();
    let Some((mut at, _)) = next_marker(haystack) else {
        return found;
    };
    loop {
        let record = &haystack[at..];
        let body_start = next_marker(record).map_or(0, |(_, len)| len);
        match next_marker(&record[body_start..]) {
            Some((next, _)) => {
                let end = body_start + next;
                found.push(&record[..end]);
                at += end;
            }
            None => {
                found.push(record);
                break;
            }
        }
    }
    found
}

/// Undoes the escapes JSON string literals use.
///
/// `\uXXXX` escapes outside the basic plane are left as-is.
#[must_use]
pub fn unescape_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&code);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Undoes the five predefined XML entities.
#[must_use]
pub fn unescape_xml(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
