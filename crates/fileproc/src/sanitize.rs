//! Helpers for sanitizing data before it enters log lines and span attributes.
//!
//! Input paths and callback URLs routinely carry user names, upload ids and
//! signed tokens; only the non-sensitive parts are logged.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Strips userinfo and the query string from a callback URL.
///
/// - `https://user:pw@hooks.example.com/x?sig=abc` → `https://****@hooks.example.com/x?****`
/// - `https://hooks.example.com/x` → unchanged
pub fn redact_url(url: &str) -> String {
    let (base, had_query) = match url.split_once('?') {
        Some((base, _)) => (base, true),
        None => (url, false),
    };

    let mut out = match base.find("://") {
        Some(scheme_end) => {
            let after_scheme = &base[scheme_end + 3..];
            let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
            match after_scheme[..authority_end].rfind('@') {
                Some(at_pos) => format!(
                    "{}****@{}",
                    &base[..scheme_end + 3],
                    &after_scheme[at_pos + 1..]
                ),
                None => base.to_string(),
            }
        }
        None => base.to_string(),
    };

    if had_query {
        out.push_str("?****");
    }
    out
}
