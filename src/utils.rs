// src/utils.rs
use crate::payment::location::ORDER_ID_PARAM;

/// Normalize an application path for route matching: query and fragment are
/// dropped, a single leading slash is enforced and trailing slashes removed.
pub fn normalize_route_path(path: &str) -> String {
    let path = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed.to_lowercase())
    }
}

/// True when `path` is `prefix` or lies beneath it, on segment boundaries.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Shorten a bearer token for display.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Append `order_id` to an application URL, as the processor does on return.
pub fn with_order_id(url: &str, order_id: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(url).ok()?;
    url.query_pairs_mut().append_pair(ORDER_ID_PARAM, order_id);
    Some(url.to_string())
}
