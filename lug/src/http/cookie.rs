//! Cookie header parsing and Set-Cookie formatting

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

/// Parse a `Cookie:` request header into name → value pairs
pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for pair in header.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((name, value)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    cookies
}

/// Options for one outgoing cookie
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub expires: Option<chrono::DateTime<chrono::FixedOffset>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

/// Format a `Set-Cookie:` header value
pub fn format_set_cookie(options: &CookieOptions) -> String {
    let mut parts = vec![format!("{}={}", options.name, options.value)];
    if let Some(path) = &options.path {
        parts.push(format!("Path={path}"));
    }
    if let Some(domain) = &options.domain {
        parts.push(format!("Domain={domain}"));
    }
    if let Some(max_age) = options.max_age {
        parts.push(format!("Max-Age={max_age}"));
    }
    if let Some(expires) = &options.expires {
        parts.push(format!("Expires={}", expires.with_timezone(&Utc).format("%a, %d %b %Y %H:%M:%S GMT")));
    }
    if options.secure {
        parts.push("Secure".to_string());
    }
    if options.http_only {
        parts.push("HttpOnly".to_string());
    }
    if let Some(same_site) = &options.same_site {
        parts.push(format!("SameSite={same_site}"));
    }
    parts.join("; ")
}

/// A `Set-Cookie:` value that deletes the named cookie
pub fn format_delete_cookie(name: &str) -> String {
    let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_default();
    format!(
        "{name}=; Path=/; Max-Age=0; Expires={}",
        epoch.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}
