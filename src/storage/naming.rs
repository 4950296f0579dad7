use url::Url;

use crate::ingest::hasher::ContentHash;

/// Longest directory name we emit, in bytes. Well under NAME_MAX (255).
const MAX_DIR_BYTES: usize = 120;
const MAX_DOMAIN_TOKEN: usize = 40;

/// Trims, collapses internal whitespace and lowercases.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Directory name for a query's images.
///
/// Letters and digits of any script are kept; whitespace and punctuation
/// become `_`; control and bidi formatting characters are dropped. When
/// anything was changed the name gets an 8-hex-digit digest of the normalized
/// query, so distinct queries never share a directory.
pub fn query_dir_name(query: &str) -> String {
    let normalized = normalize_query(query);

    let mut name = String::new();
    let mut last_was_sep = true;
    for c in normalized.chars() {
        if c.is_control() || is_bidi_format(c) {
            continue;
        }
        if c.is_alphanumeric() || c == '-' {
            if name.len() + c.len_utf8() > MAX_DIR_BYTES {
                break;
            }
            name.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            if name.len() + 1 > MAX_DIR_BYTES {
                break;
            }
            name.push('_');
            last_was_sep = true;
        }
    }
    let name = name.trim_matches('_').to_string();

    if !name.is_empty() && name == normalized {
        return name;
    }
    let digest = ContentHash::of_bytes(normalized.as_bytes()).to_string();
    if name.is_empty() {
        format!("query-{}", &digest[..8])
    } else {
        format!("{}-{}", name, &digest[..8])
    }
}

fn is_bidi_format(c: char) -> bool {
    matches!(c, '\u{200E}' | '\u{200F}' | '\u{061C}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

/// Lowercased host of a URL, or an empty string when it has none.
pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Filesystem-safe token for a domain: `www.example.com` becomes `example_com`.
pub fn domain_token(domain: &str) -> String {
    let host = domain.strip_prefix("www.").unwrap_or(domain);
    let mut token = String::new();
    for c in host.chars() {
        if token.len() >= MAX_DOMAIN_TOKEN {
            break;
        }
        if c.is_ascii_alphanumeric() {
            token.push(c.to_ascii_lowercase());
        } else if !token.ends_with('_') {
            token.push('_');
        }
    }
    let token = token.trim_matches('_');
    if token.is_empty() {
        "unknown".to_string()
    } else {
        token.to_string()
    }
}
