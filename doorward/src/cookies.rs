//! Cookie header codec.
//!
//! Parsing is deliberately forgiving: malformed percent-encoding falls back to
//! the raw substring instead of failing the request, and `filter` preserves the
//! surviving entries verbatim (original spelling and order) rather than
//! re-encoding them.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::collections::HashMap;

/// Matches the characters `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn decode(raw: &str) -> String {
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn encode(raw: &str) -> String {
    utf8_percent_encode(raw, COMPONENT).to_string()
}

/// Parse a raw `Cookie` header into a name → value mapping.
///
/// Splits on `;`, trims each entry, splits on the first `=` and
/// percent-decodes key and value independently. A later duplicate wins.
pub fn parse(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();

    for entry in header.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (entry, ""),
        };
        cookies.insert(decode(key), decode(value));
    }

    cookies
}

/// Drop every cookie whose decoded name is in `names`, keeping the rest of the
/// header byte-for-byte.
pub fn filter(header: &str, names: &[&str]) -> String {
    if names.is_empty() {
        return header.to_string();
    }

    header
        .split(';')
        .filter(|entry| {
            let key = entry.split('=').next().unwrap_or("").trim();
            !names.contains(&decode(key).as_str())
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Serialize a `Set-Cookie` value scoped to the whole site and hidden from
/// scripts.
pub fn set_cookie(name: &str, value: &str) -> String {
    format!("{}={}; Path=/; HttpOnly", encode(name), encode(value))
}

/// Serialize a `Set-Cookie` value instructing the browser to delete the cookie.
pub fn clear_cookie(name: &str) -> String {
    format!("{}=deleted; Path=/; expires=Thu, 01 Jan 1970 00:00:00 GMT", encode(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let cookies = parse("session=abc; other=1");
        assert_eq!(cookies.get("session").unwrap(), "abc");
        assert_eq!(cookies.get("other").unwrap(), "1");
    }

    #[test]
    fn test_parse_decodes_components() {
        let cookies = parse("na%20me=va%3Blue");
        assert_eq!(cookies.get("na me").unwrap(), "va;lue");
    }

    #[test]
    fn test_parse_value_keeps_later_equals() {
        let cookies = parse("token=a=b=c");
        assert_eq!(cookies.get("token").unwrap(), "a=b=c");
    }

    #[test]
    fn test_parse_invalid_encoding_falls_back_to_raw() {
        // %zz is not valid percent-encoding and %ff is not valid UTF-8
        let cookies = parse("bad%zz=1; worse=%ff");
        assert_eq!(cookies.get("bad%zz").unwrap(), "1");
        assert_eq!(cookies.get("worse").unwrap(), "%ff");
    }

    #[test]
    fn test_parse_skips_empty_entries_and_trims() {
        let cookies = parse(" ; a=1 ;; b = 2 ");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("a").unwrap(), "1");
        assert_eq!(cookies.get("b").unwrap(), "2");
    }

    #[test]
    fn test_parse_entry_without_equals() {
        let cookies = parse("flag");
        assert_eq!(cookies.get("flag").unwrap(), "");
    }

    #[test]
    fn test_filter_removes_named_cookies() {
        let filtered = filter("session=abc; other=1; csrf=xyz", &["session", "csrf"]);
        assert_eq!(filtered, " other=1");
    }

    #[test]
    fn test_filter_preserves_raw_spelling() {
        // the survivor keeps its original (encoded) spelling
        let filtered = filter("se%73sion=abc; ot%68er=1", &["session"]);
        assert_eq!(filtered, " ot%68er=1");
    }

    #[test]
    fn test_filter_without_names_is_identity() {
        let header = "a=1; b=2";
        assert_eq!(filter(header, &[]), header);
    }

    #[test]
    fn test_set_cookie_attributes() {
        let cookie = set_cookie("doorward", "abc123");
        assert_eq!(cookie, "doorward=abc123; Path=/; HttpOnly");
    }

    #[test]
    fn test_set_cookie_encodes_value() {
        let cookie = set_cookie("door ward", "a;b");
        assert!(cookie.starts_with("door%20ward=a%3Bb;"));
    }

    #[test]
    fn test_clear_cookie_expires_in_the_past() {
        let cookie = clear_cookie("doorward");
        assert!(cookie.contains("expires=Thu, 01 Jan 1970 00:00:00 GMT"));
        assert!(cookie.starts_with("doorward=deleted;"));
    }
}
