//! HTTP parsing utilities: request heads, query strings, URL escaping and
//! the three supported Range forms.

use std::collections::HashMap;

/// Find the end of HTTP headers (position after \r\n\r\n or \n\n).
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(3) {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    // Some clients send bare \n\n.
    for i in 0..data.len().saturating_sub(1) {
        if &data[i..i + 2] == b"\n\n" {
            return Some(i + 2);
        }
    }
    None
}

/// Parse Content-Length out of a raw header block. Absent or garbled
/// means no body.
pub fn parse_content_length(headers: &str) -> usize {
    for line in headers.lines() {
        let lower = line.to_lowercase();
        if lower.starts_with("content-length:") {
            if let Some(value) = line.split(':').nth(1) {
                if let Ok(len) = value.trim().parse::<usize>() {
                    return len;
                }
            }
        }
    }
    0
}

/// The parsed first line + headers of a request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Decoded path portion, query stripped.
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names lowercased.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the raw head bytes (everything before the blank line).
    pub fn parse(raw: &str) -> Option<RequestHead> {
        let mut lines = raw.lines();
        let first = lines.next()?;
        let mut parts = first.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?;

        let (raw_path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let path = url_decode(raw_path)?;
        let query = raw_query.map(parse_query).unwrap_or_default();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_lowercase(), value.trim().to_string()));
            }
        }

        Some(RequestHead {
            method,
            path,
            query,
            headers,
        })
    }
}

/// Parse an `a=b&c=d` query string, percent-decoding both sides. In
/// query strings (only) `+` means a space. Pairs that fail to decode
/// are dropped.
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    let decode = |s: &str| url_decode(&s.replace('+', "%20"));
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if let (Some(k), Some(v)) = (decode(k), decode(v)) {
            out.insert(k, v);
        }
    }
    out
}

/// Percent-encode a single path segment or query value.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Percent-decode a path segment. Returns None on malformed escapes or
/// non-UTF8 results. A literal `+` stays a `+` here; only query
/// strings treat it as a space.
pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = (bytes.get(i + 1).copied()? as char).to_digit(16)?;
                let lo = (bytes.get(i + 2).copied()? as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// A resolved byte range: start offset and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub count: u64,
}

impl ResolvedRange {
    /// Inclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.count - 1
    }
}

/// Resolve a `Range` header value against a file length.
///
/// The three supported forms: `bytes=A-` (skip A bytes), `bytes=-B`
/// (last B bytes), `bytes=A-B` (inclusive span). Multi-range is not
/// supported. Malformed or out-of-range requests yield None and the
/// caller degrades to a full 200 response.
pub fn resolve_range(header: &str, length: u64) -> Option<ResolvedRange> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;

    let resolved = match (start_str.is_empty(), end_str.is_empty()) {
        // bytes=A-
        (false, true) => {
            let start: u64 = start_str.parse().ok()?;
            ResolvedRange {
                start,
                count: length.checked_sub(start)?,
            }
        }
        // bytes=-B
        (true, false) => {
            let suffix: u64 = end_str.parse().ok()?;
            ResolvedRange {
                start: length.checked_sub(suffix)?,
                count: suffix,
            }
        }
        // bytes=A-B
        (false, false) => {
            let start: u64 = start_str.parse().ok()?;
            let end: u64 = end_str.parse().ok()?;
            ResolvedRange {
                start,
                count: end.checked_add(1)?.checked_sub(start)?,
            }
        }
        (true, true) => return None,
    };

    if resolved.count == 0 || resolved.start.checked_add(resolved.count)? > length {
        return None;
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_forms() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\n\nbody"), Some(16));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn content_length() {
        assert_eq!(parse_content_length("Content-Length: 42\r\n"), 42);
        assert_eq!(parse_content_length("content-length:7"), 7);
        assert_eq!(parse_content_length("Host: x"), 0);
    }

    #[test]
    fn request_head_parses() {
        let head = RequestHead::parse(
            "GET /browse/bob%20smith?q=foo+bar HTTP/1.1\r\nHost: x\r\nfs2-port: 41234\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/browse/bob smith");
        assert_eq!(head.query["q"], "foo bar");
        assert_eq!(head.header("FS2-Port"), Some("41234"));
        assert_eq!(head.header("missing"), None);
    }

    #[test]
    fn request_head_rejects_garbage() {
        assert!(RequestHead::parse("").is_none());
        assert!(RequestHead::parse("GET").is_none());
    }

    #[test]
    fn url_encode_decode_round_trip() {
        let cases = ["plain", "with space", "slash/and&amp", "ünïcode", "100%", "a+b"];
        for case in cases {
            assert_eq!(url_decode(&url_encode(case)).as_deref(), Some(case));
        }
    }

    #[test]
    fn plus_is_literal_in_paths_but_space_in_queries() {
        assert_eq!(url_decode("a+b").as_deref(), Some("a+b"));
        let query = parse_query("q=a+b");
        assert_eq!(query["q"], "a b");
    }

    #[test]
    fn url_decode_rejects_bad_escapes() {
        assert_eq!(url_decode("%"), None);
        assert_eq!(url_decode("%2"), None);
        assert_eq!(url_decode("%zz"), None);
    }

    #[test]
    fn range_start_only() {
        let r = resolve_range("bytes=100-", 1000).unwrap();
        assert_eq!(r, ResolvedRange { start: 100, count: 900 });
        assert_eq!(r.end(), 999);
    }

    #[test]
    fn range_suffix() {
        let r = resolve_range("bytes=-100", 1000).unwrap();
        assert_eq!(r, ResolvedRange { start: 900, count: 100 });
    }

    #[test]
    fn range_span() {
        let r = resolve_range("bytes=100-199", 1000).unwrap();
        assert_eq!(r, ResolvedRange { start: 100, count: 100 });
        assert_eq!(r.end(), 199);
    }

    #[test]
    fn range_degrades_out_of_bounds() {
        assert_eq!(resolve_range("bytes=2000-", 1000), None);
        assert_eq!(resolve_range("bytes=-2000", 1000), None);
        assert_eq!(resolve_range("bytes=900-1200", 1000), None);
        assert_eq!(resolve_range("bytes=200-100", 1000), None);
        assert_eq!(resolve_range("bytes=0-99,200-", 1000), None);
        assert_eq!(resolve_range("items=0-99", 1000), None);
        assert_eq!(resolve_range("bytes=-", 1000), None);
    }
}
