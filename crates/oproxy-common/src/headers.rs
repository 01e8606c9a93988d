/// Header lists as relayed between downstream and upstream. Order is
/// preserved; names compare case-insensitively.
pub type Headers = Vec<(String, String)>;

/// RFC 7230 hop-by-hop headers, plus `host`: meaningful only for a single
/// transport hop, never forwarded in either direction.
pub const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Everything except hop-by-hop: the shared half of both forwarding
/// directions (request filtering additionally drops the downstream bearer).
pub fn without_hop_by_hop(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .cloned()
        .collect()
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Replaces the first case-insensitive match, or appends. Proxy-set headers
/// (`Authorization`, `X-Proxy-Model`, `X-Proxy-Upstream`) go through here so
/// a client-supplied spelling cannot smuggle a second value past the filter.
pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(&name))
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("X-Proxy-Model".to_string(), "old".to_string())];
        header_set(&mut headers, "x-proxy-model", "m1");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "X-PROXY-MODEL"), Some("m1"));
    }

    #[test]
    fn set_appends_when_absent() {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", "Bearer k");
        assert_eq!(header_get(&headers, "authorization"), Some("Bearer k"));
    }

    #[test]
    fn hop_by_hop_classification_is_case_insensitive() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("HOST"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-stream-key"));
    }

    #[test]
    fn without_hop_by_hop_keeps_end_to_end_headers_in_order() {
        let headers: Headers = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Upgrade".to_string(), "h2c".to_string()),
            ("X-Stream-Key".to_string(), "sk1".to_string()),
        ];
        let kept = without_hop_by_hop(&headers);
        assert_eq!(
            kept,
            vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Stream-Key".to_string(), "sk1".to_string()),
            ]
        );
    }
}
