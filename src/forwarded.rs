//! C1 — header / `X-Forwarded-*` parser (§4.1).
//!
//! Case-insensitive header lookup, first comma-separated value, port parsed
//! only if the address header was present, never panics on malformed input.

use crate::scope::{Address, ScopeHeader};

/// Resolves the effective `(client_addr, scheme)` pair for a connection,
/// taking proxy headers into account when configured.
///
/// `fallback` is the address/scheme observed directly on the transport
/// (the TCP peer and whether TLS terminated here). If `address_header` is
/// `None`, `fallback` is returned unchanged — proxy parsing is off.
pub fn resolve_client(
    headers: &[ScopeHeader],
    address_header: Option<&str>,
    port_header: Option<&str>,
    proto_header: Option<&str>,
    fallback: &Address,
    fallback_scheme: &str,
) -> (Address, String) {
    let Some(address_header) = address_header else {
        return (fallback.clone(), fallback_scheme.to_string());
    };

    let mut addr = fallback.clone();
    let mut scheme = fallback_scheme.to_string();

    if let Some(value) = find_header(headers, address_header) {
        let first = value.split(',').next().unwrap_or("").trim().to_string();
        addr = (first, 0);

        if let Some(port_header) = port_header {
            if let Some(port_value) = find_header(headers, port_header) {
                if let Ok(port) = port_value.trim().parse::<u16>() {
                    addr.1 = port;
                }
            }
        }

        if let Some(proto_header) = proto_header {
            if let Some(proto_value) = find_header(headers, proto_header) {
                scheme = proto_value.trim().to_string();
            }
        }
    }

    (addr, scheme)
}

/// Case-insensitive lookup of the first matching header's value as UTF-8
/// (lossy, since proxy header values are not guaranteed ASCII in the wild).
fn find_header<'h>(headers: &'h [ScopeHeader], name: &str) -> Option<std::borrow::Cow<'h, str>> {
    let name = name.as_bytes();
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| String::from_utf8_lossy(&h.value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<ScopeHeader> {
        pairs
            .iter()
            .map(|(n, v)| ScopeHeader::new(n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn disabled_returns_fallback_unchanged() {
        let fallback: Address = ("10.0.0.1".into(), 4000);
        let (addr, scheme) = resolve_client(&[], None, None, None, &fallback, "http");
        assert_eq!(addr, fallback);
        assert_eq!(scheme, "http");
    }

    #[test]
    fn takes_first_comma_separated_entry() {
        let h = headers(&[("X-Forwarded-For", "203.0.113.1, 10.0.0.2")]);
        let fallback: Address = ("127.0.0.1".into(), 0);
        let (addr, _) = resolve_client(
            &h,
            Some("X-Forwarded-For"),
            Some("X-Forwarded-Port"),
            None,
            &fallback,
            "http",
        );
        assert_eq!(addr.0, "203.0.113.1");
        assert_eq!(addr.1, 0);
    }

    #[test]
    fn port_only_applied_when_address_header_present() {
        let h = headers(&[("X-Forwarded-Port", "8443")]);
        let fallback: Address = ("127.0.0.1".into(), 0);
        let (addr, _) = resolve_client(
            &h,
            Some("X-Forwarded-For"),
            Some("X-Forwarded-Port"),
            None,
            &fallback,
            "http",
        );
        // Address header absent: fallback kept verbatim, port header ignored.
        assert_eq!(addr, fallback);
    }

    #[test]
    fn invalid_port_is_silently_ignored() {
        let h = headers(&[
            ("X-Forwarded-For", "203.0.113.1"),
            ("X-Forwarded-Port", "not-a-port"),
        ]);
        let fallback: Address = ("127.0.0.1".into(), 0);
        let (addr, _) = resolve_client(
            &h,
            Some("X-Forwarded-For"),
            Some("X-Forwarded-Port"),
            None,
            &fallback,
            "http",
        );
        assert_eq!(addr.0, "203.0.113.1");
        assert_eq!(addr.1, 0);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = headers(&[("x-forwarded-for", "203.0.113.9")]);
        let fallback: Address = ("127.0.0.1".into(), 0);
        let (addr, _) = resolve_client(
            &h,
            Some("X-Forwarded-For"),
            None,
            None,
            &fallback,
            "http",
        );
        assert_eq!(addr.0, "203.0.113.9");
    }

    #[test]
    fn proto_header_overrides_scheme() {
        let h = headers(&[
            ("X-Forwarded-For", "203.0.113.1"),
            ("X-Forwarded-Proto", "https"),
        ]);
        let fallback: Address = ("127.0.0.1".into(), 0);
        let (_, scheme) = resolve_client(
            &h,
            Some("X-Forwarded-For"),
            None,
            Some("X-Forwarded-Proto"),
            &fallback,
            "http",
        );
        assert_eq!(scheme, "https");
    }
}
