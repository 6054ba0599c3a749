//! URI parsing and serialization tests

use crate::message::{Scheme, Uri};

#[test]
fn test_parse_basic_uri() {
    let uri = Uri::try_from("sip:alice@example.com").unwrap();
    assert_eq!(uri.scheme, Scheme::Sip);
    assert_eq!(uri.user.as_deref(), Some("alice"));
    assert_eq!(uri.host, "example.com");
    assert_eq!(uri.port, None);
    assert!(!uri.is_secure());
}

#[test]
fn test_parse_full_uri() {
    let uri = Uri::try_from("sips:bob:secret@host.test:5061;transport=tcp;lr?subject=call").unwrap();
    assert_eq!(uri.scheme, Scheme::Sips);
    assert_eq!(uri.user.as_deref(), Some("bob"));
    assert_eq!(uri.password.as_deref(), Some("secret"));
    assert_eq!(uri.host, "host.test");
    assert_eq!(uri.port, Some(5061));
    assert_eq!(uri.param("transport"), Some(Some("tcp")));
    // bare flag parameter
    assert_eq!(uri.param("lr"), Some(None));
    assert_eq!(uri.headers, vec![("subject".to_string(), "call".to_string())]);
    assert!(uri.is_secure());
}

#[test]
fn test_parse_host_only() {
    let uri = Uri::try_from("sip:ex.test:5060").unwrap();
    assert_eq!(uri.user, None);
    assert_eq!(uri.host, "ex.test");
    assert_eq!(uri.port, Some(5060));
}

#[test]
fn test_parse_ipv6_host() {
    let uri = Uri::try_from("sip:alice@[2001:db8::1]:5060").unwrap();
    assert_eq!(uri.host, "2001:db8::1");
    assert_eq!(uri.port, Some(5060));
    assert_eq!(uri.host_with_port(), "[2001:db8::1]:5060");
}

#[test]
fn test_scheme_is_lowercased() {
    let uri = Uri::try_from("SIP:alice@example.com").unwrap();
    assert_eq!(uri.scheme, Scheme::Sip);
    assert!(uri.to_string().starts_with("sip:"));
}

#[test]
fn test_unknown_scheme_rejected() {
    assert!(Uri::try_from("http://example.com").is_err());
    assert!(Uri::try_from("tel:+15551234567").is_err());
}

#[test]
fn test_empty_host_rejected() {
    assert!(Uri::try_from("sip:").is_err());
    assert!(Uri::try_from("sip:alice@").is_err());
    assert!(Uri::try_from("").is_err());
}

#[test]
fn test_invalid_port_rejected() {
    assert!(Uri::try_from("sip:host:99999").is_err());
    assert!(Uri::try_from("sip:host:abc").is_err());
}

#[test]
fn test_percent_decoded_headers() {
    let uri = Uri::try_from("sip:carol@chicago.com?subject=project%20x&priority=urgent").unwrap();
    assert_eq!(
        uri.headers,
        vec![
            ("subject".to_string(), "project x".to_string()),
            ("priority".to_string(), "urgent".to_string()),
        ]
    );
}

#[test]
fn test_serialize_is_fixed_point() {
    for input in [
        "sip:alice@example.com",
        "sip:ex.test:5060",
        "sips:bob:pw@host.test:5061;transport=tcp;lr",
        "sip:alice@[2001:db8::1]:5060",
    ] {
        let uri = Uri::try_from(input).unwrap();
        assert_eq!(uri.to_string(), input);
        let again = Uri::try_from(uri.to_string().as_str()).unwrap();
        assert_eq!(again, uri);
    }
}

#[test]
fn test_param_lookup_is_case_insensitive() {
    let uri = Uri::try_from("sip:host;Transport=udp").unwrap();
    assert_eq!(uri.param("transport"), Some(Some("udp")));
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn parse_never_panics(input in ".*") {
            let _ = Uri::try_from(input.as_str());
        }

        #[test]
        fn parsed_uris_round_trip(
            user in "[a-z][a-z0-9]{0,8}",
            host in "[a-z][a-z0-9.]{0,12}[a-z0-9]",
            port in 1u16..65535u16,
        ) {
            let input = format!("sip:{user}@{host}:{port}");
            let uri = Uri::try_from(input.as_str()).unwrap();
            prop_assert_eq!(uri.to_string(), input);
        }
    }
}
