//! Digest authentication tests, including the RFC 2617 example vector.

use crate::dialog::authenticate::{
    Credential, DigestAlgorithm, DigestAuthenticator, DigestChallenge,
};
use crate::message::Method;
use digest::Digest;
use md5::Md5;

fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let start = header.find(&format!("{name}="))? + name.len() + 1;
    let rest = &header[start..];
    if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next()
    } else {
        rest.split([',', ' ']).next()
    }
}

#[test]
fn test_parse_simple_challenge() {
    let challenge =
        DigestChallenge::parse(r#"Digest realm="asterisk", nonce="1234567890abcdef""#).unwrap();
    assert_eq!(challenge.realm, "asterisk");
    assert_eq!(challenge.nonce, "1234567890abcdef");
    assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
    assert!(challenge.qop.is_none());
    assert!(!challenge.stale);
}

#[test]
fn test_parse_full_challenge() {
    let challenge = DigestChallenge::parse(
        r#"Digest realm="r", nonce="n1", opaque="op", qop="auth", algorithm=SHA-256, stale=true"#,
    )
    .unwrap();
    assert_eq!(challenge.realm, "r");
    assert_eq!(challenge.opaque.as_deref(), Some("op"));
    assert_eq!(challenge.qop.as_deref(), Some("auth"));
    assert_eq!(challenge.algorithm, DigestAlgorithm::Sha256);
    assert!(challenge.stale);
}

#[test]
fn test_parse_challenge_errors() {
    assert!(DigestChallenge::parse(r#"Digest nonce="n""#).is_err());
    assert!(DigestChallenge::parse(r#"Digest realm="r""#).is_err());
    assert!(DigestChallenge::parse(r#"Digest realm="r", nonce="n", algorithm=HMAC"#).is_err());
}

#[test]
fn test_rfc2617_example_response() {
    // The example from RFC 2617 section 3.5 computed without qop.
    let challenge = DigestChallenge::parse(
        r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093""#,
    )
    .unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("testrealm@host.com", "Mufasa", "Circle Of Life");

    // REGISTER stands in for GET; verify against a hand computation
    let header = auth
        .authorization_for(Method::Register, "/dir/index.html", &challenge, None)
        .unwrap();
    let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
    let ha2 = md5_hex("REGISTER:/dir/index.html");
    let expected = md5_hex(&format!(
        "{ha1}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{ha2}"
    ));
    assert_eq!(param(&header, "response"), Some(expected.as_str()));
    assert_eq!(param(&header, "username"), Some("Mufasa"));
    assert!(header.starts_with("Digest "));
    // no qop means no nc or cnonce
    assert!(!header.contains("nc="));
}

#[test]
fn test_qop_auth_response_shape() {
    let challenge =
        DigestChallenge::parse(r#"Digest realm="r", nonce="n1", qop="auth""#).unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("r", "u", "p");

    let header = auth
        .authorization_for(Method::Register, "sip:r", &challenge, None)
        .unwrap();
    assert_eq!(param(&header, "nc"), Some("00000001"));
    let cnonce = param(&header, "cnonce").unwrap().to_string();
    assert_eq!(cnonce.len(), 16);
    assert!(cnonce.chars().all(|c| c.is_ascii_hexdigit()));

    // recompute: HA1=MD5(u:r:p), HA2=MD5(REGISTER:sip:r)
    let ha1 = md5_hex("u:r:p");
    let ha2 = md5_hex("REGISTER:sip:r");
    let expected = md5_hex(&format!("{ha1}:n1:00000001:{cnonce}:auth:{ha2}"));
    assert_eq!(param(&header, "response"), Some(expected.as_str()));
}

#[test]
fn test_nonce_count_strictly_increases() {
    let challenge =
        DigestChallenge::parse(r#"Digest realm="r", nonce="n1", qop="auth""#).unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("r", "u", "p");

    let first = auth
        .authorization_for(Method::Register, "sip:r", &challenge, None)
        .unwrap();
    let second = auth
        .authorization_for(Method::Register, "sip:r", &challenge, None)
        .unwrap();
    assert_eq!(param(&first, "nc"), Some("00000001"));
    assert_eq!(param(&second, "nc"), Some("00000002"));

    // a fresh nonce restarts its counter
    let other = DigestChallenge::parse(r#"Digest realm="r", nonce="n2", qop="auth""#).unwrap();
    let third = auth
        .authorization_for(Method::Register, "sip:r", &other, None)
        .unwrap();
    assert_eq!(param(&third, "nc"), Some("00000001"));
}

#[test]
fn test_md5_sess_uses_cnonce() {
    let challenge =
        DigestChallenge::parse(r#"Digest realm="r", nonce="n1", algorithm=MD5-sess, qop="auth""#)
            .unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("r", "u", "p");
    let header = auth
        .authorization_for(Method::Invite, "sip:b@h", &challenge, None)
        .unwrap();
    let cnonce = param(&header, "cnonce").unwrap().to_string();

    let ha1 = md5_hex(&format!("{}:n1:{cnonce}", md5_hex("u:r:p")));
    let ha2 = md5_hex("INVITE:sip:b@h");
    let expected = md5_hex(&format!("{ha1}:n1:00000001:{cnonce}:auth:{ha2}"));
    assert_eq!(param(&header, "response"), Some(expected.as_str()));
    assert!(header.contains("algorithm=MD5-sess"));
}

#[test]
fn test_auth_int_hashes_body() {
    let challenge =
        DigestChallenge::parse(r#"Digest realm="r", nonce="n1", qop="auth-int""#).unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("r", "u", "p");
    let header = auth
        .authorization_for(Method::Message, "sip:b@h", &challenge, Some(b"hello"))
        .unwrap();
    let cnonce = param(&header, "cnonce").unwrap().to_string();

    let ha1 = md5_hex("u:r:p");
    let ha2 = md5_hex(&format!("MESSAGE:sip:b@h:{}", md5_hex("hello")));
    let expected = md5_hex(&format!("{ha1}:n1:00000001:{cnonce}:auth-int:{ha2}"));
    assert_eq!(param(&header, "response"), Some(expected.as_str()));
    assert!(header.contains("qop=auth-int"));
}

#[test]
fn test_missing_credentials_surface_an_error() {
    let challenge = DigestChallenge::parse(r#"Digest realm="other", nonce="n""#).unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("r", "u", "p");
    assert!(auth
        .authorization_for(Method::Register, "sip:r", &challenge, None)
        .is_err());
}

#[test]
fn test_default_credential_answers_any_realm() {
    let challenge = DigestChallenge::parse(r#"Digest realm="whatever", nonce="n""#).unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credential(Credential {
        username: "u".to_string(),
        password: "p".to_string(),
        realm: None,
    });
    assert!(auth.has_credential_for("whatever"));
    assert!(auth
        .authorization_for(Method::Register, "sip:r", &challenge, None)
        .is_ok());
}

#[test]
fn test_opaque_is_echoed() {
    let challenge =
        DigestChallenge::parse(r#"Digest realm="r", nonce="n", opaque="abc123""#).unwrap();
    let mut auth = DigestAuthenticator::new();
    auth.add_credentials("r", "u", "p");
    let header = auth
        .authorization_for(Method::Register, "sip:r", &challenge, None)
        .unwrap();
    assert!(header.contains(r#"opaque="abc123""#));
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn challenge_parse_never_panics(input in ".*") {
            let _ = DigestChallenge::parse(&input);
        }

        #[test]
        fn responses_are_hex_digests(
            realm in "[a-z]{3,10}",
            nonce in "[a-z0-9]{8,20}",
            user in "[a-z]{3,10}",
            password in "[a-z0-9]{4,16}",
        ) {
            let challenge = DigestChallenge::parse(
                &format!(r#"Digest realm="{realm}", nonce="{nonce}""#)
            ).unwrap();
            let mut auth = DigestAuthenticator::new();
            auth.add_credentials(&realm, &user, &password);
            let header = auth
                .authorization_for(Method::Register, "sip:x", &challenge, None)
                .unwrap();
            let response = param(&header, "response").unwrap();
            prop_assert_eq!(response.len(), 32);
            prop_assert!(response.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
