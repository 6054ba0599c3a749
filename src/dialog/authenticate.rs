//! Digest authentication (RFC 2617 / RFC 7616) for 401/407 challenges,
//! and the re-issue of a challenged request through a fresh transaction.

use crate::message::{Header, Method, Response, StatusCode};
use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    make_cnonce,
    transaction::Transaction,
};
use crate::{Error, Result};
use digest::Digest;
use md5::Md5;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Authentication credentials for one account.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Restricts the credential to one realm; `None` makes it the
    /// default for any realm that challenges us.
    pub realm: Option<String>,
}

/// Hash algorithm of a Digest challenge. MD5 is the default when the
/// challenge names none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "MD5-SESS" => Ok(DigestAlgorithm::Md5Sess),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Ok(DigestAlgorithm::Sha256Sess),
            other => Err(Error::AuthError(format!("unsupported algorithm: {other}"))),
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                hex_encode(Md5::digest(data.as_bytes()).as_slice())
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex_encode(Sha256::digest(data.as_bytes()).as_slice())
            }
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        };
        f.write_str(name)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parses the header value, e.g.
    /// `Digest realm="r", nonce="n1", qop="auth"`. Values may be
    /// quoted-string or token.
    pub fn parse(header_value: &str) -> Result<Self> {
        let params_str = header_value
            .trim()
            .strip_prefix("Digest ")
            .unwrap_or(header_value);
        let params = parse_auth_params(params_str);

        let realm = params
            .get("realm")
            .ok_or_else(|| Error::AuthError("challenge without realm".to_string()))?
            .clone();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| Error::AuthError("challenge without nonce".to_string()))?
            .clone();
        let algorithm = match params.get("algorithm") {
            Some(value) => DigestAlgorithm::parse(value)?,
            None => DigestAlgorithm::default(),
        };
        Ok(DigestChallenge {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            algorithm,
            qop: params.get("qop").cloned(),
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

/// Parses `key=value` / `key="value"` comma-separated parameter lists.
fn parse_auth_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut remaining = s.trim();

    while !remaining.is_empty() {
        remaining = remaining.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if remaining.is_empty() {
            break;
        }
        let Some(eq_pos) = remaining.find('=') else {
            break;
        };
        let key = remaining[..eq_pos].trim().to_ascii_lowercase();
        remaining = remaining[eq_pos + 1..].trim_start();

        let value;
        if let Some(quoted) = remaining.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    value = quoted[..end].to_string();
                    remaining = &quoted[end + 1..];
                }
                None => {
                    value = quoted.to_string();
                    remaining = "";
                }
            }
        } else {
            let end = remaining
                .find(|c: char| c == ',' || c.is_whitespace())
                .unwrap_or(remaining.len());
            value = remaining[..end].to_string();
            remaining = &remaining[end..];
        }
        params.insert(key, value);
    }
    params
}

/// Computes Digest responses and tracks per-nonce counters.
///
/// Credentials are looked up by realm; a credential registered without a
/// realm serves as the fallback for any challenge. The `nc` counter is
/// strictly increasing per nonce, as RFC 7616 requires.
#[derive(Debug, Default)]
pub struct DigestAuthenticator {
    credentials: HashMap<String, (String, String)>,
    default_credential: Option<(String, String)>,
    nonce_counts: HashMap<String, u32>,
}

impl DigestAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_credential(&mut self, credential: Credential) {
        match credential.realm {
            Some(realm) => {
                self.credentials
                    .insert(realm, (credential.username, credential.password));
            }
            None => {
                self.default_credential = Some((credential.username, credential.password));
            }
        }
    }

    pub fn add_credentials(&mut self, realm: &str, username: &str, password: &str) {
        self.credentials
            .insert(realm.to_string(), (username.to_string(), password.to_string()));
    }

    fn credential_for(&self, realm: &str) -> Option<(String, String)> {
        self.credentials
            .get(realm)
            .or(self.default_credential.as_ref())
            .cloned()
    }

    pub fn has_credential_for(&self, realm: &str) -> bool {
        self.credential_for(realm).is_some()
    }

    fn next_nonce_count(&mut self, nonce: &str) -> u32 {
        let count = self.nonce_counts.entry(nonce.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Computes the `Authorization`/`Proxy-Authorization` header value
    /// answering `challenge` for the given request method, URI and body.
    pub fn authorization_for(
        &mut self,
        method: Method,
        uri: &str,
        challenge: &DigestChallenge,
        body: Option<&[u8]>,
    ) -> Result<String> {
        let (username, password) = self.credential_for(&challenge.realm).ok_or_else(|| {
            Error::AuthError(format!("no credentials for realm: {}", challenge.realm))
        })?;

        let algorithm = challenge.algorithm;
        let cnonce = make_cnonce();
        let nc = self.next_nonce_count(&challenge.nonce);

        let mut ha1 = algorithm.hash(&format!("{username}:{}:{password}", challenge.realm));
        if algorithm.is_session() {
            ha1 = algorithm.hash(&format!("{ha1}:{}:{cnonce}", challenge.nonce));
        }

        let qop = challenge.qop.as_deref().map(|q| {
            if q.split(',').any(|t| t.trim() == "auth-int") && !q.split(',').any(|t| t.trim() == "auth") {
                "auth-int"
            } else {
                "auth"
            }
        });

        let ha2 = match qop {
            Some("auth-int") => {
                let body_hash = algorithm.hash(&String::from_utf8_lossy(body.unwrap_or_default()));
                algorithm.hash(&format!("{method}:{uri}:{body_hash}"))
            }
            _ => algorithm.hash(&format!("{method}:{uri}")),
        };

        let response = match qop {
            Some(qop) => algorithm.hash(&format!(
                "{ha1}:{}:{nc:08x}:{cnonce}:{qop}:{ha2}",
                challenge.nonce
            )),
            None => algorithm.hash(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\", algorithm={algorithm}",
            challenge.realm, challenge.nonce
        );
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        if let Some(qop) = qop {
            header.push_str(&format!(", qop={qop}, nc={nc:08x}, cnonce=\"{cnonce}\""));
        }
        debug!("computed digest response for realm {}", challenge.realm);
        Ok(header)
    }
}

/// Re-issues a challenged request through a new client transaction: same
/// method, URI, From, To, Call-ID and body, but a fresh Via branch, the
/// CSeq bumped to `new_seq`, and the computed authorization header.
///
/// The challenged transaction is consumed; its termination cleans up the
/// old branch.
pub async fn handle_client_authenticate(
    new_seq: u32,
    tx: Transaction,
    resp: &Response,
    authenticator: &Mutex<DigestAuthenticator>,
) -> Result<Transaction> {
    let proxy = resp.status_code == StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    let challenge_header = if proxy {
        "Proxy-Authenticate"
    } else {
        "WWW-Authenticate"
    };
    let challenge_value = resp.headers.get(challenge_header).ok_or_else(|| {
        Error::AuthError(format!("{} response without {challenge_header}", resp.status_code))
    })?;
    let challenge = DigestChallenge::parse(challenge_value)?;

    let mut request = tx.original.clone();
    let uri_string = request.uri.to_string();
    let body = if request.body.is_empty() {
        None
    } else {
        Some(request.body.as_slice())
    };
    let authorization = authenticator
        .lock()
        .unwrap()
        .authorization_for(request.method, &uri_string, &challenge, body)?;

    let via = tx.endpoint_inner.get_via()?;
    request.headers.unique_push(via);
    request
        .headers
        .unique_push(Header::new("CSeq", format!("{new_seq} {}", request.method)));
    let authorization_header = if proxy {
        "Proxy-Authorization"
    } else {
        "Authorization"
    };
    request
        .headers
        .unique_push(Header::new(authorization_header, authorization));

    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let connection = tx.connection.clone();
    let destination = tx.destination.clone();
    let endpoint_inner = tx.endpoint_inner.clone();
    drop(tx);

    let mut new_tx = Transaction::new_client(key, request, endpoint_inner, connection);
    new_tx.destination = destination;
    Ok(new_tx)
}
