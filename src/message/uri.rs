use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// URI scheme. Only `sip` and `sips` are accepted; anything else is a
/// parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP URI: `sip[s]:[user[:password]@]host[:port][;params][?headers]`.
///
/// Parameters keep their order and may be bare flags (value `None`).
/// URI headers (the `?name=value&...` section) are stored percent-decoded
/// and re-encoded on emission. The host is stored without IPv6 brackets;
/// they are restored when the URI is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
    pub headers: Vec<(String, String)>,
}

impl Uri {
    /// Convenience constructor for a plain `sip:user@host` URI.
    pub fn sip(user: &str, host: &str) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: Some(user.to_string()),
            host: host.to_string(),
            ..Default::default()
        }
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// Host and port in `host:port` form, brackets restored for IPv6.
    pub fn host_with_port(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }

    /// Looks up a URI parameter. Returns `Some(None)` for bare flags.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

impl TryFrom<&str> for Uri {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let raw = value.trim();
        if raw.is_empty() {
            return Err(Error::UriError("empty uri".to_string()));
        }

        let (scheme_part, rest) = raw
            .split_once(':')
            .ok_or_else(|| Error::UriError(format!("missing scheme: {raw}")))?;
        let scheme = match scheme_part.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            other => return Err(Error::UriError(format!("unknown scheme: {other}"))),
        };

        // Headers come last, after '?'.
        let (rest, headers_part) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h)),
            None => (rest, None),
        };
        let mut headers = Vec::new();
        if let Some(headers_part) = headers_part {
            for entry in headers_part.split('&') {
                if let Some((name, value)) = entry.split_once('=') {
                    let decoded = urlencoding::decode(value)
                        .map_err(|e| Error::UriError(format!("bad header encoding: {e}")))?;
                    headers.push((name.to_string(), decoded.into_owned()));
                }
            }
        }

        // Parameters, after ';'.
        let (rest, params_part) = match rest.split_once(';') {
            Some((r, p)) => (r, Some(p)),
            None => (rest, None),
        };
        let mut params = Vec::new();
        if let Some(params_part) = params_part {
            for param in params_part.split(';') {
                if param.is_empty() {
                    continue;
                }
                match param.split_once('=') {
                    Some((name, value)) => params.push((name.to_string(), Some(value.to_string()))),
                    None => params.push((param.to_string(), None)),
                }
            }
        }

        // user[:password]@host[:port]
        let (user, password, host_part) = match rest.rsplit_once('@') {
            Some((user_part, host_part)) => match user_part.split_once(':') {
                Some((user, password)) => {
                    (Some(user.to_string()), Some(password.to_string()), host_part)
                }
                None => (Some(user_part.to_string()), None, host_part),
            },
            None => (None, None, rest),
        };

        let (host, port) = if let Some(stripped) = host_part.strip_prefix('[') {
            let (host, after) = stripped
                .split_once(']')
                .ok_or_else(|| Error::UriError(format!("unterminated IPv6 host: {host_part}")))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(
                    p.parse::<u16>()
                        .map_err(|_| Error::UriError(format!("invalid port: {p}")))?,
                ),
                None => None,
            };
            (host.to_string(), port)
        } else if let Some((host, port)) = host_part.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::UriError(format!("invalid port: {port}")))?;
            (host.to_string(), Some(port))
        } else {
            (host_part.to_string(), None)
        };

        if host.is_empty() {
            return Err(Error::UriError(format!("empty host: {raw}")));
        }

        Ok(Uri {
            scheme,
            user,
            password,
            host,
            port,
            params,
            headers,
        })
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uri::try_from(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}")?;
            if let Some(password) = &self.password {
                write!(f, ":{password}")?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host_with_port())?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{name}={value}")?,
                None => write!(f, ";{name}")?,
            }
        }
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={}", urlencoding::encode(value))?;
        }
        Ok(())
    }
}
