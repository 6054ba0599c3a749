use super::header::{Header, Headers};
use super::uri::Uri;
use super::{Method, StatusCode, Version};
use crate::{Error, Result};
use std::fmt;

const REQUIRED_REQUEST_HEADERS: [&str; 6] = ["Via", "From", "To", "Call-ID", "CSeq", "Max-Forwards"];

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: StatusCode,
    pub reason_phrase: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    /// New response with the canonical reason phrase and no headers.
    pub fn new(status_code: StatusCode) -> Self {
        Response {
            status_code,
            reason_phrase: status_code.reason_phrase().to_string(),
            version: Version::V2,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

/// Either a request or a response; exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_headers(lines: std::str::Split<'_, &str>) -> Result<Headers> {
    let mut list: Vec<Header> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header value.
            let last = list.last_mut().ok_or_else(|| {
                Error::SipMessageError("continuation line before any header".to_string())
            })?;
            last.value.push(' ');
            last.value.push_str(line.trim());
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            Error::SipMessageError(format!("header line without colon: {line:?}"))
        })?;
        if name.trim().is_empty() {
            return Err(Error::SipMessageError("empty header name".to_string()));
        }
        list.push(Header::new(name, value));
    }
    Ok(Headers::from(list))
}

impl TryFrom<&[u8]> for SipMessage {
    type Error = Error;

    /// Parses a SIP message from raw bytes. The body is bounded by
    /// `Content-Length` when the header is present; trailing bytes beyond
    /// it are ignored.
    fn try_from(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::SipMessageError("empty message".to_string()));
        }
        if !buf.windows(2).any(|w| w == b"\r\n") {
            return Err(Error::SipMessageError("missing CRLF delimiter".to_string()));
        }
        let (head, rest) = match find_header_end(buf) {
            Some(pos) => (&buf[..pos], &buf[pos + 4..]),
            None => (buf, &buf[buf.len()..]),
        };
        let head = std::str::from_utf8(head)
            .map_err(|_| Error::SipMessageError("message head is not valid text".to_string()))?;

        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::SipMessageError("missing start line".to_string()))?;

        let headers = parse_headers(lines)?;

        let body = match headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(len) => rest[..rest.len().min(len)].to_vec(),
            None => rest.to_vec(),
        };

        if start_line.starts_with("SIP/") {
            let mut parts = start_line.splitn(3, ' ');
            let _version = parts.next();
            let code = parts
                .next()
                .ok_or_else(|| Error::SipMessageError("malformed status line".to_string()))?;
            let code: u16 = code
                .trim()
                .parse()
                .map_err(|_| Error::SipMessageError(format!("unparseable status code: {code}")))?;
            if !(100..=699).contains(&code) {
                return Err(Error::SipMessageError(format!(
                    "status code out of range: {code}"
                )));
            }
            Ok(SipMessage::Response(Response {
                status_code: StatusCode(code),
                reason_phrase: parts.next().unwrap_or("").to_string(),
                version: Version::V2,
                headers,
                body,
            }))
        } else {
            let mut parts = start_line.splitn(3, ' ');
            let method: Method = parts
                .next()
                .ok_or_else(|| Error::SipMessageError("malformed request line".to_string()))?
                .parse()?;
            let uri = Uri::try_from(
                parts
                    .next()
                    .ok_or_else(|| Error::SipMessageError("request line without uri".to_string()))?,
            )?;
            let version = parts
                .next()
                .ok_or_else(|| Error::SipMessageError("request line without version".to_string()))?;
            if !version.starts_with("SIP/") {
                return Err(Error::SipMessageError(format!(
                    "unexpected protocol version: {version}"
                )));
            }
            Ok(SipMessage::Request(Request {
                method,
                uri,
                version: Version::V2,
                headers,
                body,
            }))
        }
    }
}

fn write_message(out: &mut Vec<u8>, start_line: String, headers: &Headers, body: &[u8]) {
    out.extend_from_slice(start_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    for header in headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() && headers.get("Content-Length").is_none() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

impl Request {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        write_message(
            &mut out,
            format!("{} {} {}", self.method, self.uri, self.version),
            &self.headers,
            &self.body,
        );
        out
    }

    /// Structural validation: required headers present, header names are
    /// tokens, values carry no control bytes, Request-URI host non-empty.
    /// All failures are reported, not just the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut reasons = Vec::new();
        for name in REQUIRED_REQUEST_HEADERS {
            if self.headers.get(name).is_none() {
                reasons.push(format!("missing required header: {name}"));
            }
        }
        for header in &self.headers {
            if let Err(reason) = header.validate() {
                reasons.push(reason);
            }
        }
        if self.uri.host.is_empty() {
            reasons.push("request-uri host is empty".to_string());
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        write_message(
            &mut out,
            format!("{} {} {}", self.version, self.status_code, self.reason_phrase),
            &self.headers,
            &self.body,
        );
        out
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut reasons = Vec::new();
        for header in &self.headers {
            if let Err(reason) = header.validate() {
                reasons.push(reason);
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}

/// Extracts a `;name=value` parameter from a header value.
pub(crate) fn header_param(value: &str, name: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let needle = format!("{}=", name.to_ascii_lowercase());
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find(&needle) {
        let abs = search_from + pos;
        if lower[..abs].trim_end().ends_with(';') {
            let rest = &value[abs + needle.len()..];
            let end = rest.find([';', '>', ',']).unwrap_or(rest.len());
            return Some(rest[..end].trim().to_string());
        }
        search_from = abs + needle.len();
    }
    None
}

/// Extracts the URI part of a From/To/Contact header value: the content of
/// the angle brackets when present, the value up to the first `;` otherwise.
pub(crate) fn uri_part(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return &value[start + 1..end];
        }
    }
    let end = value.find(';').unwrap_or(value.len());
    value[..end].trim()
}

/// Convenience accessors shared by requests and responses.
pub trait HeadersExt {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;
    fn body(&self) -> &[u8];

    fn call_id(&self) -> Option<&str> {
        self.headers().get("Call-ID")
    }

    fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.headers().get("CSeq")?;
        let (seq, method) = value.trim().split_once(char::is_whitespace)?;
        Some((seq.trim().parse().ok()?, method.trim().parse().ok()?))
    }

    fn from_header(&self) -> Option<&str> {
        self.headers().get("From")
    }

    fn to_header(&self) -> Option<&str> {
        self.headers().get("To")
    }

    fn from_tag(&self) -> Option<String> {
        header_param(self.from_header()?, "tag")
    }

    fn to_tag(&self) -> Option<String> {
        header_param(self.to_header()?, "tag")
    }

    fn top_via(&self) -> Option<&str> {
        self.headers().get("Via")
    }

    fn via_branch(&self) -> Option<String> {
        header_param(self.top_via()?, "branch")
    }

    fn contact_header(&self) -> Option<&str> {
        self.headers().get("Contact")
    }

    fn contact_uri(&self) -> Option<Uri> {
        Uri::try_from(uri_part(self.contact_header()?)).ok()
    }

    fn record_routes(&self) -> Vec<String> {
        self.headers()
            .get_all("Record-Route")
            .map(str::to_string)
            .collect()
    }

    fn expires(&self) -> Option<u32> {
        self.headers().get("Expires")?.trim().parse().ok()
    }

    fn content_type(&self) -> Option<&str> {
        self.headers().get("Content-Type")
    }
}

impl HeadersExt for Request {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

impl HeadersExt for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}
