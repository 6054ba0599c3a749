use std::fmt;

/// A single SIP header. The original spelling of the name is preserved for
/// emission; comparisons are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into().trim().to_string(),
            value: value.into().trim().to_string(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// RFC 3261 token grammar for header field names.
    pub fn is_token(name: &str) -> bool {
        !name.is_empty()
            && name.bytes().all(|b| {
                b.is_ascii_alphanumeric()
                    || matches!(
                        b,
                        b'!' | b'#'
                            | b'$'
                            | b'%'
                            | b'&'
                            | b'\''
                            | b'*'
                            | b'+'
                            | b'-'
                            | b'.'
                            | b'^'
                            | b'_'
                            | b'`'
                            | b'|'
                            | b'~'
                    )
            })
    }

    /// Checks the name against the token grammar and the value for raw
    /// control bytes (0x00-0x08, 0x0A-0x1F, 0x7F).
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !Self::is_token(&self.name) {
            return Err(format!("header name is not a valid token: {:?}", self.name));
        }
        if self
            .value
            .bytes()
            .any(|b| matches!(b, 0x00..=0x08 | 0x0A..=0x1F | 0x7F))
        {
            return Err(format!("header value contains control bytes: {}", self.name));
        }
        Ok(())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Ordered header collection with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Replaces the first header with the same name in place, or appends.
    pub fn unique_push(&mut self, header: Header) {
        if let Some(existing) = self.0.iter_mut().find(|h| h.is(&header.name)) {
            existing.value = header.value;
        } else {
            self.0.push(header);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().filter(move |h| h.is(name)).map(|h| h.value.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.is(name));
    }

    pub fn retain(&mut self, f: impl FnMut(&Header) -> bool) {
        self.0.retain(f);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Headers(headers)
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
