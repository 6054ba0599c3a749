//! SDP session description codec (RFC 8866 subset) and the RFC 3264
//! offer/answer negotiator.
//!
//! The parser recognizes `v`, `o`, `s`, `c`, `t` at session level; an `m`
//! line opens a new media block and subsequent lines attach to it. Media
//! attributes parsed into structure are `rtpmap`, `fmtp`, the four
//! direction attributes and `rtcp-mux`; everything else is preserved
//! verbatim so a parse/serialize round trip keeps the description intact.

use crate::{Error, Result};
use std::fmt;

pub mod negotiate;

#[cfg(test)]
mod tests;

pub use negotiate::{
    build_answer, build_offer, negotiate, CodecSpec, MediaCapability, NegotiatedFormat,
    NegotiatedMedia, SessionCapability,
};

/// Media stream direction. The session-level default is `sendrecv` and is
/// inherited by media without an explicit direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn from_attr(name: &str) -> Option<Direction> {
        match name {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// The direction seen from the other side of the stream.
    pub fn reversed(&self) -> Direction {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `a=rtpmap` entry binding an RTP payload type to a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtpmap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock: u32,
    pub channels: u16,
}

impl Rtpmap {
    /// The codec identity used for intersection: lowercased name, clock
    /// rate and channel count.
    pub fn key(&self) -> (String, u32, u16) {
        (self.encoding.to_ascii_lowercase(), self.clock, self.channels)
    }
}

impl fmt::Display for Rtpmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.payload_type, self.encoding, self.clock)?;
        if self.channels > 1 {
            write!(f, "/{}", self.channels)?;
        }
        Ok(())
    }
}

/// The `o=` origin line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

impl Default for Origin {
    fn default() -> Self {
        Origin {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            address: "127.0.0.1".to_string(),
        }
    }
}

/// One `m=` block with its attached lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: String,
    pub port: u16,
    pub protocol: String,
    /// Payload type tokens in m-line order.
    pub formats: Vec<String>,
    /// Per-media `c=` address, overriding the session connection.
    pub connection: Option<String>,
    pub direction: Option<Direction>,
    pub rtcp_mux: bool,
    pub rtpmaps: Vec<Rtpmap>,
    /// Raw fmtp parameter strings keyed by payload type, in line order.
    pub fmtps: Vec<(u8, String)>,
    /// Unrecognized attributes, preserved in order.
    pub attributes: Vec<(String, Option<String>)>,
}

impl MediaDescription {
    pub fn new(kind: &str, port: u16) -> Self {
        MediaDescription {
            kind: kind.to_string(),
            port,
            protocol: "RTP/AVP".to_string(),
            formats: Vec::new(),
            connection: None,
            direction: None,
            rtcp_mux: false,
            rtpmaps: Vec::new(),
            fmtps: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn rtpmap(&self, payload_type: u8) -> Option<&Rtpmap> {
        self.rtpmaps.iter().find(|r| r.payload_type == payload_type)
    }

    pub fn fmtp(&self, payload_type: u8) -> Option<&str> {
        self.fmtps
            .iter()
            .find(|(pt, _)| *pt == payload_type)
            .map(|(_, params)| params.as_str())
    }
}

/// A complete SDP session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u8,
    pub origin: Origin,
    pub name: String,
    pub connection: Option<String>,
    pub timing: (u64, u64),
    pub direction: Option<Direction>,
    /// Unrecognized session-level attributes, preserved in order.
    pub attributes: Vec<(String, Option<String>)>,
    pub media: Vec<MediaDescription>,
}

impl Default for SdpSession {
    fn default() -> Self {
        SdpSession {
            version: 0,
            origin: Origin::default(),
            name: "-".to_string(),
            connection: None,
            timing: (0, 0),
            direction: None,
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }
}

impl SdpSession {
    /// The effective direction of a media description, falling back to
    /// the session level and finally to `sendrecv`.
    pub fn effective_direction(&self, media: &MediaDescription) -> Direction {
        media
            .direction
            .or(self.direction)
            .unwrap_or(Direction::SendRecv)
    }

    /// The effective connection address of a media description.
    pub fn effective_connection<'a>(&'a self, media: &'a MediaDescription) -> Option<&'a str> {
        media.connection.as_deref().or(self.connection.as_deref())
    }

    pub fn parse(input: &str) -> Result<SdpSession> {
        let mut session = SdpSession::default();
        let mut saw_version = false;
        let mut current: Option<MediaDescription> = None;

        for raw_line in input.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| Error::SdpError(format!("line without '=': {line:?}")))?;
            if kind.len() != 1 {
                return Err(Error::SdpError(format!("bad line type: {line:?}")));
            }
            match kind {
                "v" => {
                    session.version = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::SdpError(format!("bad version: {value}")))?;
                    saw_version = true;
                }
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 6 {
                        return Err(Error::SdpError(format!("short origin line: {value}")));
                    }
                    session.origin = Origin {
                        username: parts[0].to_string(),
                        session_id: parts[1].to_string(),
                        session_version: parts[2].to_string(),
                        address: parts[5].to_string(),
                    };
                }
                "s" => session.name = value.to_string(),
                "c" => {
                    let address = value
                        .split_whitespace()
                        .nth(2)
                        .ok_or_else(|| Error::SdpError(format!("short connection line: {value}")))?
                        .to_string();
                    match current.as_mut() {
                        Some(media) => media.connection = Some(address),
                        None => session.connection = Some(address),
                    }
                }
                "t" => {
                    let mut parts = value.split_whitespace();
                    let start = parts.next().and_then(|v| v.parse().ok());
                    let stop = parts.next().and_then(|v| v.parse().ok());
                    match (start, stop) {
                        (Some(start), Some(stop)) => session.timing = (start, stop),
                        _ => return Err(Error::SdpError(format!("bad timing line: {value}"))),
                    }
                }
                "m" => {
                    if let Some(done) = current.take() {
                        session.media.push(done);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 4 {
                        return Err(Error::SdpError(format!("short media line: {value}")));
                    }
                    let port: u16 = parts[1]
                        .parse()
                        .map_err(|_| Error::SdpError(format!("bad media port: {}", parts[1])))?;
                    let mut media = MediaDescription::new(parts[0], port);
                    media.protocol = parts[2].to_string();
                    media.formats = parts[3..].iter().map(|s| s.to_string()).collect();
                    current = Some(media);
                }
                "a" => {
                    let (name, attr_value) = match value.split_once(':') {
                        Some((name, v)) => (name, Some(v)),
                        None => (value, None),
                    };
                    parse_attribute(&mut session, &mut current, name.trim(), attr_value);
                }
                // Bandwidth, repeat times and the like are tolerated and
                // dropped; round-trip guarantees cover only the parsed set.
                _ => {}
            }
        }
        if let Some(done) = current.take() {
            session.media.push(done);
        }
        if !saw_version {
            return Err(Error::SdpError("missing v= line".to_string()));
        }
        for media in &session.media {
            if media.formats.is_empty() {
                return Err(Error::SdpError(format!(
                    "media {} has no formats",
                    media.kind
                )));
            }
        }
        Ok(session)
    }
}

fn parse_attribute(
    session: &mut SdpSession,
    current: &mut Option<MediaDescription>,
    name: &str,
    value: Option<&str>,
) {
    if let Some(direction) = Direction::from_attr(name) {
        match current.as_mut() {
            Some(media) => media.direction = Some(direction),
            None => session.direction = Some(direction),
        }
        return;
    }
    match (name, value, current.as_mut()) {
        ("rtcp-mux", _, Some(media)) => media.rtcp_mux = true,
        ("rtpmap", Some(value), Some(media)) => {
            if let Some(rtpmap) = parse_rtpmap(value) {
                media.rtpmaps.push(rtpmap);
            }
        }
        ("fmtp", Some(value), Some(media)) => {
            if let Some((pt, params)) = value.split_once(' ') {
                if let Ok(pt) = pt.trim().parse::<u8>() {
                    media.fmtps.push((pt, params.trim().to_string()));
                }
            }
        }
        (name, value, Some(media)) => media
            .attributes
            .push((name.to_string(), value.map(str::to_string))),
        (name, value, None) => session
            .attributes
            .push((name.to_string(), value.map(str::to_string))),
    }
}

fn parse_rtpmap(value: &str) -> Option<Rtpmap> {
    let (pt, rest) = value.trim().split_once(' ')?;
    let payload_type = pt.trim().parse().ok()?;
    let mut fields = rest.trim().split('/');
    let encoding = fields.next()?.to_string();
    let clock = fields.next()?.parse().ok()?;
    let channels = match fields.next() {
        Some(ch) => ch.parse().ok()?,
        None => 1,
    };
    Some(Rtpmap {
        payload_type,
        encoding,
        clock,
        channels,
    })
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v={}\r", self.version)?;
        writeln!(
            f,
            "o={} {} {} IN IP4 {}\r",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address
        )?;
        writeln!(f, "s={}\r", self.name)?;
        if let Some(connection) = &self.connection {
            writeln!(f, "c=IN IP4 {connection}\r")?;
        }
        writeln!(f, "t={} {}\r", self.timing.0, self.timing.1)?;
        if let Some(direction) = self.direction {
            writeln!(f, "a={direction}\r")?;
        }
        for (name, value) in &self.attributes {
            match value {
                Some(value) => writeln!(f, "a={name}:{value}\r")?,
                None => writeln!(f, "a={name}\r")?,
            }
        }
        for media in &self.media {
            write!(f, "m={} {} {}", media.kind, media.port, media.protocol)?;
            for format in &media.formats {
                write!(f, " {format}")?;
            }
            writeln!(f, "\r")?;
            if let Some(connection) = &media.connection {
                writeln!(f, "c=IN IP4 {connection}\r")?;
            }
            if let Some(direction) = media.direction {
                writeln!(f, "a={direction}\r")?;
            }
            if media.rtcp_mux {
                writeln!(f, "a=rtcp-mux\r")?;
            }
            for rtpmap in &media.rtpmaps {
                writeln!(f, "a=rtpmap:{rtpmap}\r")?;
            }
            for (pt, params) in &media.fmtps {
                writeln!(f, "a=fmtp:{pt} {params}\r")?;
            }
            for (name, value) in &media.attributes {
                match value {
                    Some(value) => writeln!(f, "a={name}:{value}\r")?,
                    None => writeln!(f, "a={name}\r")?,
                }
            }
        }
        Ok(())
    }
}
