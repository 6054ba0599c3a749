//! RFC 3264 offer/answer construction and the payload-type mapping
//! produced once both descriptions are known.

use super::{Direction, MediaDescription, Origin, Rtpmap, SdpSession};
use crate::{Error, Result};
use tracing::debug;

const DYNAMIC_PT_RANGE: std::ops::RangeInclusive<u8> = 96..=127;
const TELEPHONE_EVENT: &str = "telephone-event";
const DEFAULT_DTMF_EVENTS: &str = "0-16";

/// One codec the local side can offer or accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSpec {
    pub name: String,
    pub clock: u32,
    pub channels: u16,
    /// Raw fmtp parameter string, e.g. `0-16` for telephone-event.
    pub fmtp: Option<String>,
    /// Static payload type, preserved as-is in offers (0 = PCMU, 8 = PCMA).
    pub static_pt: Option<u8>,
}

impl CodecSpec {
    pub fn pcmu() -> Self {
        CodecSpec {
            name: "PCMU".to_string(),
            clock: 8000,
            channels: 1,
            fmtp: None,
            static_pt: Some(0),
        }
    }

    pub fn pcma() -> Self {
        CodecSpec {
            name: "PCMA".to_string(),
            clock: 8000,
            channels: 1,
            fmtp: None,
            static_pt: Some(8),
        }
    }

    pub fn telephone_event() -> Self {
        CodecSpec {
            name: TELEPHONE_EVENT.to_string(),
            clock: 8000,
            channels: 1,
            fmtp: Some(DEFAULT_DTMF_EVENTS.to_string()),
            static_pt: None,
        }
    }

    pub fn is_telephone_event(&self) -> bool {
        self.name.eq_ignore_ascii_case(TELEPHONE_EVENT)
    }

    pub fn key(&self) -> (String, u32, u16) {
        (self.name.to_ascii_lowercase(), self.clock, self.channels)
    }
}

/// The local capability for one media stream.
#[derive(Debug, Clone)]
pub struct MediaCapability {
    pub kind: String,
    pub port: u16,
    /// Codecs in local preference order. May include telephone-event.
    pub codecs: Vec<CodecSpec>,
    pub direction: Direction,
    pub rtcp_mux: bool,
    /// Preferred payload type for telephone-event in offers.
    pub dtmf_pt: u8,
}

impl MediaCapability {
    /// PCMU + PCMA + telephone-event audio, the classic G.711 profile.
    pub fn audio(port: u16) -> Self {
        MediaCapability {
            kind: "audio".to_string(),
            port,
            codecs: vec![
                CodecSpec::pcmu(),
                CodecSpec::pcma(),
                CodecSpec::telephone_event(),
            ],
            direction: Direction::SendRecv,
            rtcp_mux: false,
            dtmf_pt: 101,
        }
    }
}

/// Everything needed to build an offer or answer for the local side.
#[derive(Debug, Clone)]
pub struct SessionCapability {
    pub origin_user: String,
    pub address: String,
    pub session_name: String,
    pub session_id: u64,
    pub session_version: u64,
    pub media: Vec<MediaCapability>,
}

impl SessionCapability {
    pub fn new(address: &str, media: Vec<MediaCapability>) -> Self {
        SessionCapability {
            origin_user: "-".to_string(),
            address: address.to_string(),
            session_name: "sipkit".to_string(),
            session_id: 0,
            session_version: 0,
            media,
        }
    }
}

fn session_skeleton(cap: &SessionCapability) -> SdpSession {
    SdpSession {
        origin: Origin {
            username: cap.origin_user.clone(),
            session_id: cap.session_id.to_string(),
            session_version: cap.session_version.to_string(),
            address: cap.address.clone(),
        },
        name: cap.session_name.clone(),
        connection: Some(cap.address.clone()),
        ..Default::default()
    }
}

/// Assigns payload types in capability order: static PTs are kept,
/// telephone-event takes the preferred DTMF PT and other dynamic codecs
/// are allocated from 96-127 skipping it.
fn assign_payload_types(media: &MediaCapability) -> Vec<(u8, CodecSpec)> {
    let mut assigned = Vec::with_capacity(media.codecs.len());
    let mut used: Vec<u8> = media
        .codecs
        .iter()
        .filter_map(|c| c.static_pt)
        .chain(std::iter::once(media.dtmf_pt))
        .collect();
    let mut next_dynamic = DYNAMIC_PT_RANGE;
    for codec in &media.codecs {
        let pt = if let Some(pt) = codec.static_pt {
            pt
        } else if codec.is_telephone_event() {
            media.dtmf_pt
        } else {
            loop {
                match next_dynamic.next() {
                    Some(candidate) if used.contains(&candidate) => continue,
                    Some(candidate) => break candidate,
                    None => {
                        debug!("dynamic payload type space exhausted, reusing {}", media.dtmf_pt);
                        break media.dtmf_pt;
                    }
                }
            }
        };
        used.push(pt);
        assigned.push((pt, codec.clone()));
    }
    assigned
}

/// Builds an SDP offer from the local capability.
pub fn build_offer(cap: &SessionCapability) -> SdpSession {
    let mut session = session_skeleton(cap);
    for media_cap in &cap.media {
        let mut media = MediaDescription::new(&media_cap.kind, media_cap.port);
        media.direction = Some(media_cap.direction);
        media.rtcp_mux = media_cap.rtcp_mux;
        for (pt, codec) in assign_payload_types(media_cap) {
            media.formats.push(pt.to_string());
            media.rtpmaps.push(Rtpmap {
                payload_type: pt,
                encoding: codec.name.clone(),
                clock: codec.clock,
                channels: codec.channels,
            });
            if let Some(fmtp) = &codec.fmtp {
                media.fmtps.push((pt, fmtp.clone()));
            }
        }
        session.media.push(media);
    }
    session
}

/// Rtpmap entries of an offered media, with the static G.711 types
/// synthesized when the offer relies on well-known assignments.
fn offered_rtpmaps(media: &MediaDescription) -> Vec<Rtpmap> {
    let mut maps = Vec::new();
    for format in &media.formats {
        let Ok(pt) = format.parse::<u8>() else {
            continue;
        };
        if let Some(rtpmap) = media.rtpmap(pt) {
            maps.push(rtpmap.clone());
        } else if let Some(encoding) = static_encoding(pt) {
            maps.push(Rtpmap {
                payload_type: pt,
                encoding: encoding.to_string(),
                clock: 8000,
                channels: 1,
            });
        }
    }
    maps
}

fn static_encoding(pt: u8) -> Option<&'static str> {
    match pt {
        0 => Some("PCMU"),
        8 => Some("PCMA"),
        _ => None,
    }
}

/// Builds an RFC 3264 answer to `offer` from the local capability.
///
/// Media the local side cannot serve, and media with an empty codec
/// intersection, are answered with port 0 and the offered format list
/// preserved.
pub fn build_answer(cap: &SessionCapability, offer: &SdpSession) -> SdpSession {
    let mut session = session_skeleton(cap);
    for offered in &offer.media {
        let local = cap
            .media
            .iter()
            .find(|mc| mc.kind.eq_ignore_ascii_case(&offered.kind));
        let Some(local) = local else {
            session.media.push(rejected_media(offered));
            continue;
        };

        let offered_maps = offered_rtpmaps(offered);
        // Accepted codecs ordered by local preference; telephone-event is
        // negotiated separately below.
        let mut accepted: Vec<&Rtpmap> = Vec::new();
        for codec in local.codecs.iter().filter(|c| !c.is_telephone_event()) {
            if let Some(remote) = offered_maps.iter().find(|m| m.key() == codec.key()) {
                accepted.push(remote);
            }
        }
        if accepted.is_empty() {
            debug!("no codec intersection for {} media", offered.kind);
            session.media.push(rejected_media(offered));
            continue;
        }

        let mut media = MediaDescription::new(&offered.kind, local.port);
        media.protocol = offered.protocol.clone();
        media.direction = Some(answer_direction(
            offer.effective_direction(offered),
            local.direction,
        ));
        media.rtcp_mux = offered.rtcp_mux && local.rtcp_mux;
        for remote in &accepted {
            media.formats.push(remote.payload_type.to_string());
            media.rtpmaps.push(Rtpmap {
                payload_type: remote.payload_type,
                encoding: remote.encoding.clone(),
                clock: remote.clock,
                channels: remote.channels,
            });
        }

        // telephone-event/8000 rides along when both sides advertise it.
        let local_dtmf = local.codecs.iter().find(|c| c.is_telephone_event());
        let remote_dtmf = offered_maps
            .iter()
            .find(|m| m.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT) && m.clock == 8000);
        if let (Some(local_dtmf), Some(remote_dtmf)) = (local_dtmf, remote_dtmf) {
            let events = local_dtmf
                .fmtp
                .clone()
                .or_else(|| offered.fmtp(remote_dtmf.payload_type).map(str::to_string))
                .unwrap_or_else(|| DEFAULT_DTMF_EVENTS.to_string());
            media.formats.push(remote_dtmf.payload_type.to_string());
            media.rtpmaps.push(remote_dtmf.clone());
            media.fmtps.push((remote_dtmf.payload_type, events));
        }

        session.media.push(media);
    }
    session
}

fn rejected_media(offered: &MediaDescription) -> MediaDescription {
    let mut media = MediaDescription::new(&offered.kind, 0);
    media.protocol = offered.protocol.clone();
    media.formats = offered.formats.clone();
    media
}

fn answer_direction(offered: Direction, local: Direction) -> Direction {
    match offered {
        Direction::SendRecv => local,
        other => other.reversed(),
    }
}

/// One negotiated payload-type mapping. `send_pt` is the type we put on
/// the wire towards the peer (from our offer), `recv_pt` the type the
/// peer will use towards us (from the answer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub send_pt: u8,
    pub recv_pt: u8,
    pub encoding: String,
    pub clock: u32,
    pub channels: u16,
}

/// Per-media outcome of an offer/answer exchange, seen from the offerer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedMedia {
    pub kind: String,
    pub remote_address: String,
    pub remote_port: u16,
    /// Our direction for the stream (the answer's direction mirrored).
    pub direction: Direction,
    pub rtcp_mux: bool,
    pub formats: Vec<NegotiatedFormat>,
}

/// Computes the per-media negotiation result from our offer and the
/// peer's answer. Media rejected with port 0 are omitted.
pub fn negotiate(offer: &SdpSession, answer: &SdpSession) -> Result<Vec<NegotiatedMedia>> {
    if answer.media.len() > offer.media.len() {
        return Err(Error::SdpError(format!(
            "answer has {} media sections for an offer with {}",
            answer.media.len(),
            offer.media.len()
        )));
    }
    let mut result = Vec::new();
    for (offered, answered) in offer.media.iter().zip(&answer.media) {
        if answered.port == 0 {
            debug!("{} media rejected by peer", offered.kind);
            continue;
        }
        let remote_address = answer
            .effective_connection(answered)
            .ok_or_else(|| Error::SdpError("answer carries no connection address".to_string()))?
            .to_string();
        let our_maps = offered_rtpmaps(offered);
        let mut formats = Vec::new();
        for remote in offered_rtpmaps(answered) {
            if let Some(ours) = our_maps.iter().find(|m| m.key() == remote.key()) {
                formats.push(NegotiatedFormat {
                    send_pt: ours.payload_type,
                    recv_pt: remote.payload_type,
                    encoding: remote.encoding.clone(),
                    clock: remote.clock,
                    channels: remote.channels,
                });
            }
        }
        result.push(NegotiatedMedia {
            kind: answered.kind.clone(),
            remote_address,
            remote_port: answered.port,
            direction: answer.effective_direction(answered).reversed(),
            rtcp_mux: offered.rtcp_mux && answered.rtcp_mux,
            formats,
        });
    }
    Ok(result)
}
