//! SDP parse/serialize tests

use crate::sdp::{Direction, SdpSession};

const OFFER: &str = "v=0\r\n\
o=- 20518 0 IN IP4 192.0.2.1\r\n\
s=call\r\n\
c=IN IP4 192.0.2.1\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0 8 101\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-16\r\n\
a=ptime:20\r\n";

#[test]
fn test_parse_session() {
    let sdp = SdpSession::parse(OFFER).unwrap();
    assert_eq!(sdp.version, 0);
    assert_eq!(sdp.origin.username, "-");
    assert_eq!(sdp.origin.session_id, "20518");
    assert_eq!(sdp.origin.address, "192.0.2.1");
    assert_eq!(sdp.name, "call");
    assert_eq!(sdp.connection.as_deref(), Some("192.0.2.1"));
    assert_eq!(sdp.timing, (0, 0));
    assert_eq!(sdp.media.len(), 1);

    let audio = &sdp.media[0];
    assert_eq!(audio.kind, "audio");
    assert_eq!(audio.port, 49170);
    assert_eq!(audio.protocol, "RTP/AVP");
    assert_eq!(audio.formats, vec!["0", "8", "101"]);
    assert_eq!(audio.direction, Some(Direction::SendRecv));
    assert!(audio.rtcp_mux);
    assert_eq!(audio.rtpmaps.len(), 3);
    assert_eq!(audio.rtpmap(0).unwrap().encoding, "PCMU");
    assert_eq!(audio.rtpmap(101).unwrap().encoding, "telephone-event");
    assert_eq!(audio.fmtp(101), Some("0-16"));
    // unknown attributes are preserved
    assert_eq!(
        audio.attributes,
        vec![("ptime".to_string(), Some("20".to_string()))]
    );
}

#[test]
fn test_parse_tolerates_bare_lf() {
    let input = OFFER.replace("\r\n", "\n");
    let sdp = SdpSession::parse(&input).unwrap();
    assert_eq!(sdp.media.len(), 1);
    assert_eq!(sdp.media[0].rtpmaps.len(), 3);
}

#[test]
fn test_direction_inheritance() {
    let input = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
a=sendonly\r\n\
m=audio 4000 RTP/AVP 0\r\n\
m=audio 4002 RTP/AVP 0\r\n\
a=recvonly\r\n";
    let sdp = SdpSession::parse(input).unwrap();
    assert_eq!(sdp.direction, Some(Direction::SendOnly));
    // first media inherits the session direction
    assert_eq!(sdp.media[0].direction, None);
    assert_eq!(sdp.effective_direction(&sdp.media[0]), Direction::SendOnly);
    assert_eq!(sdp.effective_direction(&sdp.media[1]), Direction::RecvOnly);
}

#[test]
fn test_default_direction_is_sendrecv() {
    let input = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\n";
    let sdp = SdpSession::parse(input).unwrap();
    assert_eq!(sdp.effective_direction(&sdp.media[0]), Direction::SendRecv);
}

#[test]
fn test_per_media_connection_overrides_session() {
    let input = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\n\
c=IN IP4 198.51.100.5\r\n";
    let sdp = SdpSession::parse(input).unwrap();
    assert_eq!(
        sdp.effective_connection(&sdp.media[0]),
        Some("198.51.100.5")
    );
}

#[test]
fn test_parse_errors() {
    assert!(SdpSession::parse("").is_err());
    // media line without formats
    assert!(SdpSession::parse("v=0\r\nm=audio 4000 RTP/AVP\r\n").is_err());
    // bad port
    assert!(SdpSession::parse("v=0\r\nm=audio hi RTP/AVP 0\r\n").is_err());
    // missing version line
    assert!(SdpSession::parse("s=x\r\nt=0 0\r\n").is_err());
}

#[test]
fn test_round_trip_preserves_structure() {
    let sdp = SdpSession::parse(OFFER).unwrap();
    let again = SdpSession::parse(&sdp.to_string()).unwrap();
    assert_eq!(again, sdp);

    // media order, codec order, directions and rtcp-mux survive
    assert_eq!(
        again.media[0]
            .rtpmaps
            .iter()
            .map(|r| r.payload_type)
            .collect::<Vec<_>>(),
        vec![0, 8, 101]
    );
    assert_eq!(again.media[0].direction, Some(Direction::SendRecv));
    assert!(again.media[0].rtcp_mux);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn parse_never_panics(input in ".*") {
            let _ = SdpSession::parse(&input);
        }
    }
}
