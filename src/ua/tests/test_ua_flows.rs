//! End-to-end user agent flows over the in-memory channel transport:
//! the test plays the remote server/peer.

use crate::dialog::authenticate::Credential;
use crate::dialog::dialog::{DialogState, TerminatedReason};
use crate::message::{
    Header, HeadersExt, Method, Request, Response, SipMessage, StatusCode, Uri,
};
use crate::sdp::{MediaCapability, SdpSession, SessionCapability};
use crate::transport::channel::{ChannelConnection, ChannelPeer};
use crate::transport::{SipAddr, TransportLayer};
use crate::ua::{UaConfig, UserAgent};
use digest::Digest;
use md5::Md5;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_ua(
    credentials: Vec<Credential>,
    capability: Option<SessionCapability>,
) -> (
    UserAgent,
    crate::dialog::dialog::DialogStateReceiver,
    ChannelPeer,
    SipAddr,
) {
    let token = CancellationToken::new();
    let local = SipAddr::udp("127.0.0.1:5060".parse().unwrap());
    let (connection, peer) = ChannelConnection::create_connection(local, false);
    let transport_layer = TransportLayer::new(token.child_token());
    transport_layer.add_connection(connection.into());

    let mut config = UaConfig::new(Uri::try_from("sip:alice@127.0.0.1").unwrap());
    config.timers = Some((
        Duration::from_millis(200),
        Duration::from_millis(400),
        Duration::from_millis(50),
    ));
    config.credentials = credentials;
    config.capability = capability;

    let (ua, events) = UserAgent::new(config, transport_layer).unwrap();
    let serve_ua = ua.clone();
    tokio::spawn(async move {
        serve_ua.serve().await.ok();
    });
    let server_addr = SipAddr::udp("127.0.0.1:5070".parse().unwrap());
    (ua, events, peer, server_addr)
}

fn audio_capability() -> SessionCapability {
    SessionCapability::new("127.0.0.1", vec![MediaCapability::audio(40000)])
}

async fn recv_message(peer: &mut ChannelPeer) -> SipMessage {
    let (msg, _) = tokio::time::timeout(Duration::from_secs(5), peer.outbound.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("transport channel closed");
    msg
}

async fn recv_request(peer: &mut ChannelPeer) -> Request {
    loop {
        if let SipMessage::Request(req) = recv_message(peer).await {
            return req;
        }
    }
}

async fn recv_response(peer: &mut ChannelPeer) -> Response {
    loop {
        if let SipMessage::Response(resp) = recv_message(peer).await {
            return resp;
        }
    }
}

fn response_for(req: &Request, status: StatusCode, to_tag: Option<&str>) -> Response {
    let mut resp = Response::new(status);
    for name in ["Via", "From", "Call-ID", "CSeq"] {
        for value in req.headers.get_all(name) {
            resp.headers.push(Header::new(name, value));
        }
    }
    let to = req.to_header().expect("request without To").to_string();
    let to = match to_tag {
        Some(tag) if !to.contains("tag=") => format!("{to};tag={tag}"),
        _ => to,
    };
    resp.headers.push(Header::new("To", to));
    resp
}

fn with_body(mut resp: Response, body: &str, content_type: &str) -> Response {
    resp.headers
        .push(Header::new("Content-Type", content_type));
    resp.headers
        .push(Header::new("Content-Length", body.len().to_string()));
    resp.body = body.as_bytes().to_vec();
    resp
}

fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn auth_param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let start = header.find(&format!("{name}="))? + name.len() + 1;
    let rest = &header[start..];
    if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next()
    } else {
        rest.split([',', ' ']).next()
    }
}

#[tokio::test]
async fn test_options_ping() {
    let (ua, _events, mut peer, server) = test_ua(vec![], None);

    let target = Uri::try_from("sip:127.0.0.1:5070").unwrap();
    let task_ua = ua.clone();
    let task = tokio::spawn(async move { task_ua.options(&target).await });

    let req = recv_request(&mut peer).await;
    assert_eq!(req.method, Method::Options);
    assert!(req.validate().is_ok());
    assert!(req.via_branch().unwrap().starts_with("z9hG4bK"));
    assert_eq!(req.headers.get("Max-Forwards"), Some("70"));
    assert!(req.call_id().unwrap().contains('@'));

    peer.inbound
        .send((response_for(&req, StatusCode::OK, Some("s1")).into(), server))
        .unwrap();

    let resp = task.await.unwrap().unwrap();
    assert_eq!(resp.status_code, StatusCode::OK);
    assert_eq!(resp.call_id(), req.call_id());
    assert_eq!(resp.cseq(), req.cseq());
}

#[tokio::test]
async fn test_register_with_digest_challenge() {
    let credentials = vec![Credential {
        username: "u".to_string(),
        password: "p".to_string(),
        realm: Some("r".to_string()),
    }];
    let (ua, _events, mut peer, server) = test_ua(credentials, None);

    let registrar = Uri::try_from("sip:127.0.0.1:5070").unwrap();
    let task_ua = ua.clone();
    let reg = registrar.clone();
    let task = tokio::spawn(async move { task_ua.register(&reg, 3600).await });

    // first REGISTER, unauthenticated
    let first = recv_request(&mut peer).await;
    assert_eq!(first.method, Method::Register);
    assert_eq!(first.cseq(), Some((1, Method::Register)));
    assert_eq!(first.expires(), Some(3600));
    // To and From are both the address of record
    assert_eq!(first.to_header(), Some("<sip:alice@127.0.0.1>"));
    assert!(first
        .from_header()
        .unwrap()
        .starts_with("<sip:alice@127.0.0.1>;tag="));
    assert!(first.contact_header().unwrap().contains("expires=3600"));
    assert!(first.headers.get("Authorization").is_none());

    let mut challenge = response_for(&first, StatusCode::UNAUTHORIZED, Some("reg1"));
    challenge.headers.push(Header::new(
        "WWW-Authenticate",
        r#"Digest realm="r", nonce="n1", qop="auth""#,
    ));
    peer.inbound
        .send((challenge.into(), server.clone()))
        .unwrap();

    // authenticated retry: fresh branch, CSeq+1, same Call-ID
    let second = recv_request(&mut peer).await;
    assert_eq!(second.method, Method::Register);
    assert_eq!(second.cseq(), Some((2, Method::Register)));
    assert_eq!(second.call_id(), first.call_id());
    assert_ne!(second.via_branch(), first.via_branch());

    let authorization = second.headers.get("Authorization").unwrap().to_string();
    assert_eq!(auth_param(&authorization, "username"), Some("u"));
    assert_eq!(auth_param(&authorization, "realm"), Some("r"));
    assert_eq!(auth_param(&authorization, "nonce"), Some("n1"));
    assert_eq!(auth_param(&authorization, "nc"), Some("00000001"));
    assert_eq!(auth_param(&authorization, "qop"), Some("auth"));
    let uri = auth_param(&authorization, "uri").unwrap();
    assert_eq!(uri, registrar.to_string());

    // verify the digest: MD5(HA1:nonce:nc:cnonce:qop:HA2)
    let cnonce = auth_param(&authorization, "cnonce").unwrap();
    let ha1 = md5_hex("u:r:p");
    let ha2 = md5_hex(&format!("REGISTER:{uri}"));
    let expected = md5_hex(&format!("{ha1}:n1:00000001:{cnonce}:auth:{ha2}"));
    assert_eq!(auth_param(&authorization, "response"), Some(expected.as_str()));

    let mut ok = response_for(&second, StatusCode::OK, Some("reg1"));
    ok.headers
        .push(Header::new("Expires", "1800"));
    peer.inbound.send((ok.into(), server)).unwrap();

    let resp = task.await.unwrap().unwrap();
    assert_eq!(resp.status_code, StatusCode::OK);
}

#[tokio::test]
async fn test_register_without_credentials_returns_challenge() {
    let (ua, _events, mut peer, server) = test_ua(vec![], None);
    let registrar = Uri::try_from("sip:127.0.0.1:5070").unwrap();
    let task_ua = ua.clone();
    let task = tokio::spawn(async move { task_ua.register(&registrar, 600).await });

    let first = recv_request(&mut peer).await;
    let mut challenge = response_for(&first, StatusCode::UNAUTHORIZED, Some("reg1"));
    challenge.headers.push(Header::new(
        "WWW-Authenticate",
        r#"Digest realm="r", nonce="n1""#,
    ));
    peer.inbound.send((challenge.into(), server)).unwrap();

    // no credentials for the realm: the 401 surfaces as the outcome
    let result = task.await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_full_call_flow_invite_ack_bye() {
    let (ua, mut events, mut peer, server) = test_ua(vec![], Some(audio_capability()));

    let callee = Uri::try_from("sip:bob@127.0.0.1:5070").unwrap();
    let task_ua = ua.clone();
    let task = tokio::spawn(async move { task_ua.invite(&callee, None).await });

    let invite = recv_request(&mut peer).await;
    assert_eq!(invite.method, Method::Invite);
    assert!(invite.validate().is_ok());
    assert_eq!(invite.content_type(), Some("application/sdp"));
    let offer = SdpSession::parse(&String::from_utf8_lossy(&invite.body)).unwrap();
    let audio = &offer.media[0];
    assert_eq!(audio.formats, vec!["0", "8", "101"]);
    assert_eq!(audio.rtpmap(0).unwrap().encoding, "PCMU");
    assert_eq!(audio.rtpmap(101).unwrap().encoding, "telephone-event");

    peer.inbound
        .send((
            response_for(&invite, StatusCode::TRYING, None).into(),
            server.clone(),
        ))
        .unwrap();
    peer.inbound
        .send((
            response_for(&invite, StatusCode::RINGING, Some("uas1")).into(),
            server.clone(),
        ))
        .unwrap();

    let answer_sdp = "v=0\r\n\
o=bob 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 6000 RTP/AVP 0\r\n\
a=sendrecv\r\n\
a=rtpmap:0 PCMU/8000\r\n";
    let mut ok = response_for(&invite, StatusCode::OK, Some("uas1"));
    ok.headers
        .push(Header::new("Contact", "<sip:bob@127.0.0.1:5070>"));
    let ok = with_body(ok, answer_sdp, "application/sdp");
    peer.inbound.send((ok.into(), server.clone())).unwrap();

    // the ACK for the 2xx rides a fresh branch with the INVITE's CSeq
    let ack = recv_request(&mut peer).await;
    assert_eq!(ack.method, Method::Ack);
    assert_ne!(ack.via_branch(), invite.via_branch());
    assert!(ack.via_branch().unwrap().starts_with("z9hG4bK"));
    assert_eq!(ack.cseq().map(|(seq, _)| seq), invite.cseq().map(|(s, _)| s));
    // addressed at the peer's contact
    assert_eq!(ack.uri.host, "127.0.0.1");
    assert_eq!(ack.uri.port, Some(5070));

    let (dialog, resp) = task.await.unwrap().unwrap();
    assert_eq!(resp.unwrap().status_code, StatusCode::OK);
    assert!(!dialog.id().is_early());
    assert_eq!(dialog.id().to_tag, "uas1");

    // dialog state walked Trying -> Early -> Confirmed
    assert!(matches!(events.recv().await, Some(DialogState::Trying(_))));
    assert!(matches!(events.recv().await, Some(DialogState::Early(_, _))));
    assert!(matches!(events.recv().await, Some(DialogState::Confirmed(_))));

    // hang up: BYE carries the next CSeq and both tags
    let dialog_id = dialog.id();
    let bye_ua = ua.clone();
    let bye_task = tokio::spawn(async move { bye_ua.bye(&dialog_id).await });

    let bye = recv_request(&mut peer).await;
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.cseq(), Some((2, Method::Bye)));
    assert_eq!(bye.to_tag().as_deref(), Some("uas1"));
    assert_eq!(bye.from_tag(), invite.from_tag());
    peer.inbound
        .send((response_for(&bye, StatusCode::OK, None).into(), server))
        .unwrap();

    bye_task.await.unwrap().unwrap();
    assert!(matches!(
        events.recv().await,
        Some(DialogState::Terminated(_, TerminatedReason::UacBye))
    ));
    assert!(ua.dialog_layer.is_empty());
}

#[tokio::test]
async fn test_invite_rejected_busy_here() {
    let (ua, mut events, mut peer, server) = test_ua(vec![], Some(audio_capability()));

    let callee = Uri::try_from("sip:bob@127.0.0.1:5070").unwrap();
    let task_ua = ua.clone();
    let task = tokio::spawn(async move { task_ua.invite(&callee, None).await });

    let invite = recv_request(&mut peer).await;
    peer.inbound
        .send((
            response_for(&invite, StatusCode::BUSY_HERE, Some("busy1")).into(),
            server,
        ))
        .unwrap();

    // the negative final is ACKed inside the transaction, same branch
    let ack = recv_request(&mut peer).await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.via_branch(), invite.via_branch());

    let (_dialog, resp) = task.await.unwrap().unwrap();
    assert_eq!(resp.unwrap().status_code, StatusCode::BUSY_HERE);

    assert!(matches!(events.recv().await, Some(DialogState::Trying(_))));
    assert!(matches!(
        events.recv().await,
        Some(DialogState::Terminated(_, TerminatedReason::UasBusy))
    ));
    // no dialog survives a rejected INVITE
    assert!(ua.dialog_layer.is_empty());
}

fn peer_request(method: &str, branch: &str, cseq: &str, to_tag: Option<&str>, body: &str) -> Request {
    let to = match to_tag {
        Some(tag) => format!("<sip:alice@127.0.0.1:5060>;tag={tag}"),
        None => "<sip:alice@127.0.0.1:5060>".to_string(),
    };
    let content = if body.is_empty() {
        "Content-Length: 0\r\n\r\n".to_string()
    } else {
        format!(
            "Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    };
    let raw = format!(
        "{method} sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5070;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:bob@127.0.0.1:5070>;tag=uac1\r\n\
To: {to}\r\n\
Call-ID: uas-call@127.0.0.1\r\n\
CSeq: {cseq}\r\n\
Contact: <sip:bob@127.0.0.1:5070>\r\n\
{content}"
    );
    let SipMessage::Request(req) = SipMessage::try_from(raw.as_bytes()).unwrap() else {
        panic!("expected a request");
    };
    req
}

fn peer_addr() -> SipAddr {
    SipAddr::udp("127.0.0.1:5070".parse().unwrap())
}

#[tokio::test]
async fn test_incoming_call_is_answered_and_torn_down() {
    let (_ua, mut events, mut peer, _server) = test_ua(vec![], Some(audio_capability()));

    let offer_sdp = "v=0\r\n\
o=bob 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 6000 RTP/AVP 8 0 101\r\n\
a=sendrecv\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-15\r\n";
    let invite = peer_request("INVITE", "z9hG4bKuacinv", "1 INVITE", None, offer_sdp);
    peer.inbound.send((invite.into(), peer_addr())).unwrap();

    let trying = recv_response(&mut peer).await;
    assert_eq!(trying.status_code, StatusCode::TRYING);
    assert!(trying.to_tag().is_none());

    let ringing = recv_response(&mut peer).await;
    assert_eq!(ringing.status_code, StatusCode::RINGING);
    let our_tag = ringing.to_tag().expect("180 carries the UAS tag");

    let ok = recv_response(&mut peer).await;
    assert_eq!(ok.status_code, StatusCode::OK);
    assert_eq!(ok.to_tag().as_deref(), Some(our_tag.as_str()));
    assert!(ok.contact_header().is_some());
    let answer = SdpSession::parse(&String::from_utf8_lossy(&ok.body)).unwrap();
    // we prefer PCMU even though the offer lists PCMA first
    assert_eq!(answer.media[0].formats, vec!["0", "8", "101"]);
    // the local events range wins over the offered 0-15
    assert_eq!(answer.media[0].fmtp(101), Some("0-16"));

    assert!(matches!(events.recv().await, Some(DialogState::Early(_, _))));

    // ACK on a fresh branch reaches the dialog, not the transaction
    let ack = peer_request("ACK", "z9hG4bKuacack", "1 ACK", Some(&our_tag), "");
    peer.inbound.send((ack.into(), peer_addr())).unwrap();
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap(),
        Some(DialogState::Confirmed(_))
    ));

    // an out-of-order BYE (CSeq not above the INVITE's) is refused
    let stale_bye = peer_request("BYE", "z9hG4bKuacbye0", "1 BYE", Some(&our_tag), "");
    peer.inbound.send((stale_bye.into(), peer_addr())).unwrap();
    let resp = recv_response(&mut peer).await;
    assert_eq!(resp.status_code, StatusCode::SERVER_INTERNAL_ERROR);

    // the real BYE terminates the call
    let bye = peer_request("BYE", "z9hG4bKuacbye1", "2 BYE", Some(&our_tag), "");
    peer.inbound.send((bye.into(), peer_addr())).unwrap();
    let resp = recv_response(&mut peer).await;
    assert_eq!(resp.status_code, StatusCode::OK);
    assert!(matches!(
        events.recv().await,
        Some(DialogState::Terminated(_, TerminatedReason::UacBye))
    ));
}

#[tokio::test]
async fn test_bye_for_unknown_dialog_gets_481() {
    let (_ua, _events, mut peer, _server) = test_ua(vec![], None);

    let bye = peer_request("BYE", "z9hG4bKstray", "2 BYE", Some("nosuchtag"), "");
    peer.inbound.send((bye.into(), peer_addr())).unwrap();

    let resp = recv_response(&mut peer).await;
    assert_eq!(resp.status_code, StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST);
}

#[tokio::test]
async fn test_options_is_answered_with_allow() {
    let (_ua, _events, mut peer, _server) = test_ua(vec![], None);

    let options = peer_request("OPTIONS", "z9hG4bKopt1", "1 OPTIONS", None, "");
    peer.inbound.send((options.into(), peer_addr())).unwrap();

    let resp = recv_response(&mut peer).await;
    assert_eq!(resp.status_code, StatusCode::OK);
    let allow = resp.headers.get("Allow").expect("200 carries Allow");
    for method in ["INVITE", "ACK", "BYE", "OPTIONS"] {
        assert!(allow.contains(method));
    }
}

#[tokio::test]
async fn test_incoming_call_without_capability_is_rejected() {
    let (_ua, _events, mut peer, _server) = test_ua(vec![], None);

    let invite = peer_request("INVITE", "z9hG4bKnocaps", "1 INVITE", None, "");
    peer.inbound.send((invite.into(), peer_addr())).unwrap();

    let trying = recv_response(&mut peer).await;
    assert_eq!(trying.status_code, StatusCode::TRYING);
    let reject = recv_response(&mut peer).await;
    assert_eq!(reject.status_code, StatusCode::NOT_ACCEPTABLE_HERE);
}
