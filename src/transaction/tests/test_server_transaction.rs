//! Server transaction state machine tests.

use super::test_client_transaction::{fast_option, spawn_serve, test_endpoint};
use crate::message::{HeadersExt, Method, Request, SipMessage, StatusCode};
use crate::transaction::TransactionState;
use crate::transport::SipAddr;
use std::time::Duration;

fn build_request(method: &str, branch: &str, cseq: &str) -> Request {
    let raw = format!(
        "{method} sip:service@127.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5070;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:peer@127.0.0.1:5070>;tag=peertag\r\n\
To: <sip:service@127.0.0.1:5060>\r\n\
Call-ID: servertest@127.0.0.1\r\n\
CSeq: {cseq}\r\n\
Contact: <sip:peer@127.0.0.1:5070>\r\n\
Content-Length: 0\r\n\
\r\n"
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
async fn test_server_non_invite_replies_and_absorbs_retransmissions() {
    let (endpoint, mut peer, _server) = test_endpoint(fast_option());
    let mut incoming = endpoint.incoming_transactions();
    spawn_serve(&endpoint);

    let options = build_request("OPTIONS", "z9hG4bKsrv1", "7 OPTIONS");
    peer.inbound
        .send((options.clone().into(), peer_addr()))
        .unwrap();

    let mut tx = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
        .await
        .unwrap()
        .expect("expected a server transaction");
    assert_eq!(tx.original.method, Method::Options);
    assert_eq!(tx.state, TransactionState::Trying);

    tx.reply(StatusCode::OK).await.unwrap();
    assert_eq!(tx.state, TransactionState::Completed);

    let (msg, dest) = peer.outbound.recv().await.unwrap();
    let SipMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    assert_eq!(resp.status_code, StatusCode::OK);
    assert_eq!(resp.cseq(), Some((7, Method::Options)));
    // a final response to a request gets a To tag
    assert!(resp.to_tag().is_some());
    // the reply went back to the source address
    assert_eq!(dest, peer_addr());

    // a retransmitted request is answered with the stored response
    peer.inbound.send((options.into(), peer_addr())).unwrap();
    let pump = tokio::spawn(async move {
        while tx.receive().await.is_some() {}
        tx
    });
    let (msg, _) = tokio::time::timeout(Duration::from_secs(2), peer.outbound.recv())
        .await
        .unwrap()
        .unwrap();
    let SipMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    assert_eq!(resp.status_code, StatusCode::OK);

    // Timer J terminates the transaction
    let tx = tokio::time::timeout(Duration::from_secs(5), pump)
        .await
        .unwrap()
        .unwrap();
    assert!(tx.is_terminated());
}

#[tokio::test]
async fn test_server_invite_accepts_and_confirms_on_ack() {
    let (endpoint, mut peer, _server) = test_endpoint(fast_option());
    let mut incoming = endpoint.incoming_transactions();
    spawn_serve(&endpoint);

    let invite = build_request("INVITE", "z9hG4bKsrv2", "1 INVITE");
    peer.inbound.send((invite.into(), peer_addr())).unwrap();

    let mut tx = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
        .await
        .unwrap()
        .expect("expected a server transaction");
    assert_eq!(tx.state, TransactionState::Proceeding);

    tx.send_trying().await.unwrap();
    let (msg, _) = peer.outbound.recv().await.unwrap();
    let SipMessage::Response(trying) = msg else {
        panic!("expected a response");
    };
    assert_eq!(trying.status_code, StatusCode::TRYING);
    // 100 never carries a To tag
    assert!(trying.to_tag().is_none());
    assert_eq!(tx.state, TransactionState::Proceeding);

    tx.reply(StatusCode::RINGING).await.unwrap();
    let (msg, _) = peer.outbound.recv().await.unwrap();
    let SipMessage::Response(ringing) = msg else {
        panic!("expected a response");
    };
    let ringing_tag = ringing.to_tag().expect("180 must carry our tag");

    tx.reply(StatusCode::OK).await.unwrap();
    assert_eq!(tx.state, TransactionState::Accepted);
    let (msg, _) = peer.outbound.recv().await.unwrap();
    let SipMessage::Response(ok) = msg else {
        panic!("expected a response");
    };
    // the tag chosen at 180 time is reused on the 200
    assert_eq!(ok.to_tag().as_deref(), Some(ringing_tag.as_str()));

    // ACK on the same branch reaches the transaction and confirms it
    let ack = build_request("ACK", "z9hG4bKsrv2", "1 ACK");
    peer.inbound.send((ack.into(), peer_addr())).unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), tx.receive())
        .await
        .unwrap()
        .expect("expected the ACK");
    let SipMessage::Request(req) = msg else {
        panic!("expected a request");
    };
    assert_eq!(req.method, Method::Ack);
    assert_eq!(tx.state, TransactionState::Confirmed);

    // Timer I ends it
    assert!(tx.receive().await.is_none());
    assert!(tx.is_terminated());
    assert_eq!(endpoint.inner.transaction_count(), 0);
}

#[tokio::test]
async fn test_server_invite_retransmits_negative_final_until_ack() {
    let (endpoint, mut peer, _server) = test_endpoint(fast_option());
    let mut incoming = endpoint.incoming_transactions();
    spawn_serve(&endpoint);

    let invite = build_request("INVITE", "z9hG4bKsrv3", "1 INVITE");
    peer.inbound.send((invite.into(), peer_addr())).unwrap();
    let mut tx = incoming.recv().await.expect("expected a transaction");

    tx.reply(StatusCode::BUSY_HERE).await.unwrap();
    assert_eq!(tx.state, TransactionState::Completed);

    // Timer G retransmits the 486 while no ACK arrives
    let pump = tokio::spawn(async move {
        while tx.receive().await.is_some() {}
        tx
    });
    let mut responses = 0;
    for _ in 0..2 {
        let (msg, _) = tokio::time::timeout(Duration::from_secs(2), peer.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        if let SipMessage::Response(resp) = msg {
            assert_eq!(resp.status_code, StatusCode::BUSY_HERE);
            responses += 1;
        }
    }
    assert_eq!(responses, 2);

    // the ACK stops retransmission and the transaction winds down
    let ack = build_request("ACK", "z9hG4bKsrv3", "1 ACK");
    peer.inbound.send((ack.into(), peer_addr())).unwrap();
    let tx = tokio::time::timeout(Duration::from_secs(5), pump)
        .await
        .unwrap()
        .unwrap();
    assert!(tx.is_terminated());
}

#[tokio::test]
async fn test_ack_without_transaction_creates_none() {
    let (endpoint, mut peer, _server) = test_endpoint(fast_option());
    let mut incoming = endpoint.incoming_transactions();
    spawn_serve(&endpoint);

    let ack = build_request("ACK", "z9hG4bKnowhere", "1 ACK");
    peer.inbound.send((ack.into(), peer_addr())).unwrap();

    // nothing surfaces and nothing is sent back
    assert!(
        tokio::time::timeout(Duration::from_millis(200), incoming.recv())
            .await
            .is_err()
    );
    assert!(peer.outbound.try_recv().is_err());
    assert_eq!(endpoint.inner.transaction_count(), 0);
}

#[tokio::test]
async fn test_cancel_without_transaction_gets_481() {
    let (endpoint, mut peer, _server) = test_endpoint(fast_option());
    let mut incoming = endpoint.incoming_transactions();
    spawn_serve(&endpoint);

    let cancel = build_request("CANCEL", "z9hG4bKnowhere", "1 CANCEL");
    peer.inbound.send((cancel.into(), peer_addr())).unwrap();

    let (msg, _) = tokio::time::timeout(Duration::from_secs(2), peer.outbound.recv())
        .await
        .unwrap()
        .unwrap();
    let SipMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    assert_eq!(
        resp.status_code,
        StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(200), incoming.recv())
            .await
            .is_err()
    );
}
