//! Inbound frame decoding tests: fragmentation, windows, failure modes.

use std::time::Duration;

use bxp::peer::{Channel, Frame, FrameType, Session, Status};

use crate::common::{ECHO_PROFILE, ScriptedPeer, Step, next_frame_blocking, test_context};

/// Connect through the usual handshake against a peer that then plays
/// `tail`, and register channel 1 so data frames have somewhere to land.
fn connected_session(tail: Vec<Step>) -> (Session, ScriptedPeer) {
    let mut steps = vec![Step::SendGreeting(vec![ECHO_PROFILE]), Step::ReadFrame];
    steps.extend(tail);

    let peer = ScriptedPeer::spawn(steps);
    let ctx = test_context();
    let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();
    session
        .add_channel(Channel::new(1, ECHO_PROFILE))
        .unwrap();
    (session, peer)
}

#[test]
fn test_fragmented_message_joins() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"MSG 1 0 * 0 4\r\nABCDEND\r\n".to_vec()),
        Step::Send(b"MSG 1 0 . 4 4\r\nEFGHEND\r\n".to_vec()),
        Step::Hold(Duration::from_millis(400)),
    ]);

    let first = next_frame_blocking(&session, Duration::from_secs(2))
        .unwrap()
        .expect("first fragment");
    assert!(first.more());
    assert_eq!(first.payload(), b"ABCD");

    let second = next_frame_blocking(&session, Duration::from_secs(2))
        .unwrap()
        .expect("second fragment");
    assert!(!second.more());
    assert_eq!(second.seqno(), 4);

    assert!(Frame::are_joinable(&first, &second));
    let joined = Frame::join(0, &first, &second).unwrap();
    assert_eq!(joined.size(), 8);
    assert_eq!(joined.payload(), b"ABCDEFGH");
    assert!(!joined.more());

    session.close();
    peer.finish();
}

#[test]
fn test_partial_frame_is_resumed() {
    // The payload arrives in two bursts; the engine stashes the partial
    // read and resumes on the next call.
    let (session, peer) = connected_session(vec![
        Step::Send(b"MSG 1 0 . 0 8\r\nfirst".to_vec()),
        Step::Sleep(Duration::from_millis(120)),
        Step::Send(b"barEND\r\n".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let frame = next_frame_blocking(&session, Duration::from_secs(2))
        .unwrap()
        .expect("frame after resume");
    assert_eq!(frame.payload(), b"firstbar");
    assert_eq!(frame.size(), 8);
    assert!(session.is_ok());

    session.close();
    peer.finish();
}

#[test]
fn test_malformed_header_is_fatal() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"RPY x 0 . 0 0\r\n\r\nEND\r\n".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let err = next_frame_blocking(&session, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err.status(), Status::ProtocolError);
    assert!(!session.is_ok());
    assert_eq!(session.status(), Status::ProtocolError);
    assert!(
        session.message().contains("poorly-formed"),
        "message was: {}",
        session.message()
    );

    peer.finish();
}

#[test]
fn test_unknown_type_tag_is_fatal() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"XYZ 1 0 . 0 0\r\nEND\r\n".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let err = next_frame_blocking(&session, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err.status(), Status::ProtocolError);
    assert!(session.message().contains("message type not defined"));

    peer.finish();
}

#[test]
fn test_frame_for_unknown_channel_is_fatal() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"MSG 7 0 . 0 2\r\nokEND\r\n".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let err = next_frame_blocking(&session, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err.status(), Status::ProtocolError);
    assert!(session.message().contains("channel"));

    peer.finish();
}

#[test]
fn test_seqno_window_violation_closes_session() {
    // The default window accepts seqnos 0..4095; a 5000 octet frame runs
    // past it and must never be delivered upward.
    let mut oversized = b"MSG 1 0 . 0 5000\r\n".to_vec();
    oversized.extend(std::iter::repeat_n(b'x', 5000));
    oversized.extend_from_slice(b"END\r\n");

    let (session, peer) = connected_session(vec![
        Step::Send(oversized),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let err = next_frame_blocking(&session, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err.status(), Status::ProtocolError);
    assert!(!session.is_ok());
    assert!(session.message().contains("unexpected frame size"));

    peer.finish();
}

#[test]
fn test_bad_trailer_is_fatal() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"MSG 1 0 . 0 2\r\nokEND--".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let err = next_frame_blocking(&session, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err.status(), Status::ProtocolError);
    assert!(session.message().contains("trailer"));

    peer.finish();
}

#[test]
fn test_seq_frame_passes_through() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"SEQ 1 4096 8192\r\n".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let frame = next_frame_blocking(&session, Duration::from_secs(2))
        .unwrap()
        .expect("SEQ frame");
    assert_eq!(frame.kind(), FrameType::Seq);
    assert_eq!(frame.channel(), 1);
    assert_eq!(frame.seqno(), 4096);
    assert_eq!(frame.size(), 8192);

    // Applying it opens the remote window for the outbound side.
    let channel = frame.channel_ref().cloned().expect("channel attached");
    channel.apply_seq(frame.seqno(), frame.size() as u32);
    assert_eq!(channel.remote_max_seqno(), 4096 + 8192 - 1);

    session.close();
    peer.finish();
}

#[test]
fn test_mime_layer_reaches_the_frame() {
    let payload = b"Content-Type: text/plain\r\nX-Tag: a\r\nX-Tag: b\r\n\r\nhello";
    let raw = format!("MSG 1 0 . 0 {}\r\n", payload.len());
    let mut bytes = raw.into_bytes();
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b"END\r\n");

    let (session, peer) = connected_session(vec![
        Step::Send(bytes),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let frame = next_frame_blocking(&session, Duration::from_secs(2))
        .unwrap()
        .expect("frame");
    assert_eq!(frame.content_type(), Some("text/plain"));
    assert_eq!(frame.transfer_encoding(), Some("binary"));
    assert_eq!(frame.payload(), b"hello");
    assert_eq!(frame.size(), 5);
    assert_eq!(
        frame.mime_header_values("x-tag").collect::<Vec<_>>(),
        ["a", "b"]
    );
    assert_eq!(frame.size() + frame.mime_headers_size(), payload.len());

    session.close();
    peer.finish();
}

#[test]
fn test_peer_vanishing_mid_stream() {
    // The script ends right after the handshake, dropping the socket.
    let (session, peer) = connected_session(vec![]);

    let err = next_frame_blocking(&session, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err.status(), Status::ConnectionError);
    assert_eq!(session.status(), Status::UnnotifiedConnectionClose);
    assert!(!session.is_ok());

    peer.finish();
}

#[test]
fn test_window_slides_after_delivery() {
    let (session, peer) = connected_session(vec![
        Step::Send(b"MSG 1 0 . 0 4\r\nabcdEND\r\n".to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let frame = next_frame_blocking(&session, Duration::from_secs(2))
        .unwrap()
        .expect("frame");
    let channel = frame.channel_ref().cloned().unwrap();

    let (ackno, window) = channel.frame_delivered(&frame).expect("SEQ parameters");
    assert_eq!(ackno, 4);
    assert_eq!(window, 4096);
    assert_eq!(&Frame::build_seq(1, ackno, window)[..], b"SEQ 1 4 4096\r\n");

    // With SEQ generation disabled session-wide, delivery still slides
    // the window but reports nothing to acknowledge.
    session.set_seq_frames_disabled(true);
    assert!(channel.frame_delivered(&frame).is_none());

    session.close();
    peer.finish();
}
