//! Greetings exchange tests.

use std::sync::Arc;
use std::time::Duration;

use bxp::peer::{Role, Session, Status};

use crate::common::{ECHO_PROFILE, ScriptedPeer, Step, test_context};

#[test]
fn test_minimal_greeting() {
    let peer = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![]),
        Step::ReadFrame,
        Step::Hold(Duration::from_millis(300)),
    ]);

    let ctx = test_context();
    let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();

    assert!(session.is_ok());
    assert_eq!(session.status(), Status::Ok);
    assert!(session.remote_profiles().is_empty());
    assert_eq!(session.features(), None);
    assert!(session.channel_exists(0));

    session.close();
    peer.finish();
}

#[test]
fn test_greeting_profiles_are_visible() {
    let peer = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![ECHO_PROFILE, "http://example.org/beep/sink"]),
        Step::ReadFrame,
        Step::Hold(Duration::from_millis(300)),
    ]);

    let ctx = test_context();
    let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();

    assert!(session.is_profile_supported(ECHO_PROFILE));
    assert!(session.is_profile_supported("http://example.org/beep/sink"));
    assert!(!session.is_profile_supported("http://example.org/beep/other"));
    assert_eq!(session.remote_profiles().len(), 2);

    session.close();
    peer.finish();
}

#[test]
fn test_identical_greetings_share_one_cache_entry() {
    let ctx = test_context();
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let peer = ScriptedPeer::spawn(vec![
            Step::SendGreeting(vec![ECHO_PROFILE]),
            Step::ReadFrame,
            Step::Hold(Duration::from_millis(500)),
        ]);
        sessions.push((Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap(), peer));
    }

    assert_eq!(ctx.greetings_cache().len(), 1);
    let first = sessions[0].0.greeting().unwrap();
    for (session, _) in &sessions {
        assert!(Arc::ptr_eq(&first, &session.greeting().unwrap()));
    }

    for (session, peer) in sessions {
        session.close();
        peer.finish();
    }
}

#[test]
fn test_fragmented_greeting_is_joined() {
    // The greeting arrives as two RPY fragments; the second one starts
    // where the first ended, counting the MIME header section.
    let body = format!("<greeting><profile uri='{ECHO_PROFILE}' /></greeting>");
    let mime = "Content-Type: application/beep+xml\r\n\r\n";
    let split = 11;

    let first_payload = format!("{mime}{}", &body[..split]);
    let first = format!(
        "RPY 0 0 * 0 {}\r\n{}END\r\n",
        first_payload.len(),
        first_payload
    );
    let second = format!(
        "RPY 0 0 . {} {}\r\n{}END\r\n",
        first_payload.len(),
        body.len() - split,
        &body[split..]
    );

    let peer = ScriptedPeer::spawn(vec![
        Step::Send(first.into_bytes()),
        Step::Sleep(Duration::from_millis(50)),
        Step::Send(second.into_bytes()),
        Step::ReadFrame,
        Step::Hold(Duration::from_millis(300)),
    ]);

    let ctx = test_context();
    let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();
    assert_eq!(session.remote_profiles(), vec![ECHO_PROFILE.to_string()]);

    session.close();
    peer.finish();
}

#[test]
fn test_invalid_greeting_is_fatal() {
    let raw = b"RPY 0 0 . 0 47\r\nContent-Type: application/beep+xml\r\n\r\n<bogus />END\r\n";
    let peer = ScriptedPeer::spawn(vec![
        Step::Send(raw.to_vec()),
        Step::Hold(Duration::from_millis(300)),
    ]);

    let ctx = test_context();
    let err = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap_err();
    assert_eq!(err.status(), Status::XmlValidationError);
    assert!(ctx.greetings_cache().is_empty());
    peer.finish();
}

#[test]
fn test_greetings_timeout() {
    // The peer accepts and goes silent; the connect timeout budget also
    // bounds the greetings wait.
    let peer = ScriptedPeer::spawn(vec![Step::Hold(Duration::from_secs(4))]);

    let ctx = test_context();
    ctx.set_connect_timeout(Duration::from_millis(1200));
    let err = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap_err();
    assert_eq!(err.status(), Status::GreetingsFailure);
    peer.finish();
}

#[test]
fn test_connect_refused_reports_connection_error() {
    let ctx = test_context();
    // Bind then drop so the port very likely refuses.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = Session::connect(&ctx, "127.0.0.1", port).unwrap_err();
    assert_eq!(err.status(), Status::ConnectionError);
}

#[test]
fn test_accept_path_interoperates_with_connect() {
    let ctx = test_context();
    ctx.advertise_profile(ECHO_PROFILE);

    let master = Session::listen(&ctx, "127.0.0.1", 0).unwrap();
    assert_eq!(master.role(), Role::MasterListener);
    let port = master.local_port().unwrap();

    let acceptor = {
        let master = master.clone();
        std::thread::spawn(move || master.accept())
    };

    let initiator = Session::connect(&ctx, "127.0.0.1", port).unwrap();
    let accepted = acceptor.join().unwrap().unwrap();

    assert_eq!(accepted.role(), Role::Listener);
    assert!(accepted.is_ok());
    assert!(initiator.is_ok());

    // Both directions saw the advertised profile.
    assert_eq!(initiator.remote_profiles(), vec![ECHO_PROFILE.to_string()]);
    assert_eq!(accepted.remote_profiles(), vec![ECHO_PROFILE.to_string()]);

    // Channel parity by role.
    assert_eq!(initiator.next_channel_number().unwrap() % 2, 1);
    assert_eq!(accepted.next_channel_number().unwrap() % 2, 0);

    initiator.close();
    accepted.shutdown();
    master.shutdown();
}

#[test]
fn test_profile_mask_hides_advertisement() {
    let ctx = test_context();
    ctx.advertise_profile(ECHO_PROFILE);
    ctx.advertise_profile("http://example.org/beep/private");

    let master = Session::listen(&ctx, "127.0.0.1", 0).unwrap();
    let port = master.local_port().unwrap();

    let acceptor = {
        let master = master.clone();
        std::thread::spawn(move || master.accept())
    };

    // Hide the private profile on the initiator side before its greeting
    // goes out: a pre-accept style hook is not available to the dialing
    // peer, so mask through a connection action would race the greeting.
    // Instead, verify masking on the accept side below and check the
    // initiator sees both URIs from the unmasked listener.
    let initiator = Session::connect(&ctx, "127.0.0.1", port).unwrap();
    let accepted = acceptor.join().unwrap().unwrap();

    assert_eq!(initiator.remote_profiles().len(), 2);

    // Masks installed on a live session filter channel starts.
    accepted.set_profile_mask(|_, req| {
        (req.uri == "http://example.org/beep/private")
            .then(|| "profile not available here".to_string())
    });
    let verdict = accepted.is_profile_filtered(
        &bxp::peer::ProfileMaskRequest::for_uri("http://example.org/beep/private"),
    );
    assert_eq!(verdict.as_deref(), Some("profile not available here"));

    initiator.close();
    accepted.shutdown();
    master.shutdown();
}

#[test]
fn test_close_handler_may_close_other_sessions() {
    // Two live sessions; a close handler on the first shuts the second
    // down. Both end up closed and nothing deadlocks.
    let peer_a = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![]),
        Step::ReadFrame,
        Step::Hold(Duration::from_secs(2)),
    ]);
    let peer_b = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![]),
        Step::ReadFrame,
        Step::Hold(Duration::from_secs(2)),
    ]);

    let ctx = test_context();
    let a = Session::connect(&ctx, "127.0.0.1", peer_a.port()).unwrap();
    let b = Session::connect(&ctx, "127.0.0.1", peer_b.port()).unwrap();

    {
        let b = b.clone();
        a.on_close_full(
            move |_| {
                b.shutdown();
            },
            false,
        );
    }

    a.shutdown();

    // The handler runs on a worker; wait for it to take effect.
    for _ in 0..200 {
        if !b.is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!a.is_ok());
    assert!(!b.is_ok());
    assert_eq!(a.status(), Status::ConnectionForcedClose);
    assert_eq!(b.status(), Status::ConnectionForcedClose);

    peer_a.finish();
    peer_b.finish();
}

#[test]
fn test_threaded_connect_delivers_the_session() {
    let peer = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![ECHO_PROFILE]),
        Step::ReadFrame,
        Step::Hold(Duration::from_millis(400)),
    ]);

    let ctx = test_context();
    let (tx, rx) = std::sync::mpsc::channel();
    Session::connect_threaded(
        &ctx,
        "127.0.0.1",
        peer.port(),
        bxp::peer::Transport::Ipv4,
        bxp::peer::SessionOpts::default(),
        move |result| {
            let _ = tx.send(result);
        },
    );

    let session = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("callback fired")
        .expect("connect succeeded");
    assert!(session.is_ok());
    assert_eq!(session.remote_profiles(), vec![ECHO_PROFILE.to_string()]);

    session.close();
    peer.finish();
}

#[test]
fn test_reconnect_reuses_the_session() {
    let ctx = test_context();

    let first = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![ECHO_PROFILE]),
        Step::ReadFrame,
        Step::Hold(Duration::from_millis(400)),
    ]);
    let session = Session::connect(&ctx, "127.0.0.1", first.port()).unwrap();
    let id = session.id();
    session.set_data("sticky", 7u32);
    session.add_channel_pool(ECHO_PROFILE, vec![1]);

    session.shutdown();
    first.finish();

    // A fresh peer on the same port cannot be guaranteed, so point the
    // session at a new scripted peer before reconnecting.
    let second = ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![ECHO_PROFILE]),
        Step::ReadFrame,
        Step::Hold(Duration::from_millis(400)),
    ]);
    session.set_host_and_port("127.0.0.1", second.port());

    session.reconnect().unwrap();
    assert!(session.is_ok());
    assert_eq!(session.id(), id, "reconnect keeps the session identity");
    assert_eq!(session.status(), Status::Ok);
    assert!(session.channel_exists(0));

    // User data survives; pools were discarded.
    assert_eq!(*session.get_data::<u32>("sticky").unwrap(), 7);
    assert_eq!(session.channel_pools_count(), 0);
    assert_eq!(session.add_channel_pool(ECHO_PROFILE, vec![1]).id(), 1);

    session.close();
    second.finish();
}
