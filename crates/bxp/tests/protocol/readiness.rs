//! Wait-set back-ends driving many sessions, including the runtime swap.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bxp::peer::{
    Channel, IoMechanism, Session, Wait, WaitDirection, WaitSet,
};

use crate::common::{ECHO_PROFILE, ScriptedPeer, Step, next_frame_blocking, test_context};

/// Spawn a peer that completes the handshake, waits `delay`, then sends
/// one two-octet message on channel 1.
fn delayed_sender(delay: Duration) -> ScriptedPeer {
    ScriptedPeer::spawn(vec![
        Step::SendGreeting(vec![ECHO_PROFILE]),
        Step::ReadFrame,
        Step::Sleep(delay),
        Step::Send(b"MSG 1 0 . 0 2\r\nokEND\r\n".to_vec()),
        Step::Hold(Duration::from_secs(3)),
    ])
}

fn wait_until_ready(set: &mut WaitSet, sessions: &[Session], deadline: Duration) -> Vec<Session> {
    let started = Instant::now();
    let max_fd = sessions.iter().map(Session::socket).max().unwrap_or(0);
    loop {
        set.clear();
        for session in sessions {
            assert!(set.add(session.socket(), Some(session)));
        }
        match set.wait(max_fd) {
            Wait::Ready(changed) => {
                let mut ready = Vec::new();
                if set.have_dispatch() {
                    set.dispatch(changed, |_, session| ready.push(session.clone()));
                } else {
                    for session in sessions {
                        if set.is_set(session.socket()) {
                            ready.push(session.clone());
                        }
                    }
                }
                return ready;
            }
            Wait::Timeout | Wait::Interrupted | Wait::SoftError => {
                if started.elapsed() > deadline {
                    return Vec::new();
                }
            }
            Wait::Fatal => panic!("unrecoverable wait failure"),
        }
    }
}

#[test]
fn test_backend_swap_under_load() {
    // A batch of sessions with staggered senders: the early half becomes
    // readable under select, then the mechanism swaps to epoll and the
    // remaining reads must still complete with no session orphaned.
    const SESSIONS: usize = 24;

    let ctx = test_context();
    ctx.set_io_mechanism(IoMechanism::Select);

    let mut peers = Vec::new();
    let mut sessions = Vec::new();
    for at in 0..SESSIONS {
        let delay = if at < SESSIONS / 2 {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(400)
        };
        let peer = delayed_sender(delay);
        let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();
        session.add_channel(Channel::new(1, ECHO_PROFILE)).unwrap();
        peers.push(peer);
        sessions.push(session);
    }

    let mut delivered: HashSet<u64> = HashSet::new();

    // Phase one on select: at least the early senders show up.
    let mut set = WaitSet::new(ctx.io_mechanism(), WaitDirection::Read, ctx.hard_sock_limit());
    assert_eq!(set.mechanism(), IoMechanism::Select);
    let started = Instant::now();
    while delivered.len() < SESSIONS / 2 && started.elapsed() < Duration::from_secs(5) {
        for session in wait_until_ready(&mut set, &sessions, Duration::from_secs(5)) {
            if let Ok(Some(frame)) = session.next_frame() {
                assert_eq!(frame.payload(), b"ok");
                delivered.insert(session.id());
            }
        }
    }
    assert!(
        delivered.len() >= SESSIONS / 2,
        "only {} of the early senders were seen under select",
        delivered.len()
    );

    // Swap the mechanism; readiness carries over to the new back-end.
    ctx.set_io_mechanism(IoMechanism::Epoll);
    let mut set = WaitSet::new(ctx.io_mechanism(), WaitDirection::Read, ctx.hard_sock_limit());
    assert_eq!(set.mechanism(), IoMechanism::Epoll);

    let started = Instant::now();
    while delivered.len() < SESSIONS && started.elapsed() < Duration::from_secs(5) {
        for session in wait_until_ready(&mut set, &sessions, Duration::from_secs(5)) {
            if let Ok(Some(frame)) = session.next_frame() {
                assert_eq!(frame.payload(), b"ok");
                delivered.insert(session.id());
            }
        }
    }

    assert_eq!(
        delivered.len(),
        SESSIONS,
        "every pending read must complete after the swap"
    );
    for session in &sessions {
        assert!(session.is_ok(), "no session may be orphaned by the swap");
        session.close();
    }
    for peer in peers {
        peer.finish();
    }
}

#[test]
fn test_poll_dispatch_recovers_the_right_session() {
    let ctx = test_context();

    let quiet_a = delayed_sender(Duration::from_secs(2));
    let noisy = delayed_sender(Duration::from_millis(30));
    let quiet_b = delayed_sender(Duration::from_secs(2));

    let mut sessions = Vec::new();
    for peer in [&quiet_a, &noisy, &quiet_b] {
        let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();
        session.add_channel(Channel::new(1, ECHO_PROFILE)).unwrap();
        sessions.push(session);
    }
    let noisy_id = sessions[1].id();

    let mut set = WaitSet::new(IoMechanism::Poll, WaitDirection::Read, 0);
    let ready = wait_until_ready(&mut set, &sessions, Duration::from_secs(3));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id(), noisy_id);

    let frame = next_frame_blocking(&ready[0], Duration::from_secs(2))
        .unwrap()
        .expect("frame from the noisy peer");
    assert_eq!(frame.payload(), b"ok");

    for session in sessions {
        session.close();
    }
    for peer in [quiet_a, noisy, quiet_b] {
        peer.finish();
    }
}

#[test]
fn test_every_mechanism_drives_a_read() {
    for mechanism in [IoMechanism::Select, IoMechanism::Poll, IoMechanism::Epoll] {
        let ctx = test_context();
        ctx.set_io_mechanism(mechanism);

        let peer = delayed_sender(Duration::from_millis(50));
        let session = Session::connect(&ctx, "127.0.0.1", peer.port()).unwrap();
        session.add_channel(Channel::new(1, ECHO_PROFILE)).unwrap();

        let sessions = [session];
        let mut set = WaitSet::new(mechanism, WaitDirection::Read, 0);
        let started = Instant::now();
        let mut got_frame = false;
        while !got_frame && started.elapsed() < Duration::from_secs(3) {
            for ready in wait_until_ready(&mut set, &sessions, Duration::from_secs(3)) {
                if let Ok(Some(frame)) = ready.next_frame() {
                    assert_eq!(frame.payload(), b"ok");
                    got_frame = true;
                }
            }
        }
        assert!(got_frame, "{mechanism} failed to drive the read");

        sessions[0].close();
        peer.finish();
    }
}
