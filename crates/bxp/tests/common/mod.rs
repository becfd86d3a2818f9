//! Common test utilities for the protocol suites.
//!
//! Provides `ScriptedPeer`, a fake BEEP peer bound on loopback that plays
//! a fixed script (send bytes, read the client greeting, pause, close), so
//! the engine under test can be driven without a second BEEP stack.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use bxp::peer::{Context, Frame, FrameType, WaitDirection, WaitSet};

/// Profile URI used across the suites.
pub const ECHO_PROFILE: &str = "http://example.org/beep/echo";

/// A context with short timeouts so failing paths finish quickly.
pub fn test_context() -> Context {
    let ctx = Context::new();
    ctx.set_connect_timeout(Duration::from_secs(5));
    ctx.set_sync_timeout(Duration::from_secs(5));
    ctx
}

/// Raw bytes of a listener greeting advertising `profiles`.
pub fn greeting_bytes(profiles: &[&str]) -> Vec<u8> {
    let body = if profiles.is_empty() {
        "<greeting />".to_string()
    } else {
        let mut body = String::from("<greeting>");
        for uri in profiles {
            body.push_str(&format!("<profile uri='{uri}' />"));
        }
        body.push_str("</greeting>");
        body
    };
    Frame::build_data(
        FrameType::Rpy,
        0,
        0,
        false,
        0,
        None,
        Some("application/beep+xml"),
        None,
        body.as_bytes(),
    )
}

/// One step of a scripted peer.
pub enum Step {
    /// Send a greeting advertising these profiles.
    SendGreeting(Vec<&'static str>),
    /// Send raw bytes.
    Send(Vec<u8>),
    /// Read and discard bytes until one full frame went past (trailer
    /// seen). Used to consume the client greeting.
    ReadFrame,
    /// Pause the script.
    Sleep(Duration),
    /// Keep the connection open for this long before the script ends.
    Hold(Duration),
}

/// A scripted fake peer listening on an ephemeral loopback port.
pub struct ScriptedPeer {
    port: u16,
    handle: Option<JoinHandle<()>>,
}

impl ScriptedPeer {
    /// Bind, then play `steps` against the first accepted connection on a
    /// background thread. The connection closes when the script ends.
    pub fn spawn(steps: Vec<Step>) -> ScriptedPeer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted peer");
        let port = listener.local_addr().expect("local addr").port();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            for step in steps {
                if run_step(&mut stream, step).is_none() {
                    break;
                }
            }
        });

        ScriptedPeer {
            port,
            handle: Some(handle),
        }
    }

    /// The port the peer listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the script to finish.
    pub fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_step(stream: &mut TcpStream, step: Step) -> Option<()> {
    match step {
        Step::SendGreeting(profiles) => {
            stream.write_all(&greeting_bytes(&profiles)).ok()?;
            stream.flush().ok()?;
        }
        Step::Send(bytes) => {
            stream.write_all(&bytes).ok()?;
            stream.flush().ok()?;
        }
        Step::ReadFrame => {
            let mut seen = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = stream.read(&mut byte).ok()?;
                if n == 0 {
                    return None;
                }
                seen.push(byte[0]);
                if seen.ends_with(b"END\r\n") {
                    break;
                }
            }
        }
        Step::Sleep(duration) => std::thread::sleep(duration),
        Step::Hold(duration) => std::thread::sleep(duration),
    }
    Some(())
}

/// Read the next frame the way a reader loop would: park the session in a
/// wait set until it turns readable, then pull one frame. Gives up after
/// `deadline`.
pub fn next_frame_blocking(
    session: &bxp::peer::Session,
    deadline: Duration,
) -> bxp::peer::Result<Option<Frame>> {
    let ctx = session.context().clone();
    let started = std::time::Instant::now();
    loop {
        match session.next_frame()? {
            Some(frame) => return Ok(Some(frame)),
            None => {
                if started.elapsed() > deadline {
                    return Ok(None);
                }
                let mut set =
                    WaitSet::new(ctx.io_mechanism(), WaitDirection::Read, ctx.hard_sock_limit());
                if !set.add(session.socket(), Some(session)) {
                    return Ok(None);
                }
                // Bounded wait (500 ms); readiness or timeout both loop
                // back into the read.
                let _ = set.wait(session.socket());
            }
        }
    }
}
