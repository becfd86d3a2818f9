//! Channel bookkeeping: numbering, profile binding and per-channel flow
//! control state.
//!
//! The channel management protocol itself (starting and closing channels
//! over channel 0) lives outside this crate; the session engine only keeps
//! the table of live channels, their sequence-number windows and their
//! back-references. Channel 0 exists on every non-listener-only session
//! for its whole lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::frame::Frame;
use super::session::{Session, SessionCore};

/// Channel numbers are confined to 31 bits; the allocator wraps there.
pub const MAX_CHANNELS: u32 = 2_147_483_647;

/// Default per-channel receive window, in octets.
pub const DEFAULT_WINDOW_SIZE: u32 = 4096;

/// Profile recorded on channel 0, which runs the management protocol and
/// has no application profile.
pub const MANAGEMENT_PROFILE: &str = "not applicable";

#[derive(Debug)]
struct SeqState {
    /// Next sequence number to stamp on an outbound frame.
    next_seqno: u32,
    /// Highest sequence number the remote may send us, inclusive bound of
    /// the advertised window.
    max_seqno_accepted: u32,
    /// Cumulative count of payload octets delivered upward.
    consumed: u32,
    /// Highest sequence number the remote currently accepts from us.
    remote_max_seqno: u32,
    /// Our advertised window size.
    window_size: u32,
}

#[derive(Debug)]
struct ChannelInner {
    number: u32,
    profile: String,
    connected: AtomicBool,
    session: Mutex<Weak<SessionCore>>,
    seq: Mutex<SeqState>,
}

/// A channel registered on a session. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel record with the default window.
    pub fn new(number: u32, profile: impl Into<String>) -> Channel {
        Channel::with_window(number, profile, DEFAULT_WINDOW_SIZE)
    }

    /// Create a channel record advertising a specific receive window.
    pub fn with_window(number: u32, profile: impl Into<String>, window: u32) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                number,
                profile: profile.into(),
                connected: AtomicBool::new(false),
                session: Mutex::new(Weak::new()),
                seq: Mutex::new(SeqState {
                    next_seqno: 0,
                    max_seqno_accepted: window.wrapping_sub(1),
                    consumed: 0,
                    remote_max_seqno: window.wrapping_sub(1),
                    window_size: window,
                }),
            }),
        }
    }

    /// Channel number.
    pub fn number(&self) -> u32 {
        self.inner.number
    }

    /// Profile URI this channel runs.
    pub fn profile(&self) -> &str {
        &self.inner.profile
    }

    /// Check whether this channel is registered on a live session.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }

    /// The owning session, while the channel is registered.
    pub fn session(&self) -> Option<Session> {
        self.inner
            .session
            .lock()
            .unwrap()
            .upgrade()
            .map(Session::from_core)
    }

    pub(crate) fn bind_session(&self, core: &Arc<SessionCore>) {
        *self.inner.session.lock().unwrap() = Arc::downgrade(core);
    }

    /// Drop the session back-reference; called on removal so the pointer
    /// never dangles.
    pub(crate) fn unbind_session(&self) {
        *self.inner.session.lock().unwrap() = Weak::new();
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    /// Our advertised window size.
    pub fn window_size(&self) -> u32 {
        self.inner.seq.lock().unwrap().window_size
    }

    /// Highest sequence number the remote peer may use, as currently
    /// advertised by us.
    pub fn max_seqno_accepted(&self) -> u32 {
        self.inner.seq.lock().unwrap().max_seqno_accepted
    }

    /// Highest sequence number the remote peer currently accepts from us.
    pub fn remote_max_seqno(&self) -> u32 {
        self.inner.seq.lock().unwrap().remote_max_seqno
    }

    /// Next sequence number for the outbound side of this channel.
    pub fn next_seqno(&self) -> u32 {
        self.inner.seq.lock().unwrap().next_seqno
    }

    /// Account `octets` of outbound payload, advancing the next sequence
    /// number modulo 2^32.
    pub fn advance_seqno(&self, octets: u32) {
        let mut seq = self.inner.seq.lock().unwrap();
        seq.next_seqno = seq.next_seqno.wrapping_add(octets);
    }

    /// Check a received frame against the advertised window. The frame
    /// extent (`seqno + size`, counting MIME headers, which the header
    /// `size` field already includes at this point) must not run past the
    /// last accepted sequence number.
    pub(crate) fn check_incoming_seqno(&self, frame_seqno: u32, frame_size: usize) -> bool {
        let seq = self.inner.seq.lock().unwrap();
        u64::from(frame_seqno) + frame_size as u64 <= u64::from(seq.max_seqno_accepted) + 1
    }

    /// Account a delivered frame and slide the advertised window so the
    /// peer may keep sending. Returns `(ackno, window)` for the SEQ frame
    /// that announces the new window, or `None` when SEQ emission is
    /// suppressed on the owning session.
    pub fn frame_delivered(&self, frame: &Frame) -> Option<(u32, u32)> {
        let total = frame.size() + frame.mime_headers_size();
        let mut seq = self.inner.seq.lock().unwrap();
        seq.consumed = seq.consumed.wrapping_add(total as u32);
        seq.max_seqno_accepted = seq
            .consumed
            .wrapping_add(seq.window_size)
            .wrapping_sub(1);

        let suppressed = self
            .session()
            .is_some_and(|session| session.seq_frames_disabled());
        if suppressed {
            return None;
        }
        Some((seq.consumed, seq.window_size))
    }

    /// Apply a SEQ frame from the peer: it acknowledges `ackno` and opens
    /// `window` octets beyond it for our outbound side.
    pub fn apply_seq(&self, ackno: u32, window: u32) {
        let mut seq = self.inner.seq.lock().unwrap();
        seq.remote_max_seqno = ackno.wrapping_add(window).wrapping_sub(1);
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A pool of channels kept ready on a session so applications can borrow
/// one without paying the start round trip. The engine only owns the
/// bookkeeping: pool identity and the member channel numbers.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    id: u64,
    profile: String,
    members: Vec<u32>,
}

impl ChannelPool {
    pub(crate) fn new(id: u64, profile: impl Into<String>, members: Vec<u32>) -> ChannelPool {
        ChannelPool {
            id,
            profile: profile.into(),
            members,
        }
    }

    /// Pool identifier, unique per session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Profile URI the pooled channels run.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Channel numbers currently owned by the pool.
    pub fn members(&self) -> &[u32] {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::frame::FrameType;

    #[test]
    fn test_window_accounting() {
        let channel = Channel::new(1, "http://example.org/beep/echo");
        assert_eq!(channel.window_size(), DEFAULT_WINDOW_SIZE);
        assert_eq!(channel.max_seqno_accepted(), 4095);

        // A frame that fits exactly.
        assert!(channel.check_incoming_seqno(0, 4096));
        // One octet beyond the window.
        assert!(!channel.check_incoming_seqno(0, 4097));
        assert!(!channel.check_incoming_seqno(0, 5000));
        assert!(!channel.check_incoming_seqno(4000, 97));
    }

    #[test]
    fn test_delivery_slides_window() {
        let channel = Channel::new(1, "p");
        let frame = Frame::new(1, FrameType::Msg, 1, 0, false, 0, None, &b"\r\nabcd"[..]);
        // 6 octets of on-wire payload.
        let (ackno, window) = channel.frame_delivered(&frame).unwrap();
        assert_eq!(ackno, 6);
        assert_eq!(window, DEFAULT_WINDOW_SIZE);
        assert_eq!(channel.max_seqno_accepted(), 6 + DEFAULT_WINDOW_SIZE - 1);
        assert!(channel.check_incoming_seqno(6, 4096));
    }

    #[test]
    fn test_apply_seq_opens_remote_window() {
        let channel = Channel::new(1, "p");
        channel.apply_seq(4096, 8192);
        assert_eq!(channel.remote_max_seqno(), 4096 + 8192 - 1);
    }

    #[test]
    fn test_outbound_seqno_wraps() {
        let channel = Channel::new(1, "p");
        channel.advance_seqno(u32::MAX);
        channel.advance_seqno(3);
        assert_eq!(channel.next_seqno(), 2);
    }

    #[test]
    fn test_unbound_channel_has_no_session() {
        let channel = Channel::new(3, "p");
        assert!(channel.session().is_none());
        assert!(!channel.is_connected());
    }
}
