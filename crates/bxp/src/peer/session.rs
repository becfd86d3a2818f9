//! BEEP sessions: per-connection state and lifecycle.
//!
//! A [`Session`] is one TCP association carrying any number of channels.
//! The handle is cheap to clone; clones share state, and the underlying
//! resources are reclaimed when the last clone is dropped. Sessions are
//! created actively with [`Session::connect`], passively by accepting on a
//! master listener created with [`Session::listen`], or wrapped around an
//! existing descriptor with [`Session::from_socket`].
//!
//! # Example
//!
//! ```ignore
//! use bxp::peer::{Context, Session};
//!
//! let ctx = Context::new();
//! let session = Session::connect(&ctx, "beep.example.org", 10288)?;
//! for uri in session.remote_profiles() {
//!     println!("peer offers {uri}");
//! }
//! session.close();
//! ```
//!
//! # Locking
//!
//! Every concern owns its own narrow mutex (channel table, user data,
//! close handlers, channel update handlers, pools, profile masks, pending
//! errors, read state); `op_lock` serializes the not-connected transition
//! so it happens exactly once. No lock is ever held across network I/O,
//! except the read state lock which only guards non-blocking reads.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;

use super::channel::{Channel, ChannelPool, MANAGEMENT_PROFILE, MAX_CHANNELS};
use super::context::{Context, Stage};
use super::error::{Error, Result, Status};
use super::frame::{FRAME_TRAILER, Frame, FrameType, RawHeader, parse_header};
use super::greetings::{self, Greeting};
use super::socket::{self, INVALID_SOCKET, Transport};
use super::waiter::WaitDirection;

/// Maximum length of a frame header line, CRLF included.
const MAX_HEADER_LINE: usize = 99;

/// Consecutive empty non-blocking reads tolerated before the session is
/// declared dead.
const MAX_NO_DATA_OPERATIONS: u32 = 25;

/// The role a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Actively opened the connection.
    Initiator,
    /// Accepted from a master listener; speaks BEEP.
    Listener,
    /// Only accepts connections; carries no channels and no flow control
    /// state.
    MasterListener,
    /// Role not established yet.
    Unknown,
}

/// Options applied while creating a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOpts {
    /// serverName the initiator intends to request on its first channel.
    pub server_name: Option<String>,
    /// Record the serverName of the first successful channel start.
    pub acquire_server_name: bool,
}

/// Custom send hook: `(session, data) -> bytes written`.
pub type SendHandlerFn = dyn Fn(&Session, &[u8]) -> io::Result<usize> + Send + Sync;

/// Custom receive hook: `(session, buffer) -> bytes read`.
pub type RecvHandlerFn = dyn Fn(&Session, &mut [u8]) -> io::Result<usize> + Send + Sync;

/// Hook invoked before the first read on an accepted session.
pub type PrereadFn = dyn Fn(&Session) + Send + Sync;

/// Per-session channel added/removed notification.
pub type ChannelUpdateFn = dyn Fn(&Channel) + Send + Sync;

/// Profile mask: return `Some(error message)` to hide the profile from
/// advertisement and reject channel starts on it; the message may be
/// empty.
pub type ProfileMaskFn =
    dyn for<'a> Fn(&Session, &ProfileMaskRequest<'a>) -> Option<String> + Send + Sync;

/// What a profile mask is being asked about.
#[derive(Debug, Default)]
pub struct ProfileMaskRequest<'a> {
    /// Channel number of the start request, when one is being filtered.
    pub channel: Option<u32>,
    /// The profile URI under consideration.
    pub uri: &'a str,
    /// Profile content carried by the start request.
    pub profile_content: Option<&'a str>,
    /// Content encoding of the start request.
    pub encoding: Option<&'a str>,
    /// serverName requested by the start.
    pub server_name: Option<&'a str>,
    /// The frame carrying the start request, when filtering one.
    pub frame: Option<&'a Frame>,
}

impl<'a> ProfileMaskRequest<'a> {
    /// Ask about advertising `uri` in the local greeting.
    pub fn for_uri(uri: &'a str) -> ProfileMaskRequest<'a> {
        ProfileMaskRequest {
            uri,
            ..Default::default()
        }
    }
}

struct AddrState {
    host: String,
    port: u16,
    host_ip: Option<String>,
    local_addr: Option<String>,
    local_port: Option<u16>,
}

struct ChannelTable {
    map: HashMap<u32, Channel>,
    /// Last number handed out by the allocator; `None` until the first
    /// allocation.
    last_channel: Option<u32>,
}

struct PoolTable {
    map: HashMap<u64, ChannelPool>,
    next_id: u64,
}

type OnCloseFn = Box<dyn FnOnce(&Session) + Send>;

#[derive(Default)]
struct CloseHandlers {
    simple: Vec<(u64, OnCloseFn)>,
    full: Vec<(u64, OnCloseFn)>,
}

#[derive(Default)]
struct UpdateHandlers {
    added: Vec<(u64, Arc<ChannelUpdateFn>)>,
    removed: Vec<(u64, Arc<ChannelUpdateFn>)>,
}

struct FrameStash {
    header: RawHeader,
    channel: Channel,
    buffer: BytesMut,
    bytes_read: usize,
}

#[derive(Default)]
struct ReadState {
    pending_line: Vec<u8>,
    stash: Option<FrameStash>,
    no_data_opers: u32,
}

/// Frame size chooser: `(channel, next_seqno, msg_size, max_seqno)`.
pub type FrameSizeFn = super::context::FrameSizeFn;

pub(crate) struct SessionCore {
    ctx: Context,
    id: u64,
    role: Role,
    transport: Transport,
    socket: AtomicI32,
    connected: AtomicBool,
    blocked: AtomicBool,
    close_socket_on_shutdown: AtomicBool,
    seq_frames_disabled: AtomicBool,
    being_closed: AtomicBool,
    addr: Mutex<AddrState>,
    state: Mutex<(Status, String)>,
    op_lock: Mutex<()>,
    channels: Mutex<ChannelTable>,
    pools: Mutex<PoolTable>,
    data: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    close_handlers: Mutex<CloseHandlers>,
    update_handlers: Mutex<UpdateHandlers>,
    masks: Mutex<Vec<(u64, Arc<ProfileMaskFn>)>>,
    pending_errors: Mutex<Vec<(i32, String)>>,
    next_local_id: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    last_idle_stamp: AtomicU64,
    read_state: Mutex<ReadState>,
    send_handler: Mutex<Option<Arc<SendHandlerFn>>>,
    recv_handler: Mutex<Option<Arc<RecvHandlerFn>>>,
    preread: Mutex<Option<Arc<PrereadFn>>>,
    preread_done: AtomicBool,
    frame_size: Mutex<Option<Arc<FrameSizeFn>>>,
    server_name: Mutex<Option<String>>,
    greeting: Mutex<Option<Arc<Greeting>>>,
}

/// A BEEP session handle. Clones share state; the last drop releases the
/// per-session resources and runs the user-data destructors exactly once.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    pub(crate) fn from_core(core: Arc<SessionCore>) -> Session {
        Session { core }
    }

    fn build_core(ctx: &Context, role: Role, transport: Transport) -> Arc<SessionCore> {
        Arc::new(SessionCore {
            ctx: ctx.clone(),
            id: ctx.next_session_id(),
            role,
            transport,
            socket: AtomicI32::new(INVALID_SOCKET),
            connected: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            close_socket_on_shutdown: AtomicBool::new(true),
            seq_frames_disabled: AtomicBool::new(false),
            being_closed: AtomicBool::new(false),
            addr: Mutex::new(AddrState {
                host: String::new(),
                port: 0,
                host_ip: None,
                local_addr: None,
                local_port: None,
            }),
            state: Mutex::new((Status::Ok, String::new())),
            op_lock: Mutex::new(()),
            channels: Mutex::new(ChannelTable {
                map: HashMap::new(),
                last_channel: None,
            }),
            pools: Mutex::new(PoolTable {
                map: HashMap::new(),
                next_id: 1,
            }),
            data: Mutex::new(HashMap::new()),
            close_handlers: Mutex::new(CloseHandlers::default()),
            update_handlers: Mutex::new(UpdateHandlers::default()),
            masks: Mutex::new(Vec::new()),
            pending_errors: Mutex::new(Vec::new()),
            next_local_id: AtomicU64::new(1),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_idle_stamp: AtomicU64::new(unix_stamp()),
            read_state: Mutex::new(ReadState::default()),
            send_handler: Mutex::new(None),
            recv_handler: Mutex::new(None),
            preread: Mutex::new(None),
            preread_done: AtomicBool::new(false),
            frame_size: Mutex::new(None),
            server_name: Mutex::new(None),
            greeting: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Connect to `host:port` over IPv4, blocking until the greetings
    /// exchange completes or fails.
    pub fn connect(ctx: &Context, host: &str, port: u16) -> Result<Session> {
        Session::connect_full(ctx, host, port, Transport::Ipv4, SessionOpts::default())
    }

    /// Connect to `host:port` over IPv6.
    pub fn connect6(ctx: &Context, host: &str, port: u16) -> Result<Session> {
        Session::connect_full(ctx, host, port, Transport::Ipv6, SessionOpts::default())
    }

    /// Connect with an explicit transport and creation options.
    pub fn connect_full(
        ctx: &Context,
        host: &str,
        port: u16,
        transport: Transport,
        opts: SessionOpts,
    ) -> Result<Session> {
        let core = Session::build_core(ctx, Role::Initiator, transport);
        {
            let mut addr = core.addr.lock().unwrap();
            addr.host = host.to_string();
            addr.port = port;
        }
        let mut session = Session { core };
        tracing::debug!(
            id = session.id(),
            host,
            port,
            "creating initiator session"
        );
        session.establish(&opts)?;
        Ok(session)
    }

    /// Connect on a worker thread and hand the outcome to `on_connected`.
    pub fn connect_threaded<F>(
        ctx: &Context,
        host: impl Into<String>,
        port: u16,
        transport: Transport,
        opts: SessionOpts,
        on_connected: F,
    ) where
        F: FnOnce(Result<Session>) + Send + 'static,
    {
        let ctx = ctx.clone();
        let host = host.into();
        let spawned = std::thread::Builder::new()
            .name("bxp-connect".into())
            .spawn(move || {
                on_connected(Session::connect_full(&ctx, &host, port, transport, opts));
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn connect worker");
        }
    }

    /// Wrap an already connected socket in a session of the given role.
    /// Peer and local addressing are taken from the descriptor; channel 0
    /// is installed on every role except the master listener.
    pub fn from_socket(ctx: &Context, fd: RawFd, role: Role) -> Result<Session> {
        let core = Session::build_core(ctx, role, Transport::Ipv4);
        core.socket.store(fd, Ordering::SeqCst);
        core.connected.store(true, Ordering::SeqCst);

        {
            let mut addr = core.addr.lock().unwrap();
            if let Ok((peer_ip, peer_port)) = socket::peer_endpoint(fd) {
                addr.host = peer_ip.clone();
                addr.host_ip = Some(peer_ip);
                addr.port = peer_port;
            }
            if let Ok((local_ip, local_port)) = socket::local_endpoint(fd) {
                addr.local_addr = Some(local_ip);
                addr.local_port = Some(local_port);
            }
        }

        let session = Session { core };
        if role != Role::MasterListener {
            session.add_channel_no_notify(Channel::new(0, MANAGEMENT_PROFILE))?;
        }
        Ok(session)
    }

    /// Create a master listener session bound to `host:port`. The session
    /// only accepts; it has no channels and no flow control state.
    pub fn listen(ctx: &Context, host: &str, port: u16) -> Result<Session> {
        let fd = socket::listen_on(ctx, host, port, Transport::Ipv4)?;
        let core = Session::build_core(ctx, Role::MasterListener, Transport::Ipv4);
        core.socket.store(fd, Ordering::SeqCst);
        core.connected.store(true, Ordering::SeqCst);
        {
            let mut addr = core.addr.lock().unwrap();
            addr.host = host.to_string();
            addr.port = port;
            if let Ok((local_ip, local_port)) = socket::local_endpoint(fd) {
                addr.local_addr = Some(local_ip);
                addr.local_port = Some(local_port);
            }
        }
        tracing::debug!(id = core.id, host, port, "master listener ready");
        Ok(Session { core })
    }

    /// Accept one connection on a master listener, run the pre-accept
    /// actions and the greetings exchange, and return the resulting
    /// listener session.
    pub fn accept(&self) -> Result<Session> {
        if self.core.role != Role::MasterListener {
            return Err(Error::Misuse(
                "accept requires a master listener session".into(),
            ));
        }
        let fd = socket::accept(self.socket())?;
        if let Err(e) = socket::configure_new_socket(&self.core.ctx, fd) {
            socket::shutdown(fd);
            socket::close(fd);
            return Err(e);
        }

        let mut session = Session::from_socket(&self.core.ctx, fd, Role::Listener)?;
        self.core.ctx.notify_actions(&mut session, Stage::PreAccept)?;

        // The listener speaks first: greeting out, then wait for the
        // initiator's.
        let timeout = self.core.ctx.sync_timeout();
        let greeting = session.greetings_exchange(timeout)?;
        session.finish_creation(greeting)?;
        Ok(session)
    }

    /// Re-run the creation path on this session, reusing host, port,
    /// transport and user data. Channels and channel pools are discarded
    /// (with removal notifications), the pool allocator restarts, and the
    /// last error is cleared.
    pub fn reconnect(&self) -> Result<()> {
        if self.core.role != Role::Initiator {
            return Err(Error::Misuse("reconnect requires an initiator session".into()));
        }
        tracing::debug!(id = self.id(), "reconnecting session");

        // Drop the previous incarnation.
        self.close_all_channels(true);
        {
            let mut pools = self.core.pools.lock().unwrap();
            pools.map.clear();
            pools.next_id = 1;
        }
        self.core.pending_errors.lock().unwrap().clear();
        *self.core.state.lock().unwrap() = (Status::Ok, String::new());
        *self.core.greeting.lock().unwrap() = None;
        self.core.preread_done.store(false, Ordering::SeqCst);
        {
            let mut rs = self.core.read_state.lock().unwrap();
            *rs = ReadState::default();
        }
        let old = self.core.socket.swap(INVALID_SOCKET, Ordering::SeqCst);
        socket::shutdown(old);
        socket::close(old);
        self.core.connected.store(false, Ordering::SeqCst);

        let mut session = self.clone();
        session.establish(&SessionOpts::default())
    }

    /// The shared creation path: channel 0, TCP connect, greetings
    /// exchange, stage actions. Used by `connect_full` and `reconnect`.
    fn establish(&mut self, opts: &SessionOpts) -> Result<()> {
        if !self.channel_exists(0) {
            self.add_channel_no_notify(Channel::new(0, MANAGEMENT_PROFILE))?;
        }
        self.core.ctx.notify_session_created(self);

        let (host, port) = {
            let addr = self.core.addr.lock().unwrap();
            (addr.host.clone(), addr.port)
        };
        let ctx = self.core.ctx.clone();
        let (fd, remaining) = match socket::sock_connect(&ctx, &host, port, self.core.transport) {
            Ok(connected) => connected,
            Err(e) => {
                *self.core.state.lock().unwrap() = (e.status(), e.to_string());
                return Err(e);
            }
        };

        self.core.socket.store(fd, Ordering::SeqCst);
        self.core.connected.store(true, Ordering::SeqCst);
        {
            let mut addr = self.core.addr.lock().unwrap();
            if let Ok((local_ip, local_port)) = socket::local_endpoint(fd) {
                addr.local_addr = Some(local_ip);
                addr.local_port = Some(local_port);
            }
            if let Ok((peer_ip, _)) = socket::peer_endpoint(fd) {
                addr.host_ip = Some(peer_ip);
            }
        }

        let greeting = self.greetings_exchange(remaining)?;

        if let Some(server_name) = &opts.server_name {
            self.set_server_name(server_name.clone());
        }
        if opts.acquire_server_name {
            self.set_data("server-name-acquire", true);
        }

        self.finish_creation(greeting)
    }

    /// Post-greetings creation steps shared by both roles.
    fn finish_creation(&mut self, greeting: Arc<Greeting>) -> Result<()> {
        let ctx = self.core.ctx.clone();
        if greeting.features().is_some() || greeting.localize().is_some() {
            ctx.notify_actions(self, Stage::ProcessGreetingsFeatures)?;
        }
        ctx.notify_actions(self, Stage::PostCreated)?;
        ctx.notify_actions(self, Stage::PostCreatedOk)?;
        tracing::debug!(id = self.id(), "session creation complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Greetings exchange
    // ------------------------------------------------------------------

    /// Send the local greeting, then read frames until the peer's complete
    /// greeting arrives. Short reads re-arm a bounded read wait consuming
    /// `timeout`; the socket is left in non-blocking mode for the reader.
    fn greetings_exchange(&self, mut timeout: Duration) -> Result<Arc<Greeting>> {
        self.send_greeting()?;

        let mut pending: Option<Frame> = None;
        let greeting = loop {
            match self.next_frame() {
                Ok(Some(frame)) => {
                    if frame.kind() == FrameType::Seq {
                        if let Some(channel) = frame.channel_ref() {
                            channel.apply_seq(frame.seqno(), frame.size() as u32);
                        }
                        continue;
                    }
                    if frame.channel() != 0 || frame.kind() != FrameType::Rpy {
                        self.shutdown_with_status(
                            Status::ProtocolError,
                            "expected the session greeting as the first frame",
                        );
                        return Err(Error::Greetings(
                            "peer did not start with a greeting".into(),
                        ));
                    }

                    let frame = match pending.take() {
                        Some(first) => {
                            Frame::join(self.core.ctx.next_frame_id(), &first, &frame)?
                        }
                        None => frame,
                    };
                    if frame.more() {
                        pending = Some(frame);
                        continue;
                    }

                    match self.core.ctx.greetings_cache().resolve(frame.payload()) {
                        Ok(greeting) => break greeting,
                        Err(e) => {
                            self.shutdown_with_status(e.status(), &e.to_string());
                            return Err(e);
                        }
                    }
                }
                Ok(None) => {
                    if !self.is_ok() {
                        return Err(Error::Greetings(
                            "session closed while waiting for the peer greeting".into(),
                        ));
                    }
                    match socket::wait_on(
                        &self.core.ctx,
                        WaitDirection::Read,
                        self.socket(),
                        timeout,
                    ) {
                        Ok(remaining) => {
                            timeout = remaining;
                        }
                        Err(_) => {
                            self.set_not_connected(
                                "reached timeout while waiting for initial greetings frame",
                                Status::GreetingsFailure,
                            );
                            return Err(Error::Greetings(
                                "timed out waiting for the peer greeting".into(),
                            ));
                        }
                    }
                }
                Err(e) => {
                    return Err(Error::Greetings(format!(
                        "failed reading the peer greeting: {e}"
                    )));
                }
            }
        };

        // Back to the non-blocking mode the reader expects.
        let _ = socket::set_blocking(self.socket(), false);
        *self.core.greeting.lock().unwrap() = Some(Arc::clone(&greeting));
        tracing::debug!(
            id = self.id(),
            profiles = greeting.profiles().len(),
            "greetings exchange ok"
        );
        Ok(greeting)
    }

    /// Build and send the local greeting on channel 0, advertising every
    /// registered profile that no mask filters out.
    fn send_greeting(&self) -> Result<()> {
        let profiles: Vec<String> = self
            .core
            .ctx
            .advertised_profiles()
            .into_iter()
            .filter(|uri| {
                self.is_profile_filtered(&ProfileMaskRequest::for_uri(uri))
                    .is_none()
            })
            .collect();
        let body = greetings::build_greeting(&profiles, None, None);
        let bytes = Frame::build_data(
            FrameType::Rpy,
            0,
            0,
            false,
            0,
            None,
            Some("application/beep+xml"),
            None,
            body.as_bytes(),
        );
        self.send_raw(&bytes)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identity and status
    // ------------------------------------------------------------------

    /// The owning context.
    pub fn context(&self) -> &Context {
        &self.core.ctx
    }

    /// Session identifier, unique per context.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// The role this session plays.
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// The transport fixed at creation.
    pub fn transport(&self) -> Transport {
        self.core.transport
    }

    /// The socket descriptor, or [`INVALID_SOCKET`] after teardown.
    pub fn socket(&self) -> RawFd {
        self.core.socket.load(Ordering::SeqCst)
    }

    /// Check whether the session is connected and carries a valid socket.
    pub fn is_ok(&self) -> bool {
        self.core.connected.load(Ordering::SeqCst) && self.socket() != INVALID_SOCKET
    }

    /// Clone the handle only while the session is still connected.
    pub fn try_clone_connected(&self) -> Option<Session> {
        if self.is_ok() { Some(self.clone()) } else { None }
    }

    /// The last status recorded on this session.
    pub fn status(&self) -> Status {
        self.core.state.lock().unwrap().0
    }

    /// Human readable description of the last status transition.
    pub fn message(&self) -> String {
        self.core.state.lock().unwrap().1.clone()
    }

    /// The remote host this session was created against.
    pub fn host(&self) -> String {
        self.core.addr.lock().unwrap().host.clone()
    }

    /// The remote port this session was created against.
    pub fn port(&self) -> u16 {
        self.core.addr.lock().unwrap().port
    }

    /// The resolved remote address, computed lazily from the socket.
    pub fn host_ip(&self) -> Option<String> {
        let mut addr = self.core.addr.lock().unwrap();
        if addr.host_ip.is_none() {
            let fd = self.socket();
            if fd != INVALID_SOCKET {
                if let Ok((ip, _)) = socket::peer_endpoint(fd) {
                    addr.host_ip = Some(ip);
                }
            }
        }
        addr.host_ip.clone()
    }

    /// Local address of the connected socket.
    pub fn local_addr(&self) -> Option<String> {
        self.core.addr.lock().unwrap().local_addr.clone()
    }

    /// Local port of the connected socket.
    pub fn local_port(&self) -> Option<u16> {
        self.core.addr.lock().unwrap().local_port
    }

    /// Override the host and port recorded for this session, for setups
    /// where the dialed address and the logical peer differ.
    pub fn set_host_and_port(&self, host: impl Into<String>, port: u16) {
        let mut addr = self.core.addr.lock().unwrap();
        addr.host = host.into();
        addr.port = port;
        addr.host_ip = None;
    }

    /// Octets received over the lifetime of the session.
    pub fn bytes_received(&self) -> u64 {
        self.core.bytes_received.load(Ordering::Relaxed)
    }

    /// Octets sent over the lifetime of the session.
    pub fn bytes_sent(&self) -> u64 {
        self.core.bytes_sent.load(Ordering::Relaxed)
    }

    /// How long the session has been idle (no octets in either
    /// direction).
    pub fn idle_duration(&self) -> Duration {
        let stamp = self.core.last_idle_stamp.load(Ordering::Relaxed);
        Duration::from_secs(unix_stamp().saturating_sub(stamp))
    }

    pub(crate) fn record_transfer(&self, received: u64, sent: u64) {
        self.core
            .bytes_received
            .fetch_add(received, Ordering::Relaxed);
        self.core.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.core
            .last_idle_stamp
            .store(unix_stamp(), Ordering::Relaxed);
    }

    /// Flag the session as blocked: the reader stops watching it until
    /// unblocked.
    pub fn block(&self, block: bool) {
        self.core.blocked.store(block, Ordering::SeqCst);
    }

    /// Whether the session is blocked from the reader's point of view.
    pub fn is_blocked(&self) -> bool {
        self.core.blocked.load(Ordering::SeqCst)
    }

    /// Control whether teardown also shuts down the socket (default
    /// true). Disable when the descriptor is being handed over, as a TLS
    /// tunnel does.
    pub fn set_close_socket_on_shutdown(&self, close: bool) {
        self.core
            .close_socket_on_shutdown
            .store(close, Ordering::SeqCst);
    }

    /// The serverName this session is operating under, once set.
    pub fn server_name(&self) -> Option<String> {
        self.core.server_name.lock().unwrap().clone()
    }

    /// Record the session serverName. The first value sticks; later calls
    /// are ignored, matching the one-serverName-per-session rule.
    pub fn set_server_name(&self, name: impl Into<String>) {
        let mut server_name = self.core.server_name.lock().unwrap();
        if server_name.is_none() {
            *server_name = Some(name.into());
        }
    }

    /// Whether SEQ frame generation is disabled session-wide.
    pub fn seq_frames_disabled(&self) -> bool {
        self.core.seq_frames_disabled.load(Ordering::SeqCst)
    }

    /// Disable or re-enable SEQ frame generation for every channel of
    /// this session.
    pub fn set_seq_frames_disabled(&self, disabled: bool) {
        self.core
            .seq_frames_disabled
            .store(disabled, Ordering::SeqCst);
    }

    pub(crate) fn mark_being_closed(&self) {
        self.core.being_closed.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // User data dictionary
    // ------------------------------------------------------------------

    /// Attach a value under `key`. Overwriting drops the previous value;
    /// all remaining values are dropped when the last session handle
    /// goes away.
    pub fn set_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.core
            .data
            .lock()
            .unwrap()
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch the value stored under `key`, if it has the requested type.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.core.data.lock().unwrap().get(key).cloned()?;
        value.downcast().ok()
    }

    /// Remove the value stored under `key`, dropping it.
    pub fn delete_data(&self, key: &str) -> bool {
        self.core.data.lock().unwrap().remove(key).is_some()
    }

    // ------------------------------------------------------------------
    // Channel table
    // ------------------------------------------------------------------

    /// Look up a channel by number. Returns `None` on master listener
    /// sessions, which carry no channels.
    pub fn channel(&self, number: u32) -> Option<Channel> {
        self.core.channels.lock().unwrap().map.get(&number).cloned()
    }

    /// Check whether a channel number is registered.
    pub fn channel_exists(&self, number: u32) -> bool {
        self.core.channels.lock().unwrap().map.contains_key(&number)
    }

    /// Number of channels registered, channel 0 included.
    pub fn channels_count(&self) -> usize {
        self.core.channels.lock().unwrap().map.len()
    }

    /// Visit every channel while `visit` keeps returning `true`. Returns
    /// the number of channels visited.
    pub fn for_each_channel<F: FnMut(&Channel) -> bool>(&self, mut visit: F) -> usize {
        let channels: Vec<Channel> = {
            let table = self.core.channels.lock().unwrap();
            table.map.values().cloned().collect()
        };
        let mut visited = 0;
        for channel in &channels {
            visited += 1;
            if !visit(channel) {
                break;
            }
        }
        visited
    }

    /// First channel running the given profile URI.
    pub fn channel_by_uri(&self, uri: &str) -> Option<Channel> {
        self.channel_by_selector(|channel| channel.profile() == uri)
    }

    /// First channel matching an arbitrary selector.
    pub fn channel_by_selector<F: Fn(&Channel) -> bool>(&self, selector: F) -> Option<Channel> {
        let table = self.core.channels.lock().unwrap();
        table.map.values().find(|c| selector(c)).cloned()
    }

    /// Number of channels running the given profile URI.
    pub fn channel_count_for(&self, uri: &str) -> usize {
        let table = self.core.channels.lock().unwrap();
        table.map.values().filter(|c| c.profile() == uri).count()
    }

    /// Next free channel number for this peer: odd on initiator sessions,
    /// even on listener sessions, never 0, skipping live numbers.
    pub fn next_channel_number(&self) -> Option<u32> {
        if !self.core.connected.load(Ordering::SeqCst) {
            return None;
        }
        let seed = match self.core.role {
            Role::Initiator => 1,
            _ => 2,
        };
        let mut table = self.core.channels.lock().unwrap();
        let mut candidate = match table.last_channel {
            None => seed,
            Some(last) => {
                let next = (last + 2) % MAX_CHANNELS;
                if next == 0 { seed } else { next }
            }
        };
        while table.map.contains_key(&candidate) {
            candidate = (candidate + 2) % MAX_CHANNELS;
            if candidate == 0 {
                candidate = seed;
            }
        }
        table.last_channel = Some(candidate);
        Some(candidate)
    }

    /// Register a channel, firing the added notifications.
    pub fn add_channel(&self, channel: Channel) -> Result<()> {
        self.add_channel_common(channel, true)
    }

    /// Register a channel without firing notifications.
    pub fn add_channel_no_notify(&self, channel: Channel) -> Result<()> {
        self.add_channel_common(channel, false)
    }

    fn add_channel_common(&self, channel: Channel, notify: bool) -> Result<()> {
        if self.core.role == Role::MasterListener {
            return Err(Error::Misuse(
                "master listener sessions carry no channels".into(),
            ));
        }
        {
            let mut table = self.core.channels.lock().unwrap();
            if table.map.contains_key(&channel.number()) {
                return Err(Error::Misuse(format!(
                    "channel {} already exists on this session",
                    channel.number()
                )));
            }
            channel.bind_session(&self.core);
            channel.set_connected(true);
            table.map.insert(channel.number(), channel.clone());
        }
        // Notify outside the channel table lock so handlers may inspect
        // or mutate the table without deadlocking.
        if notify {
            self.notify_channel_update(&channel, true);
        }
        Ok(())
    }

    /// Remove a channel, firing the removed notifications and telling the
    /// sequencer to drop queued frames for it. Returns the channel that
    /// was removed.
    pub fn remove_channel(&self, number: u32) -> Option<Channel> {
        self.remove_channel_common(number, true)
    }

    /// Remove a channel without firing notifications.
    pub fn remove_channel_no_notify(&self, number: u32) -> Option<Channel> {
        self.remove_channel_common(number, false)
    }

    fn remove_channel_common(&self, number: u32, notify: bool) -> Option<Channel> {
        let channel = self.channel(number)?;
        tracing::debug!(
            id = self.id(),
            channel = number,
            remaining = self.channels_count(),
            "removing channel"
        );
        if notify {
            self.notify_channel_update(&channel, false);
        }
        self.core.ctx.notify_channel_dropped(&channel);

        self.core.channels.lock().unwrap().map.remove(&number);
        channel.set_connected(false);
        channel.unbind_session();
        Some(channel)
    }

    fn notify_channel_update(&self, channel: &Channel, added: bool) {
        let handlers: Vec<Arc<ChannelUpdateFn>> = {
            let lists = self.core.update_handlers.lock().unwrap();
            let list = if added { &lists.added } else { &lists.removed };
            list.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(channel);
        }
        self.core.ctx.notify_channel_update(channel, added);
    }

    /// Register a handler fired on every channel insertion.
    pub fn on_channel_added<F>(&self, handler: F) -> u64
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        let id = self.next_local_id();
        self.core
            .update_handlers
            .lock()
            .unwrap()
            .added
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler fired on every channel removal.
    pub fn on_channel_removed<F>(&self, handler: F) -> u64
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        let id = self.next_local_id();
        self.core
            .update_handlers
            .lock()
            .unwrap()
            .removed
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a channel update handler by identifier.
    pub fn remove_channel_update_handler(&self, id: u64) -> bool {
        let mut lists = self.core.update_handlers.lock().unwrap();
        let before = lists.added.len() + lists.removed.len();
        lists.added.retain(|(entry, _)| *entry != id);
        lists.removed.retain(|(entry, _)| *entry != id);
        lists.added.len() + lists.removed.len() != before
    }

    /// Close every channel. A snapshot is taken first so handlers may
    /// mutate the table; channel 0 goes last and only when requested.
    pub fn close_all_channels(&self, including_zero: bool) -> bool {
        let numbers: Vec<u32> = {
            let table = self.core.channels.lock().unwrap();
            table.map.keys().copied().collect()
        };
        for number in numbers.iter().filter(|n| **n != 0) {
            self.remove_channel(*number);
        }
        if including_zero && numbers.contains(&0) {
            self.remove_channel(0);
        }
        true
    }

    // ------------------------------------------------------------------
    // Channel pools
    // ------------------------------------------------------------------

    /// Record a channel pool over the given members, assigning the next
    /// pool identifier.
    pub fn add_channel_pool(&self, profile: impl Into<String>, members: Vec<u32>) -> ChannelPool {
        let mut pools = self.core.pools.lock().unwrap();
        let id = pools.next_id;
        pools.next_id += 1;
        let pool = ChannelPool::new(id, profile, members);
        pools.map.insert(id, pool.clone());
        pool
    }

    /// Look up a channel pool by identifier.
    pub fn channel_pool(&self, id: u64) -> Option<ChannelPool> {
        self.core.pools.lock().unwrap().map.get(&id).cloned()
    }

    /// Number of channel pools registered.
    pub fn channel_pools_count(&self) -> usize {
        self.core.pools.lock().unwrap().map.len()
    }

    /// Remove a channel pool by identifier.
    pub fn remove_channel_pool(&self, id: u64) -> bool {
        self.core.pools.lock().unwrap().map.remove(&id).is_some()
    }

    // ------------------------------------------------------------------
    // Close handlers
    // ------------------------------------------------------------------

    /// Register a close handler. Handlers fire once, asynchronously, on
    /// the transition to not-connected, in registration order.
    pub fn on_close<F>(&self, handler: F) -> u64
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let id = self.next_local_id();
        self.core
            .close_handlers
            .lock()
            .unwrap()
            .simple
            .push((id, Box::new(handler)));
        id
    }

    /// Register a close handler on the full list, optionally at the
    /// front. The full list fires after the simple one.
    pub fn on_close_full<F>(&self, handler: F, insert_first: bool) -> u64
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let id = self.next_local_id();
        let mut handlers = self.core.close_handlers.lock().unwrap();
        if insert_first {
            handlers.full.insert(0, (id, Box::new(handler)));
        } else {
            handlers.full.push((id, Box::new(handler)));
        }
        id
    }

    /// Remove a registered close handler before it fires.
    pub fn remove_on_close(&self, id: u64) -> bool {
        let mut handlers = self.core.close_handlers.lock().unwrap();
        let before = handlers.simple.len() + handlers.full.len();
        handlers.simple.retain(|(entry, _)| *entry != id);
        handlers.full.retain(|(entry, _)| *entry != id);
        handlers.simple.len() + handlers.full.len() != before
    }

    /// Drain the close handler lists and fire them, in registration
    /// order, on a freshly spawned worker holding its own session handle.
    /// Handlers are free to take other sessions' locks or close other
    /// sessions (or this one again) without deadlocking the caller.
    fn invoke_close_handlers(&self) {
        if self.core.ctx.is_finishing() {
            return;
        }
        let drained: Vec<OnCloseFn> = {
            let mut handlers = self.core.close_handlers.lock().unwrap();
            let simple = std::mem::take(&mut handlers.simple);
            let full = std::mem::take(&mut handlers.full);
            simple
                .into_iter()
                .chain(full)
                .map(|(_, handler)| handler)
                .collect()
        };
        if drained.is_empty() {
            return;
        }

        let session = self.clone();
        let spawned = std::thread::Builder::new()
            .name("bxp-on-close".into())
            .spawn(move || {
                for handler in drained {
                    handler(&session);
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn close notification worker");
        }
    }

    // ------------------------------------------------------------------
    // Profile masks
    // ------------------------------------------------------------------

    /// Install a profile mask. Masks run in installation order; the first
    /// one to filter wins.
    pub fn set_profile_mask<F>(&self, mask: F) -> u64
    where
        F: for<'a> Fn(&Session, &ProfileMaskRequest<'a>) -> Option<String> + Send + Sync + 'static,
    {
        let id = self.next_local_id();
        self.core.masks.lock().unwrap().push((id, Arc::new(mask)));
        id
    }

    /// Ask every installed mask about `request`. Returns the first
    /// filtering mask's error message, or `None` when the profile passes.
    pub fn is_profile_filtered(&self, request: &ProfileMaskRequest<'_>) -> Option<String> {
        let masks: Vec<Arc<ProfileMaskFn>> = {
            let masks = self.core.masks.lock().unwrap();
            masks.iter().map(|(_, m)| Arc::clone(m)).collect()
        };
        for mask in masks {
            if let Some(message) = mask(self, request) {
                return Some(message);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Remote greeting accessors
    // ------------------------------------------------------------------

    /// The decoded remote greeting, shared with the context cache.
    pub fn greeting(&self) -> Option<Arc<Greeting>> {
        self.core.greeting.lock().unwrap().clone()
    }

    /// Profile URIs advertised by the remote peer.
    pub fn remote_profiles(&self) -> Vec<String> {
        self.greeting()
            .map(|g| g.profiles().to_vec())
            .unwrap_or_default()
    }

    /// Features announced in the remote greeting.
    pub fn features(&self) -> Option<String> {
        self.greeting()?.features().map(str::to_string)
    }

    /// Localize preference announced in the remote greeting.
    pub fn localize(&self) -> Option<String> {
        self.greeting()?.localize().map(str::to_string)
    }

    /// Check whether the remote peer advertised `uri`.
    pub fn is_profile_supported(&self, uri: &str) -> bool {
        self.greeting().is_some_and(|g| g.supports_profile(uri))
    }

    // ------------------------------------------------------------------
    // Channel error queue
    // ------------------------------------------------------------------

    /// Stash a channel start failure for later application retrieval.
    pub fn push_channel_error(&self, code: i32, message: impl Into<String>) {
        self.core
            .pending_errors
            .lock()
            .unwrap()
            .push((code, message.into()));
    }

    /// Pop the most recent channel error, if any (last in, first out).
    pub fn pop_channel_error(&self) -> Option<(i32, String)> {
        self.core.pending_errors.lock().unwrap().pop()
    }

    // ------------------------------------------------------------------
    // I/O hooks
    // ------------------------------------------------------------------

    /// Replace the send implementation (default: `send(2)`).
    pub fn set_send_handler<F>(&self, handler: F)
    where
        F: Fn(&Session, &[u8]) -> io::Result<usize> + Send + Sync + 'static,
    {
        *self.core.send_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Replace the receive implementation (default: `recv(2)`).
    pub fn set_receive_handler<F>(&self, handler: F)
    where
        F: Fn(&Session, &mut [u8]) -> io::Result<usize> + Send + Sync + 'static,
    {
        *self.core.recv_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Install the hook invoked before the first read on this session.
    pub fn set_preread_handler<F>(&self, handler: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        *self.core.preread.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Install a per-session frame size chooser, overriding the context
    /// default.
    pub fn set_frame_size_handler<F>(&self, handler: F)
    where
        F: Fn(&Channel, u32, usize, u32) -> usize + Send + Sync + 'static,
    {
        *self.core.frame_size.lock().unwrap() = Some(Arc::new(handler));
    }

    /// The frame size the sequencer should use for the next fragment:
    /// session override, then context handler, then the stock policy.
    pub fn next_frame_size(
        &self,
        channel: &Channel,
        next_seqno: u32,
        msg_size: usize,
        max_seqno: u32,
    ) -> usize {
        if let Some(handler) = self.core.frame_size.lock().unwrap().clone() {
            return handler(channel, next_seqno, msg_size, max_seqno);
        }
        if let Some(handler) = self.core.ctx.frame_size_handler() {
            return handler(channel, next_seqno, msg_size, max_seqno);
        }
        Context::default_frame_size(channel, next_seqno, msg_size, max_seqno)
    }

    fn send_via_handler(&self, data: &[u8]) -> io::Result<usize> {
        let handler = self.core.send_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(self, data),
            None => socket::send(self.socket(), data),
        }
    }

    fn recv_via_handler(&self, buf: &mut [u8]) -> io::Result<usize> {
        let handler = self.core.recv_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(self, buf),
            None => socket::recv(self.socket(), buf),
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Write raw bytes, retrying on short or would-block writes by
    /// waiting for write readiness. After the configured number of
    /// wait-then-retry rounds the session is fatal-closed, unless
    /// unbounded retries were enabled on the context.
    pub fn send_raw(&self, data: &[u8]) -> Result<usize> {
        if !self.is_ok() {
            return Err(Error::NotConnected);
        }

        let mut written = 0;
        let mut retries: u32 = 0;
        while written < data.len() {
            match self.send_via_handler(&data[written..]) {
                Ok(0) => {
                    self.shutdown_with_status(
                        Status::UnnotifiedConnectionClose,
                        "remote peer closed the connection while writing",
                    );
                    return Err(Error::NotConnected);
                }
                Ok(n) => {
                    written += n;
                    self.record_transfer(0, n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    retries += 1;
                    if !self.core.ctx.write_timeout_close_disabled()
                        && retries > self.core.ctx.write_timeout_retries()
                    {
                        self.shutdown_with_status(
                            Status::Error,
                            "unable to write data, retry budget exhausted",
                        );
                        return Err(Error::Io(e));
                    }
                    tracing::trace!(
                        id = self.id(),
                        retries,
                        "write would block, waiting for readiness"
                    );
                    let timeout = self.core.ctx.sync_timeout();
                    if let Err(wait_err) = socket::wait_on(
                        &self.core.ctx,
                        WaitDirection::Write,
                        self.socket(),
                        timeout,
                    ) {
                        self.shutdown_with_status(
                            Status::Error,
                            format!("unable to write data: {wait_err}"),
                        );
                        return Err(wait_err);
                    }
                }
                Err(e) => {
                    self.shutdown_with_status(
                        Status::Error,
                        format!("failed to write to the socket: {e}"),
                    );
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Read the next complete frame off the session.
    ///
    /// Returns `Ok(None)` when no complete frame is available yet (short
    /// read on a non-blocking socket); the partial header line or payload
    /// is stashed on the session and the next call resumes it. Protocol
    /// violations fatal-close the session and return the error; the
    /// recorded status and message stay queryable afterwards.
    ///
    /// SEQ frames are returned unchanged for the caller to apply to the
    /// owning channel's flow control state.
    pub fn next_frame(&self) -> Result<Option<Frame>> {
        self.run_preread_hook();

        let mut rs = self.core.read_state.lock().unwrap();

        // Resume a partially read payload first.
        if rs.stash.is_some() {
            return self.resume_stash(&mut rs);
        }

        // Read (or finish reading) the header line.
        let line = match self.read_line(&mut rs) {
            LineStatus::Complete(line) => {
                rs.no_data_opers = 0;
                line
            }
            LineStatus::NeedMore => {
                rs.no_data_opers += 1;
                if rs.no_data_opers > MAX_NO_DATA_OPERATIONS {
                    drop(rs);
                    self.shutdown_with_status(
                        Status::Error,
                        "too many no-data operations over this session",
                    );
                    return Err(Error::protocol(
                        "too many no-data operations over this session",
                    ));
                }
                return Ok(None);
            }
            LineStatus::Closed => {
                drop(rs);
                return self.handle_peer_close();
            }
            LineStatus::Failed(e) => {
                drop(rs);
                self.shutdown_with_status(
                    Status::ProtocolError,
                    "an error occurred while reading the socket",
                );
                return Err(e);
            }
        };

        if line.len() < 2 || line[line.len() - 2] != b'\r' {
            drop(rs);
            self.shutdown_with_status(Status::ProtocolError, "no line definition found for frame");
            return Err(Error::protocol("no line definition found for frame"));
        }

        let header = match parse_header(&line) {
            Ok(header) => header,
            Err(e) => {
                drop(rs);
                self.shutdown_with_status(Status::ProtocolError, &e.to_string());
                return Err(e);
            }
        };

        let Some(channel) = self.channel(header.channel) else {
            drop(rs);
            self.shutdown_with_status(
                Status::ProtocolError,
                "received a frame header pointing to a channel that do not exists, \
                 closing connection",
            );
            return Err(Error::protocol("frame for an unknown channel"));
        };

        if header.kind == FrameType::Seq {
            let mut frame = Frame::seq(
                self.core.ctx.next_frame_id(),
                header.channel,
                header.seqno,
                header.size as u32,
            );
            frame.set_channel_ref(channel);
            self.record_transfer(line.len() as u64, 0);
            return Ok(Some(frame));
        }

        if header.more_char != b'*' && header.more_char != b'.' {
            drop(rs);
            self.shutdown_with_status(
                Status::ProtocolError,
                "poorly-formed frame: more char is wrong",
            );
            return Err(Error::protocol("poorly-formed frame: more char is wrong"));
        }

        if !channel.check_incoming_seqno(header.seqno, header.size) {
            let message = format!(
                "received an unexpected frame size (max seqno expected: {}, but received: {}), \
                 frame seqno: {}, frame size: {}, closing session",
                channel.max_seqno_accepted(),
                u64::from(header.seqno) + header.size as u64,
                header.seqno,
                header.size,
            );
            drop(rs);
            self.shutdown_with_status(Status::ProtocolError, &message);
            return Err(Error::Protocol(message));
        }

        // Read exactly size + trailer bytes; stash on a short read.
        let total = header.size + FRAME_TRAILER.len();
        let mut stash = FrameStash {
            header,
            channel,
            buffer: BytesMut::zeroed(total),
            bytes_read: 0,
        };
        self.record_transfer(line.len() as u64, 0);
        match self.fill_stash(&mut stash) {
            StashStatus::Complete => {
                drop(rs);
                self.finish_frame(stash)
            }
            StashStatus::NeedMore => {
                rs.stash = Some(stash);
                Ok(None)
            }
            StashStatus::Closed => {
                drop(rs);
                self.shutdown_with_status(
                    Status::ProtocolError,
                    "remote peer have closed connection while reading the rest of the frame",
                );
                Err(Error::protocol(
                    "remote peer have closed connection while reading the rest of the frame",
                ))
            }
            StashStatus::Failed(e) => {
                drop(rs);
                self.shutdown_with_status(
                    Status::ProtocolError,
                    "an error occurred while reading the socket",
                );
                Err(e)
            }
        }
    }

    fn run_preread_hook(&self) {
        let handler = self.core.preread.lock().unwrap().clone();
        if let Some(handler) = handler {
            if !self.core.preread_done.swap(true, Ordering::SeqCst) {
                handler(self);
            }
        }
    }

    fn resume_stash(
        &self,
        rs: &mut std::sync::MutexGuard<'_, ReadState>,
    ) -> Result<Option<Frame>> {
        let mut stash = rs.stash.take().expect("resume without a stash");
        match self.fill_stash(&mut stash) {
            StashStatus::Complete => self.finish_frame(stash),
            StashStatus::NeedMore => {
                rs.stash = Some(stash);
                Ok(None)
            }
            StashStatus::Closed => {
                self.shutdown_with_status(
                    Status::ProtocolError,
                    "remote peer have closed connection while reading the rest of the frame \
                     having received part of it",
                );
                Err(Error::protocol(
                    "remote peer have closed connection while reading the rest of the frame",
                ))
            }
            StashStatus::Failed(e) => {
                self.shutdown_with_status(
                    Status::ProtocolError,
                    "an error occurred while reading the socket",
                );
                Err(e)
            }
        }
    }

    fn fill_stash(&self, stash: &mut FrameStash) -> StashStatus {
        while stash.bytes_read < stash.buffer.len() {
            let at = stash.bytes_read;
            match self.recv_via_handler(&mut stash.buffer[at..]) {
                Ok(0) => return StashStatus::Closed,
                Ok(n) => {
                    stash.bytes_read += n;
                    self.record_transfer(n as u64, 0);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return StashStatus::NeedMore;
                }
                Err(e) => return StashStatus::Failed(Error::Io(e)),
            }
        }
        StashStatus::Complete
    }

    fn finish_frame(&self, stash: FrameStash) -> Result<Option<Frame>> {
        let FrameStash {
            header,
            channel,
            buffer,
            ..
        } = stash;
        let total = buffer.len();
        if &buffer[total - FRAME_TRAILER.len()..] != FRAME_TRAILER {
            self.shutdown_with_status(
                Status::ProtocolError,
                "poorly formed frame: frame trailer CR LF not found, discarding content",
            );
            return Err(Error::protocol(
                "poorly formed frame: frame trailer CR LF not found",
            ));
        }

        let payload = buffer.freeze().slice(..header.size);
        let mut frame = Frame::from_wire(self.core.ctx.next_frame_id(), header, payload);
        frame.set_channel_ref(channel);
        frame.mime_process();
        tracing::trace!(
            id = self.id(),
            channel = frame.channel(),
            size = frame.size(),
            kind = %frame.kind(),
            "frame received"
        );
        Ok(Some(frame))
    }

    /// One byte at a time until LF, stashing the partial line across
    /// would-block boundaries.
    fn read_line(&self, rs: &mut std::sync::MutexGuard<'_, ReadState>) -> LineStatus {
        loop {
            if rs.pending_line.last() == Some(&b'\n') {
                return LineStatus::Complete(std::mem::take(&mut rs.pending_line));
            }
            if rs.pending_line.len() >= MAX_HEADER_LINE {
                return LineStatus::Failed(Error::protocol(
                    "no line definition found for frame",
                ));
            }

            let mut byte = [0u8; 1];
            match self.recv_via_handler(&mut byte) {
                Ok(0) => return LineStatus::Closed,
                Ok(_) => rs.pending_line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return LineStatus::NeedMore;
                }
                Err(e) => return LineStatus::Failed(Error::Io(e)),
            }
        }
    }

    /// The peer closed the stream at a frame boundary.
    fn handle_peer_close(&self) -> Result<Option<Frame>> {
        if self.core.being_closed.load(Ordering::SeqCst) {
            self.set_not_connected("connection properly closed", Status::Ok);
            return Ok(None);
        }
        let message = format!(
            "remote side has disconnected without closing properly this session id={}",
            self.id()
        );
        self.shutdown_with_status(Status::UnnotifiedConnectionClose, &message);
        Err(Error::Connection(message))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Unilaterally shut the session down: no BEEP close exchange, the
    /// close handlers fire, the socket is shut down (unless configured
    /// otherwise). Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.set_not_connected("session shutdown", Status::ConnectionForcedClose);
    }

    /// Close the socket descriptor without driving the session teardown.
    /// The session keeps its connected flag; a concurrent read observes
    /// the dead descriptor and runs the regular failure path.
    pub fn shutdown_socket(&self) {
        socket::close(self.socket());
    }

    /// Friendly close: removes every channel (channel 0 last), then runs
    /// the teardown path recording an orderly close. Closing an already
    /// closed session is a no-op reporting success.
    pub fn close(&self) -> bool {
        if self.is_ok() {
            self.mark_being_closed();
            self.close_all_channels(true);
            self.set_not_connected("close connection called", Status::ConnectionCloseCalled);
        }
        true
    }

    /// Record a fatal error and run the teardown path. The status and
    /// message stay queryable on the session; the error is also pushed on
    /// the channel error queue for later retrieval.
    pub(crate) fn shutdown_with_status(&self, status: Status, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(id = self.id(), %status, message, "session failure");
        self.push_channel_error(status as i32, message.clone());
        self.set_not_connected(&message, status);
    }

    /// Flip the session to not-connected exactly once: record status and
    /// message, fire the close handler lists, shut the socket down.
    fn set_not_connected(&self, message: &str, status: Status) {
        let _op = self.core.op_lock.lock().unwrap();
        if !self.core.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            id = self.id(),
            %status,
            message,
            "flagging the session as not connected"
        );
        *self.core.state.lock().unwrap() = (status, message.to_string());

        self.invoke_close_handlers();

        if self.core.close_socket_on_shutdown.load(Ordering::SeqCst) {
            let fd = self.core.socket.swap(INVALID_SOCKET, Ordering::SeqCst);
            if fd != INVALID_SOCKET {
                socket::shutdown(fd);
                socket::close(fd);
            }
        }
    }

    fn next_local_id(&self) -> u64 {
        self.core.next_local_id.fetch_add(1, Ordering::Relaxed)
    }
}

enum LineStatus {
    Complete(Vec<u8>),
    NeedMore,
    Closed,
    Failed(Error),
}

enum StashStatus {
    Complete,
    NeedMore,
    Closed,
    Failed(Error),
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("socket", &self.socket())
            .field("connected", &self.is_ok())
            .finish_non_exhaustive()
    }
}

fn unix_stamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
