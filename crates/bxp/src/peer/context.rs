//! The peer context: process-wide state shared by every session.
//!
//! A [`Context`] owns the identifier allocators, the resolver and
//! greetings caches, the registered connection actions, the advertised
//! profile list and the I/O mechanism selection. Contexts are cheap to
//! clone and safe to share across threads; sessions keep one for their
//! whole lifetime.
//!
//! # Environment controls
//!
//! Read when first consulted, and re-read after an explicit reset:
//!
//! - `BXP_CONNECT_TIMEOUT` — TCP connect timeout, microseconds.
//! - `BXP_SYNC_TIMEOUT` — synchronous operation timeout, microseconds.
//! - `BXP_IO_MECHANISM` — `select`, `poll` or `epoll`.
//! - `BXP_HARD_SOCK_LIMIT` / `BXP_SOFT_SOCK_LIMIT` — descriptor limits.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::channel::Channel;
use super::error::{Error, Result};
use super::greetings::GreetingsCache;
use super::resolver::Resolver;
use super::session::Session;
use super::waiter::IoMechanism;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for synchronous operations (greetings exchange on
/// accept, write-readiness waits).
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ceiling applied by the stock frame-size chooser.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// Default number of wait-then-retry rounds the write path runs before
/// fatal-closing a session.
pub const DEFAULT_WRITE_TIMEOUT_RETRIES: u32 = 3;

/// Named points of the session creation state machine where registered
/// actions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// After the greetings exchange finished on an initiator session.
    PostCreated,
    /// After a listener accepted a socket, before any BEEP traffic.
    PreAccept,
    /// When the peer's greeting was parsed and its features are known.
    ProcessGreetingsFeatures,
    /// After every creation step, including actions, succeeded.
    PostCreatedOk,
}

/// What a connection action tells the creation state machine to do next.
pub enum ActionOutcome {
    /// Keep running the remaining actions.
    Continue,
    /// Skip the remaining actions; creation proceeds.
    Stop,
    /// Hand the creation flow a replacement session; remaining actions and
    /// the caller observe the new object.
    Replace(Session),
    /// Fail creation; the session is fatal-closed.
    Fail,
}

/// A connection action, invoked at its registered stage.
pub type ActionFn = dyn Fn(&Context, &Session, Stage) -> ActionOutcome + Send + Sync;

/// Chooser consulted per outgoing fragment for the frame size to use.
pub type FrameSizeFn = dyn Fn(&Channel, u32, usize, u32) -> usize + Send + Sync;

/// Hook invoked when a channel is added to or removed from any session of
/// this context.
pub type ChannelUpdateFn = dyn Fn(&Channel) + Send + Sync;

/// Hook invoked right after a session object exists, before its TCP
/// connect is attempted.
pub type SessionCreatedFn = dyn Fn(&Context, &Session) + Send + Sync;

struct ActionEntry {
    id: u64,
    stage: Stage,
    action: Arc<ActionFn>,
}

#[derive(Default)]
struct TimeoutSlot {
    value: Option<Duration>,
    checked: bool,
}

impl TimeoutSlot {
    fn get(&mut self, env_var: &str, default: Duration) -> Duration {
        if !self.checked {
            self.checked = true;
            self.value = read_env_micros(env_var);
        }
        match self.value {
            Some(value) if !value.is_zero() => value,
            _ => default,
        }
    }

    fn set(&mut self, value: Duration) {
        if value.is_zero() {
            // Reset: forget the override and consult the environment again
            // on the next read.
            self.value = None;
            self.checked = false;
        } else {
            self.value = Some(value);
            self.checked = true;
        }
    }
}

fn read_env_micros(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    let micros: u64 = raw.trim().parse().ok()?;
    Some(Duration::from_micros(micros))
}

fn read_env_usize(var: &str) -> Option<usize> {
    std::env::var(var).ok()?.trim().parse().ok()
}

struct ContextInner {
    next_session_id: AtomicU64,
    next_frame_id: AtomicU64,
    next_action_id: AtomicU64,
    resolver: Resolver,
    greetings: GreetingsCache,
    io_mechanism: RwLock<IoMechanism>,
    connect_timeout: Mutex<TimeoutSlot>,
    sync_timeout: Mutex<TimeoutSlot>,
    hard_sock_limit: Mutex<Option<usize>>,
    soft_sock_limit: Mutex<Option<usize>>,
    sanity_checks: AtomicBool,
    profiles: Mutex<Vec<String>>,
    actions: Mutex<Vec<ActionEntry>>,
    session_created: Mutex<Option<Arc<SessionCreatedFn>>>,
    channel_added: Mutex<Vec<(u64, Arc<ChannelUpdateFn>)>>,
    channel_removed: Mutex<Vec<(u64, Arc<ChannelUpdateFn>)>>,
    next_update_id: AtomicU64,
    channel_dropped: Mutex<Option<Arc<ChannelUpdateFn>>>,
    frame_size: Mutex<Option<Arc<FrameSizeFn>>>,
    write_timeout_retries: AtomicU32,
    unbounded_write_retries: AtomicBool,
    finishing: AtomicBool,
}

/// Shared peer context. Clones are handles to the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a context with defaults; the environment controls are read
    /// lazily.
    pub fn new() -> Context {
        let io_mechanism = std::env::var("BXP_IO_MECHANISM")
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(IoMechanism::Epoll);

        Context {
            inner: Arc::new(ContextInner {
                next_session_id: AtomicU64::new(1),
                next_frame_id: AtomicU64::new(1),
                next_action_id: AtomicU64::new(1),
                resolver: Resolver::default(),
                greetings: GreetingsCache::default(),
                io_mechanism: RwLock::new(io_mechanism),
                connect_timeout: Mutex::new(TimeoutSlot::default()),
                sync_timeout: Mutex::new(TimeoutSlot::default()),
                hard_sock_limit: Mutex::new(None),
                soft_sock_limit: Mutex::new(None),
                sanity_checks: AtomicBool::new(true),
                profiles: Mutex::new(Vec::new()),
                actions: Mutex::new(Vec::new()),
                session_created: Mutex::new(None),
                channel_added: Mutex::new(Vec::new()),
                channel_removed: Mutex::new(Vec::new()),
                next_update_id: AtomicU64::new(1),
                channel_dropped: Mutex::new(None),
                frame_size: Mutex::new(None),
                write_timeout_retries: AtomicU32::new(DEFAULT_WRITE_TIMEOUT_RETRIES),
                unbounded_write_retries: AtomicBool::new(false),
                finishing: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.inner.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_frame_id(&self) -> u64 {
        self.inner.next_frame_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    /// The context-wide greetings cache.
    pub fn greetings_cache(&self) -> &GreetingsCache {
        &self.inner.greetings
    }

    // ------------------------------------------------------------------
    // I/O mechanism
    // ------------------------------------------------------------------

    /// The readiness back-end new wait sets use.
    pub fn io_mechanism(&self) -> IoMechanism {
        *self.inner.io_mechanism.read().unwrap()
    }

    /// Swap the readiness back-end. Wait sets created afterwards use the
    /// new mechanism; a driving reader is expected to quiesce, rebuild its
    /// set and resume.
    pub fn set_io_mechanism(&self, mechanism: IoMechanism) {
        tracing::debug!(%mechanism, "switching I/O waiting mechanism");
        *self.inner.io_mechanism.write().unwrap() = mechanism;
    }

    // ------------------------------------------------------------------
    // Timeouts and limits
    // ------------------------------------------------------------------

    /// TCP connect timeout (default 60 s, `BXP_CONNECT_TIMEOUT` override).
    pub fn connect_timeout(&self) -> Duration {
        self.inner
            .connect_timeout
            .lock()
            .unwrap()
            .get("BXP_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT)
    }

    /// Configure the connect timeout. Zero resets to the default and
    /// re-arms the environment override.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.inner.connect_timeout.lock().unwrap().set(timeout);
    }

    /// Synchronous operation timeout (default 10 s, `BXP_SYNC_TIMEOUT`
    /// override).
    pub fn sync_timeout(&self) -> Duration {
        self.inner
            .sync_timeout
            .lock()
            .unwrap()
            .get("BXP_SYNC_TIMEOUT", DEFAULT_SYNC_TIMEOUT)
    }

    /// Configure the synchronous operation timeout. Zero resets to the
    /// default and re-arms the environment override.
    pub fn set_sync_timeout(&self, timeout: Duration) {
        self.inner.sync_timeout.lock().unwrap().set(timeout);
    }

    /// Hard socket limit; descriptors at or beyond it are refused. Zero
    /// means unlimited.
    pub fn hard_sock_limit(&self) -> usize {
        let mut slot = self.inner.hard_sock_limit.lock().unwrap();
        *slot.get_or_insert_with(|| read_env_usize("BXP_HARD_SOCK_LIMIT").unwrap_or(0))
    }

    /// Soft socket limit consulted by accept loops. Zero means unlimited.
    pub fn soft_sock_limit(&self) -> usize {
        let mut slot = self.inner.soft_sock_limit.lock().unwrap();
        *slot.get_or_insert_with(|| read_env_usize("BXP_SOFT_SOCK_LIMIT").unwrap_or(0))
    }

    /// Configure both socket limits.
    pub fn set_sock_limits(&self, hard: usize, soft: usize) {
        *self.inner.hard_sock_limit.lock().unwrap() = Some(hard);
        *self.inner.soft_sock_limit.lock().unwrap() = Some(soft);
    }

    /// Whether reserved-descriptor sanity checks run on new sockets.
    pub fn sanity_checks_enabled(&self) -> bool {
        self.inner.sanity_checks.load(Ordering::Relaxed)
    }

    /// Enable or disable the reserved-descriptor sanity check.
    pub fn enable_sanity_checks(&self, enable: bool) {
        self.inner.sanity_checks.store(enable, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Write retry policy
    // ------------------------------------------------------------------

    /// Wait-then-retry rounds the write path runs before fatal-closing
    /// (default 3).
    pub fn write_timeout_retries(&self) -> u32 {
        self.inner.write_timeout_retries.load(Ordering::Relaxed)
    }

    /// Configure the write retry budget.
    pub fn set_write_timeout_retries(&self, retries: u32) {
        self.inner
            .write_timeout_retries
            .store(retries, Ordering::Relaxed);
    }

    /// When set, the write path retries without bound instead of
    /// fatal-closing after the configured budget.
    pub fn disable_write_timeout_close(&self, disable: bool) {
        self.inner
            .unbounded_write_retries
            .store(disable, Ordering::Relaxed);
    }

    /// Whether unbounded write retries are enabled.
    pub fn write_timeout_close_disabled(&self) -> bool {
        self.inner.unbounded_write_retries.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Profile advertisement
    // ------------------------------------------------------------------

    /// Add a profile URI to the local greeting advertisement.
    pub fn advertise_profile(&self, uri: impl Into<String>) {
        let uri = uri.into();
        let mut profiles = self.inner.profiles.lock().unwrap();
        if !profiles.contains(&uri) {
            profiles.push(uri);
        }
    }

    /// The profile URIs currently advertised in local greetings.
    pub fn advertised_profiles(&self) -> Vec<String> {
        self.inner.profiles.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------
    // Stage actions and hooks
    // ------------------------------------------------------------------

    /// Register an action to run at the given creation stage. Actions run
    /// in registration order. Returns an identifier usable with
    /// [`Context::remove_connection_action`].
    pub fn add_connection_action<F>(&self, stage: Stage, action: F) -> u64
    where
        F: Fn(&Context, &Session, Stage) -> ActionOutcome + Send + Sync + 'static,
    {
        let id = self.inner.next_action_id.fetch_add(1, Ordering::Relaxed);
        self.inner.actions.lock().unwrap().push(ActionEntry {
            id,
            stage,
            action: Arc::new(action),
        });
        id
    }

    /// Remove a previously registered connection action.
    pub fn remove_connection_action(&self, id: u64) -> bool {
        let mut actions = self.inner.actions.lock().unwrap();
        let before = actions.len();
        actions.retain(|entry| entry.id != id);
        actions.len() != before
    }

    /// Run the actions registered for `stage`. A `Replace` outcome
    /// redirects the remaining actions (and the caller) to the
    /// replacement session; a `Fail` outcome fatal-closes the session and
    /// errors out.
    pub(crate) fn notify_actions(&self, session: &mut Session, stage: Stage) -> Result<()> {
        if !session.is_ok() {
            return Err(Error::NotConnected);
        }

        // Snapshot under the lock, run without it: actions are free to
        // register or remove actions themselves.
        let entries: Vec<Arc<ActionFn>> = self
            .inner
            .actions
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.stage == stage)
            .map(|entry| Arc::clone(&entry.action))
            .collect();

        for action in entries {
            match action(self, session, stage) {
                ActionOutcome::Continue => {}
                ActionOutcome::Stop => break,
                ActionOutcome::Replace(new_session) => {
                    tracing::debug!(
                        old = session.id(),
                        new = new_session.id(),
                        ?stage,
                        "connection action replaced the session"
                    );
                    *session = new_session;
                }
                ActionOutcome::Fail => {
                    session.shutdown_with_status(
                        super::error::Status::ConnectionCloseCalled,
                        "connection action failed, closing session",
                    );
                    return Err(Error::ActionFailed);
                }
            }
        }
        Ok(())
    }

    /// Install the hook invoked once a session object exists, before its
    /// TCP connect runs.
    pub fn set_session_created<F>(&self, hook: F)
    where
        F: Fn(&Context, &Session) + Send + Sync + 'static,
    {
        *self.inner.session_created.lock().unwrap() = Some(Arc::new(hook));
    }

    pub(crate) fn notify_session_created(&self, session: &Session) {
        let hook = self.inner.session_created.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(self, session);
        }
    }

    /// Register a context-wide hook for channels added on any session.
    pub fn on_channel_added<F>(&self, hook: F) -> u64
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        let id = self.inner.next_update_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channel_added
            .lock()
            .unwrap()
            .push((id, Arc::new(hook)));
        id
    }

    /// Register a context-wide hook for channels removed from any session.
    pub fn on_channel_removed<F>(&self, hook: F) -> u64
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        let id = self.inner.next_update_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channel_removed
            .lock()
            .unwrap()
            .push((id, Arc::new(hook)));
        id
    }

    /// Remove a context-wide channel update hook by identifier.
    pub fn remove_channel_hook(&self, id: u64) -> bool {
        let mut removed = false;
        for list in [&self.inner.channel_added, &self.inner.channel_removed] {
            let mut list = list.lock().unwrap();
            let before = list.len();
            list.retain(|(entry_id, _)| *entry_id != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub(crate) fn notify_channel_update(&self, channel: &Channel, added: bool) {
        let list = if added {
            &self.inner.channel_added
        } else {
            &self.inner.channel_removed
        };
        let hooks: Vec<Arc<ChannelUpdateFn>> = list
            .lock()
            .unwrap()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook(channel);
        }
    }

    /// Install the hook the channel removal path uses to tell the
    /// outbound sequencer to drop frames queued for a dying channel.
    pub fn set_channel_dropped<F>(&self, hook: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        *self.inner.channel_dropped.lock().unwrap() = Some(Arc::new(hook));
    }

    pub(crate) fn notify_channel_dropped(&self, channel: &Channel) {
        let hook = self.inner.channel_dropped.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(channel);
        }
    }

    // ------------------------------------------------------------------
    // Frame size selection
    // ------------------------------------------------------------------

    /// Install the context-level frame size chooser the sequencer consults
    /// when a session carries no override.
    pub fn set_frame_size_handler<F>(&self, handler: F)
    where
        F: Fn(&Channel, u32, usize, u32) -> usize + Send + Sync + 'static,
    {
        *self.inner.frame_size.lock().unwrap() = Some(Arc::new(handler));
    }

    pub(crate) fn frame_size_handler(&self) -> Option<Arc<FrameSizeFn>> {
        self.inner.frame_size.lock().unwrap().clone()
    }

    /// The stock frame size policy: as much of the message as both the
    /// remote window and the 4 KiB ceiling allow.
    pub fn default_frame_size(
        _channel: &Channel,
        next_seqno: u32,
        msg_size: usize,
        max_seqno: u32,
    ) -> usize {
        let window_room = u64::from(max_seqno)
            .saturating_add(1)
            .saturating_sub(u64::from(next_seqno)) as usize;
        msg_size.min(window_room).min(DEFAULT_MAX_FRAME_SIZE)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Flag the context as tearing down. Close handlers registered on its
    /// sessions stop firing; blocking waits finish their current round.
    pub fn finish(&self) {
        self.inner.finishing.store(true, Ordering::Release);
    }

    /// Whether the context is tearing down.
    pub fn is_finishing(&self) -> bool {
        self.inner.finishing.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("io_mechanism", &self.io_mechanism())
            .field("finishing", &self.is_finishing())
            .finish_non_exhaustive()
    }
}
