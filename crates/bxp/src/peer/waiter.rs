//! Pluggable I/O readiness back-ends.
//!
//! The reader that drives inbound traffic watches every session socket
//! through a [`WaitSet`]. Three interchangeable back-ends ship: `select(2)`,
//! `poll(2)` and `epoll(7)`, all exposing the same surface: create, clear,
//! add, wait, and — where the kernel can report *which* descriptors fired —
//! a native dispatch walk. `select` has no such iterator, so callers probe
//! with [`WaitSet::is_set`] instead; [`WaitSet::have_dispatch`] tells the
//! two styles apart.
//!
//! The active mechanism is chosen per context and can be swapped at
//! runtime; wait sets created afterwards use the new back-end (see
//! `Context::set_io_mechanism`).

use std::os::unix::io::RawFd;
use std::str::FromStr;

use super::session::Session;

/// Wait timeout applied to read readiness, in milliseconds.
const READ_WAIT_MS: i32 = 500;

/// Wait timeout applied to write readiness, in milliseconds.
const WRITE_WAIT_MS: i32 = 1000;

/// Default epoll capacity when the context carries no hard socket limit.
const DEFAULT_EPOLL_CAPACITY: usize = 4096;

/// What a wait set watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDirection {
    /// Readable sockets.
    Read,
    /// Writable sockets.
    Write,
}

impl WaitDirection {
    fn timeout_ms(self) -> i32 {
        match self {
            WaitDirection::Read => READ_WAIT_MS,
            WaitDirection::Write => WRITE_WAIT_MS,
        }
    }
}

/// Readiness back-end selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMechanism {
    /// `select(2)`: portable, bounded by FD_SETSIZE, no native dispatch.
    Select,
    /// `poll(2)`: growable descriptor array with native dispatch.
    Poll,
    /// `epoll(7)`: level-triggered epoll descriptor with native dispatch.
    Epoll,
}

impl IoMechanism {
    /// Every available mechanism, in preference order.
    pub fn all() -> &'static [IoMechanism] {
        &[IoMechanism::Epoll, IoMechanism::Poll, IoMechanism::Select]
    }

    /// Lowercase name, matching the `BXP_IO_MECHANISM` environment values.
    pub fn as_str(self) -> &'static str {
        match self {
            IoMechanism::Select => "select",
            IoMechanism::Poll => "poll",
            IoMechanism::Epoll => "epoll",
        }
    }
}

impl std::fmt::Display for IoMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IoMechanism {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "select" => Ok(IoMechanism::Select),
            "poll" => Ok(IoMechanism::Poll),
            "epoll" => Ok(IoMechanism::Epoll),
            _ => Err(()),
        }
    }
}

/// Outcome of one wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// This many descriptors are ready.
    Ready(usize),
    /// The bounded wait elapsed with nothing ready.
    Timeout,
    /// The call was interrupted (EINTR); try again.
    Interrupted,
    /// A transient error; the caller may retry.
    SoftError,
    /// An unrecoverable error (for example a closed descriptor in the
    /// set); the set must be rebuilt.
    Fatal,
}

fn wait_result(result: i32) -> Wait {
    if result > 0 {
        return Wait::Ready(result as usize);
    }
    if result == 0 {
        return Wait::Timeout;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EINTR) => Wait::Interrupted,
        Some(libc::EBADF) => Wait::Fatal,
        _ => Wait::SoftError,
    }
}

/// A readiness set bound to one back-end and one direction.
#[derive(Debug)]
pub enum WaitSet {
    Select(SelectSet),
    Poll(PollSet),
    Epoll(EpollSet),
}

impl WaitSet {
    /// Create a wait set for the given mechanism and direction.
    /// `hard_limit` bounds the epoll event array; zero applies the
    /// default.
    pub fn new(mechanism: IoMechanism, direction: WaitDirection, hard_limit: usize) -> WaitSet {
        match mechanism {
            IoMechanism::Select => WaitSet::Select(SelectSet::new(direction)),
            IoMechanism::Poll => WaitSet::Poll(PollSet::new(direction)),
            IoMechanism::Epoll => WaitSet::Epoll(EpollSet::new(direction, hard_limit)),
        }
    }

    /// The mechanism backing this set.
    pub fn mechanism(&self) -> IoMechanism {
        match self {
            WaitSet::Select(_) => IoMechanism::Select,
            WaitSet::Poll(_) => IoMechanism::Poll,
            WaitSet::Epoll(_) => IoMechanism::Epoll,
        }
    }

    /// The direction this set watches.
    pub fn direction(&self) -> WaitDirection {
        match self {
            WaitSet::Select(s) => s.direction,
            WaitSet::Poll(s) => s.direction,
            WaitSet::Epoll(s) => s.direction,
        }
    }

    /// Number of descriptors currently in the set.
    pub fn len(&self) -> usize {
        match self {
            WaitSet::Select(s) => s.length,
            WaitSet::Poll(s) => s.fds.len(),
            WaitSet::Epoll(s) => s.length,
        }
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the set so descriptors can be re-registered for the next
    /// round.
    pub fn clear(&mut self) {
        match self {
            WaitSet::Select(s) => s.clear(),
            WaitSet::Poll(s) => s.clear(),
            WaitSet::Epoll(s) => s.clear(),
        }
    }

    /// Add a socket (optionally tied to its session, for dispatch) to the
    /// set. Returns `false` when the descriptor cannot be watched, which
    /// callers treat as fatal for that session.
    pub fn add(&mut self, fd: RawFd, session: Option<&Session>) -> bool {
        if fd < 0 {
            tracing::error!(fd, "refusing to add an invalid socket to the wait set");
            return false;
        }
        match self {
            WaitSet::Select(s) => s.add(fd),
            WaitSet::Poll(s) => s.add(fd, session.cloned()),
            WaitSet::Epoll(s) => s.add(fd, session.cloned()),
        }
    }

    /// Wait for readiness with the direction's bounded timeout (500 ms for
    /// reads, 1 s for writes).
    pub fn wait(&mut self, max_fd: RawFd) -> Wait {
        match self {
            WaitSet::Select(s) => s.wait(max_fd),
            WaitSet::Poll(s) => s.wait(),
            WaitSet::Epoll(s) => s.wait(),
        }
    }

    /// Check whether a descriptor fired in the last wait. This is the
    /// probe style used with back-ends lacking native dispatch.
    pub fn is_set(&self, fd: RawFd) -> bool {
        match self {
            WaitSet::Select(s) => s.is_set(fd),
            WaitSet::Poll(s) => s.is_set(fd),
            WaitSet::Epoll(s) => s.is_set(fd),
        }
    }

    /// Whether this back-end can walk fired descriptors natively.
    pub fn have_dispatch(&self) -> bool {
        !matches!(self, WaitSet::Select(_))
    }

    /// Walk the descriptors that fired in the last wait, invoking `f` with
    /// the socket and its registered session. Only defined when
    /// [`WaitSet::have_dispatch`] is true; on `select` this is a no-op.
    pub fn dispatch<F: FnMut(RawFd, &Session)>(&mut self, changed: usize, f: F) {
        match self {
            WaitSet::Select(_) => {}
            WaitSet::Poll(s) => s.dispatch(changed, f),
            WaitSet::Epoll(s) => s.dispatch(changed, f),
        }
    }
}

// ----------------------------------------------------------------------
// select(2)
// ----------------------------------------------------------------------

/// `select(2)` back-end: an `fd_set` plus its population count.
pub struct SelectSet {
    set: libc::fd_set,
    length: usize,
    direction: WaitDirection,
}

impl std::fmt::Debug for SelectSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectSet")
            .field("length", &self.length)
            .field("direction", &self.direction)
            .finish()
    }
}

impl SelectSet {
    fn new(direction: WaitDirection) -> SelectSet {
        // SAFETY: an all-zero fd_set is a valid empty set; FD_ZERO then
        // initialises it the portable way.
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut set) };
        SelectSet {
            set,
            length: 0,
            direction,
        }
    }

    fn clear(&mut self) {
        // SAFETY: self.set is a properly initialised fd_set.
        unsafe { libc::FD_ZERO(&mut self.set) };
        self.length = 0;
    }

    fn add(&mut self, fd: RawFd) -> bool {
        // Descriptors at or beyond FD_SETSIZE cannot be represented in an
        // fd_set; the session must move to another mechanism or be closed.
        if fd >= libc::FD_SETSIZE as RawFd {
            tracing::error!(
                fd,
                limit = libc::FD_SETSIZE,
                "descriptor beyond FD_SETSIZE, select(2) cannot watch it"
            );
            return false;
        }
        if self.length == libc::FD_SETSIZE - 1 {
            tracing::error!("select(2) set is full");
            return false;
        }
        // SAFETY: fd was range-checked against FD_SETSIZE above.
        unsafe { libc::FD_SET(fd, &mut self.set) };
        self.length += 1;
        true
    }

    fn wait(&mut self, max_fd: RawFd) -> Wait {
        let mut tv = libc::timeval {
            tv_sec: i64::from(self.direction.timeout_ms() / 1000) as libc::time_t,
            tv_usec: (i64::from(self.direction.timeout_ms() % 1000) * 1000) as libc::suseconds_t,
        };
        let (read_set, write_set): (*mut libc::fd_set, *mut libc::fd_set) = match self.direction {
            WaitDirection::Read => (&mut self.set, std::ptr::null_mut()),
            WaitDirection::Write => (std::ptr::null_mut(), &mut self.set),
        };
        // SAFETY: the set pointers refer to this set (or are null) and the
        // timeval is initialised; select mutates the set in place to mark
        // ready descriptors.
        let result = unsafe {
            libc::select(max_fd + 1, read_set, write_set, std::ptr::null_mut(), &mut tv)
        };
        wait_result(result)
    }

    fn is_set(&self, fd: RawFd) -> bool {
        if fd < 0 || fd >= libc::FD_SETSIZE as RawFd {
            return false;
        }
        // SAFETY: fd was range-checked against FD_SETSIZE above.
        unsafe { libc::FD_ISSET(fd, &self.set) }
    }
}

// ----------------------------------------------------------------------
// poll(2)
// ----------------------------------------------------------------------

/// `poll(2)` back-end: a pollfd array with a parallel session array.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    sessions: Vec<Option<Session>>,
    direction: WaitDirection,
}

impl std::fmt::Debug for PollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSet")
            .field("length", &self.fds.len())
            .field("direction", &self.direction)
            .finish()
    }
}

impl PollSet {
    fn new(direction: WaitDirection) -> PollSet {
        PollSet {
            fds: Vec::new(),
            sessions: Vec::new(),
            direction,
        }
    }

    fn events(&self) -> libc::c_short {
        match self.direction {
            WaitDirection::Read => libc::POLLIN | libc::POLLPRI,
            WaitDirection::Write => libc::POLLOUT,
        }
    }

    fn clear(&mut self) {
        self.fds.clear();
        self.sessions.clear();
    }

    fn add(&mut self, fd: RawFd, session: Option<Session>) -> bool {
        self.fds.push(libc::pollfd {
            fd,
            events: self.events(),
            revents: 0,
        });
        self.sessions.push(session);
        true
    }

    fn wait(&mut self) -> Wait {
        // SAFETY: the pointer and length describe the live pollfd array.
        let result = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                self.direction.timeout_ms(),
            )
        };
        wait_result(result)
    }

    fn fired(&self, revents: libc::c_short) -> bool {
        match self.direction {
            WaitDirection::Read => {
                revents & libc::POLLIN != 0 || revents & libc::POLLPRI != 0
            }
            WaitDirection::Write => revents & libc::POLLOUT != 0,
        }
    }

    fn is_set(&self, fd: RawFd) -> bool {
        self.fds
            .iter()
            .any(|p| p.fd == fd && self.fired(p.revents))
    }

    fn dispatch<F: FnMut(RawFd, &Session)>(&mut self, changed: usize, mut f: F) {
        let mut checked = 0;
        for (at, pollfd) in self.fds.iter().enumerate() {
            if checked >= changed {
                break;
            }
            if !self.fired(pollfd.revents) {
                continue;
            }
            checked += 1;
            if let Some(Some(session)) = self.sessions.get(at) {
                f(pollfd.fd, session);
            }
        }
    }
}

// ----------------------------------------------------------------------
// epoll(7)
// ----------------------------------------------------------------------

/// `epoll(7)` back-end: a level-triggered epoll descriptor. Sessions are
/// recovered from the event payload without a table lookup; `clear` closes
/// and recreates the epoll descriptor, which is cheaper than issuing one
/// `EPOLL_CTL_DEL` per watched session.
pub struct EpollSet {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    sessions: Vec<Option<Session>>,
    length: usize,
    last_ready: usize,
    direction: WaitDirection,
}

impl std::fmt::Debug for EpollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollSet")
            .field("epfd", &self.epfd)
            .field("length", &self.length)
            .field("direction", &self.direction)
            .finish()
    }
}

impl EpollSet {
    fn new(direction: WaitDirection, hard_limit: usize) -> EpollSet {
        let capacity = if hard_limit == 0 {
            DEFAULT_EPOLL_CAPACITY
        } else {
            hard_limit
        };
        EpollSet {
            epfd: create_epoll_fd(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            sessions: Vec::new(),
            length: 0,
            last_ready: 0,
            direction,
        }
    }

    fn clear(&mut self) {
        // Closing the epoll descriptor drops every registration at once.
        // SAFETY: epfd is owned by this set and not used after close until
        // reassigned below.
        unsafe { libc::close(self.epfd) };
        self.epfd = create_epoll_fd();
        self.sessions.clear();
        self.length = 0;
        self.last_ready = 0;
    }

    fn add(&mut self, fd: RawFd, session: Option<Session>) -> bool {
        if self.epfd < 0 {
            return false;
        }
        if self.length == self.events.len() {
            tracing::debug!(max = self.events.len(), "epoll set is full");
            return false;
        }
        let mut ev = libc::epoll_event {
            events: match self.direction {
                WaitDirection::Read => (libc::EPOLLIN | libc::EPOLLPRI) as u32,
                WaitDirection::Write => libc::EPOLLOUT as u32,
            },
            u64: self.sessions.len() as u64,
        };
        // SAFETY: epfd is a live epoll descriptor and ev is initialised.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EEXIST) {
            tracing::error!(
                fd,
                error = %std::io::Error::last_os_error(),
                "epoll_ctl failed to add descriptor"
            );
            return false;
        }
        self.sessions.push(session);
        self.length += 1;
        true
    }

    fn wait(&mut self) -> Wait {
        let max_events = self.length.max(1).min(self.events.len()) as libc::c_int;
        // SAFETY: the pointer and length describe the live event array.
        let result = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                max_events,
                self.direction.timeout_ms(),
            )
        };
        let outcome = wait_result(result);
        self.last_ready = match outcome {
            Wait::Ready(n) => n,
            _ => 0,
        };
        outcome
    }

    fn fired(&self, events: u32) -> bool {
        match self.direction {
            WaitDirection::Read => {
                events & libc::EPOLLIN as u32 != 0 || events & libc::EPOLLPRI as u32 != 0
            }
            WaitDirection::Write => events & libc::EPOLLOUT as u32 != 0,
        }
    }

    fn is_set(&self, fd: RawFd) -> bool {
        self.events[..self.last_ready].iter().any(|ev| {
            self.fired(ev.events)
                && self
                    .sessions
                    .get(ev.u64 as usize)
                    .and_then(|s| s.as_ref())
                    .is_some_and(|s| s.socket() == fd)
        })
    }

    fn dispatch<F: FnMut(RawFd, &Session)>(&mut self, changed: usize, mut f: F) {
        let upto = changed.min(self.last_ready);
        for ev in &self.events[..upto] {
            if !self.fired(ev.events) {
                continue;
            }
            if let Some(Some(session)) = self.sessions.get(ev.u64 as usize) {
                f(session.socket(), session);
            }
        }
    }
}

impl Drop for EpollSet {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            // SAFETY: epfd is owned by this set.
            unsafe { libc::close(self.epfd) };
        }
    }
}

fn create_epoll_fd() -> RawFd {
    // SAFETY: epoll_create1 takes no pointers; CLOEXEC keeps the
    // descriptor from leaking across exec.
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        tracing::error!(
            error = %std::io::Error::last_os_error(),
            "epoll_create1 failed"
        );
    }
    epfd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid two-element array for pipe(2) to fill.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        // SAFETY: fd was created by pipe_pair and is closed exactly once.
        unsafe { libc::close(fd) };
    }

    fn ready_fds(mechanism: IoMechanism) -> Vec<RawFd> {
        let (read_a, write_a) = pipe_pair();
        let (read_b, write_b) = pipe_pair();

        // Only the first pipe has pending data.
        // SAFETY: write_a is a live pipe descriptor and the buffer is valid.
        assert_eq!(unsafe { libc::write(write_a, b"x".as_ptr().cast(), 1) }, 1);

        let mut set = WaitSet::new(mechanism, WaitDirection::Read, 0);
        assert!(set.add(read_a, None));
        assert!(set.add(read_b, None));
        assert_eq!(set.len(), 2);

        let ready = match set.wait(read_a.max(read_b)) {
            Wait::Ready(_) => [read_a, read_b]
                .into_iter()
                .filter(|fd| set.is_set(*fd))
                .collect(),
            other => panic!("expected readiness, got {other:?}"),
        };

        for fd in [read_a, write_a, read_b, write_b] {
            close_fd(fd);
        }
        ready
    }

    #[test]
    fn test_select_reports_ready_descriptor() {
        let ready = ready_fds(IoMechanism::Select);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_poll_reports_ready_descriptor() {
        let ready = ready_fds(IoMechanism::Poll);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_epoll_reports_ready_descriptor() {
        // is_set on epoll keys off registered sessions; with none
        // registered the readiness count is still visible.
        let (read_fd, write_fd) = pipe_pair();
        // SAFETY: write_fd is a live pipe descriptor and the buffer is valid.
        assert_eq!(unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) }, 1);

        let mut set = WaitSet::new(IoMechanism::Epoll, WaitDirection::Read, 0);
        assert!(set.add(read_fd, None));
        assert_eq!(set.wait(read_fd), Wait::Ready(1));

        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[test]
    fn test_dispatch_availability() {
        assert!(!WaitSet::new(IoMechanism::Select, WaitDirection::Read, 0).have_dispatch());
        assert!(WaitSet::new(IoMechanism::Poll, WaitDirection::Read, 0).have_dispatch());
        assert!(WaitSet::new(IoMechanism::Epoll, WaitDirection::Read, 0).have_dispatch());
    }

    #[test]
    fn test_clear_empties_the_set() {
        let (read_fd, write_fd) = pipe_pair();
        for mechanism in [IoMechanism::Select, IoMechanism::Poll, IoMechanism::Epoll] {
            let mut set = WaitSet::new(mechanism, WaitDirection::Read, 0);
            assert!(set.add(read_fd, None));
            assert_eq!(set.len(), 1);
            set.clear();
            assert!(set.is_empty());
            // The set stays usable after a clear.
            assert!(set.add(read_fd, None));
        }
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[test]
    fn test_select_rejects_out_of_range_descriptor() {
        let mut set = WaitSet::new(IoMechanism::Select, WaitDirection::Read, 0);
        assert!(!set.add(libc::FD_SETSIZE as RawFd, None));
        assert!(!set.add(-1, None));
    }

    #[test]
    fn test_write_readiness() {
        let (read_fd, write_fd) = pipe_pair();
        // A fresh pipe has buffer space, so the write end is ready at once.
        let mut set = WaitSet::new(IoMechanism::Poll, WaitDirection::Write, 0);
        assert!(set.add(write_fd, None));
        assert!(matches!(set.wait(write_fd), Wait::Ready(1)));
        assert!(set.is_set(write_fd));
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[test]
    fn test_mechanism_parsing() {
        assert_eq!("epoll".parse(), Ok(IoMechanism::Epoll));
        assert_eq!("poll".parse(), Ok(IoMechanism::Poll));
        assert_eq!("select".parse(), Ok(IoMechanism::Select));
        assert!("kqueue".parse::<IoMechanism>().is_err());
        assert_eq!(IoMechanism::Epoll.to_string(), "epoll");
    }
}
