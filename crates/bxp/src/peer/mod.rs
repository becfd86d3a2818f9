//! BEEP peer engine: sessions, channels, the frame codec and the I/O
//! readiness layer.
//!
//! # Sessions and channels
//!
//! ```ignore
//! use bxp::peer::{Context, Session};
//!
//! let ctx = Context::new();
//! ctx.advertise_profile("http://example.org/beep/echo");
//!
//! let session = Session::connect(&ctx, "127.0.0.1", 10288)?;
//! assert!(session.is_ok());
//!
//! // Channel numbers are allocated odd (initiator) or even (listener).
//! let number = session.next_channel_number().unwrap();
//! ```
//!
//! # Reading frames
//!
//! The read path is non-blocking and resumable: `Ok(None)` means "no
//! complete frame yet", and the next call picks up where the socket ran
//! dry.
//!
//! ```ignore
//! match session.next_frame()? {
//!     Some(frame) => println!("{} bytes on channel {}", frame.size(), frame.channel()),
//!     None => { /* park the session back into the wait set */ }
//! }
//! ```
//!
//! # I/O readiness
//!
//! ```ignore
//! use bxp::peer::{IoMechanism, WaitDirection, WaitSet};
//!
//! let mut set = WaitSet::new(ctx.io_mechanism(), WaitDirection::Read, 0);
//! set.add(session.socket(), Some(&session));
//! ```

pub mod channel;
pub mod context;
pub mod error;
pub mod frame;
pub mod greetings;
pub mod mime;
mod resolver;
pub mod session;
pub mod socket;
pub mod waiter;

pub use channel::{Channel, ChannelPool, DEFAULT_WINDOW_SIZE, MAX_CHANNELS};
pub use context::{ActionOutcome, Context, Stage};
pub use error::{Error, Result, Status};
pub use frame::{Frame, FrameType};
pub use greetings::{Greeting, GreetingsCache};
pub use mime::{MimeHeader, MimeHeaders};
pub use session::{ProfileMaskRequest, Role, Session, SessionOpts};
pub use socket::{INVALID_SOCKET, Transport};
pub use waiter::{IoMechanism, Wait, WaitDirection, WaitSet};
