//! BEEP (RFC 3080/3081) peer library.
//!
//! `bxp` implements the session engine of a BEEP peer: connection
//! lifecycle, the frame codec with its MIME sub-layer, the greetings
//! handshake and cache, per-channel windowed flow control bookkeeping,
//! and a pluggable I/O readiness layer (`select`/`poll`/`epoll`) for
//! driving reads across many concurrent sessions.
//!
//! Profile implementations, the channel management state machine and the
//! outbound sequencer sit on top of this crate and talk to it through the
//! session and channel surfaces.
//!
//! # Example
//!
//! ```ignore
//! use bxp::{Context, Session};
//!
//! let ctx = Context::new();
//! let session = Session::connect(&ctx, "beep.example.org", 10288)?;
//!
//! println!("peer features: {:?}", session.features());
//! for uri in session.remote_profiles() {
//!     println!("peer offers {uri}");
//! }
//!
//! session.close();
//! ```

pub mod peer;

// Re-export common types at crate root for convenience
pub use peer::{Context, Error, Result, Session, Status};

// Frame layer
pub use peer::{Frame, FrameType, MimeHeader, MimeHeaders};

// Channel layer
pub use peer::{Channel, ChannelPool};

// I/O waiting layer
pub use peer::{IoMechanism, Wait, WaitDirection, WaitSet};

// Session roles and creation options
pub use peer::{Role, SessionOpts, Transport};
