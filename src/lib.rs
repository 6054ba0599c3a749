//! A minimal SIP user-agent library.
//!
//! `sipkit` implements the core of an RFC 3261 user agent suitable for
//! originating and answering voice sessions against standard SIP servers:
//!
//! * [`message`] - SIP message and URI codec (parse, serialize, validate)
//! * [`sdp`] - SDP codec and RFC 3264 offer/answer negotiator
//! * [`transaction`] - the four RFC 3261 transaction state machines with
//!   their timer discipline and retransmission handling
//! * [`dialog`] - dialog identity and lifecycle, digest authentication,
//!   REGISTER and INVITE flows
//! * [`transport`] - the narrow transport interface (UDP, TCP stream
//!   framing, and an in-memory channel transport used by tests)
//! * [`ua`] - the user-agent orchestrator tying the layers together
//!
//! The stack is driven by a single [`transaction::endpoint::Endpoint`]
//! serve loop; individual transactions are pumped by their owner task
//! through message channels, so no transaction state is ever touched
//! concurrently.

pub mod dialog;
pub mod error;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod ua;

pub use error::{Error, Result};

/// Product token advertised in the User-Agent and Server headers.
pub const USER_AGENT: &str = concat!("sipkit/", env!("CARGO_PKG_VERSION"));
