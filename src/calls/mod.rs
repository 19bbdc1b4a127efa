//! Call signaling and session management.
//!
//! # Architecture
//!
//! - [`RtcEngine`]: cloneable handle; every operation becomes a command for
//!   the engine actor, which owns all call state.
//! - [`CallRequest`], [`IncomingCallEntry`], [`Session`]: the three kinds of
//!   registry entry. Removing an entry from the registry is the claim that
//!   lets exactly one path finish a call.
//! - [`ParsedCallStanza`] and [`CallStanzaBuilder`]: the `<message>` based
//!   wire format.
//! - [`MediaStreamRefCounter`]: shares one local capture among calls.
//! - [`TerminationCoordinator`]: stats, media release and the terminal event.
//!
//! # Protocol Overview
//!
//! A caller sends `call-invite` to a bare address, reaching every device of
//! the callee. The first device to `call-answer` wins; the caller then tells
//! the other devices with `call-handled`. Either side may withdraw with
//! `call-cancel` or `call-decline` before the session starts.

mod encryption;
mod engine;
mod error;
mod handle;
mod incoming;
mod media;
mod registry;
mod request;
mod session;
mod signaling;
mod stanza;
mod termination;
mod transport;

#[cfg(test)]
mod protocol_tests;

pub use encryption::{CallCrypto, FprMacKey, SharedSecretCrypto};
pub use engine::{HangupFilter, MediaQuery};
pub use error::CallError;
pub use handle::{EngineDeps, OutgoingCall, RtcEngine};
pub use incoming::{IncomingCall, IncomingCallEntry, IncomingState};
pub use media::{
    LocalMediaStatus, MediaEngine, MediaError, MediaStreamRefCounter, SessionParams,
};
pub use registry::{CallEntry, SessionRegistry};
pub use request::{CallRequest, InvalidTransition, RequestState, RequestTransition};
pub use session::Session;
pub use signaling::{CancelReason, SignalingType};
pub use stanza::{CallStanzaBuilder, ParsedCallStanza, parse_presence_unavailable};
pub use termination::{StatsSubmitter, TerminationCoordinator};
pub use transport::StanzaSender;
