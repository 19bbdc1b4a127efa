pub use jingle_core::{net, stanza, stats, types};

pub mod calls;
pub mod config;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use calls::{CallError, EngineDeps, OutgoingCall, RtcEngine};
pub use config::RtcConfig;
