//! Outgoing call request and its state machine.

use jingle_core::stanza::Jid;
use jingle_core::types::{AvFlags, SessionId};
use tokio::task::AbortHandle;

use super::encryption::FprMacKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// Waiting for local capture before the invite can go out.
    #[default]
    NotYetLocalMedia,
    /// Invite sent, racing answer, decline, timeout and cancel.
    GotMediaWaitingPeer,
    PeerAnsweredOrTimedOut,
    CanceledByCaller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTransition {
    MediaAcquired,
    MediaFailed,
    UserCanceled,
    PeerAnswered,
    PeerDeclined,
    AnswerTimedOut,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// One outgoing invitation attempt.
#[derive(Debug)]
pub struct CallRequest {
    pub sid: SessionId,
    /// Bare for a broadcast to every device of the user.
    pub target: Jid,
    pub own_jid: Jid,
    /// Requested media, narrowed to what local capture actually delivered.
    pub media: AvFlags,
    pub files: Vec<String>,
    pub own_key: FprMacKey,
    pub state: RequestState,
    /// Media reference held by this request, released exactly once.
    pub holds_media: Option<AvFlags>,
    pub timer: Option<AbortHandle>,
}

impl CallRequest {
    pub fn new(
        sid: SessionId,
        target: Jid,
        own_jid: Jid,
        media: AvFlags,
        files: Vec<String>,
        own_key: FprMacKey,
    ) -> Self {
        Self {
            sid,
            target,
            own_jid,
            media,
            files,
            own_key,
            state: RequestState::NotYetLocalMedia,
            holds_media: None,
            timer: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_bare()
    }

    pub fn is_data_call(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn apply_transition(
        &mut self,
        transition: RequestTransition,
    ) -> Result<(), InvalidTransition> {
        use RequestState::*;
        use RequestTransition::*;

        let new_state = match (self.state, transition) {
            (NotYetLocalMedia, MediaAcquired) => GotMediaWaitingPeer,
            (NotYetLocalMedia, MediaFailed | UserCanceled) => CanceledByCaller,
            (GotMediaWaitingPeer, PeerAnswered | PeerDeclined | AnswerTimedOut) => {
                PeerAnsweredOrTimedOut
            }
            (GotMediaWaitingPeer, UserCanceled) => CanceledByCaller,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    /// Stop the answer timer. Safe to call repeatedly.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CallRequest {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
