//! The three live collections of the engine, keyed by session id.
//!
//! Removal is a *claim*: whichever handler removes an entry first owns its
//! termination, and every later handler finds nothing and backs off.

use jingle_core::stanza::Jid;
use jingle_core::types::{AvFlags, EntryKind, SessionId};
use std::collections::HashMap;

use super::error::CallError;
use super::incoming::IncomingCallEntry;
use super::request::CallRequest;
use super::session::Session;

/// What bulk-hangup predicates get to look at.
#[derive(Debug, Clone, Copy)]
pub struct HangupCandidate<'a> {
    pub sid: &'a SessionId,
    pub peer: &'a Jid,
    pub kind: EntryKind,
    pub is_data_call: bool,
}

/// An entry removed from the registry, owned by whoever claimed it.
#[derive(Debug)]
pub enum CallEntry {
    Request(CallRequest),
    Incoming(IncomingCallEntry),
    Session(Session),
}

impl CallEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            CallEntry::Request(_) => EntryKind::Request,
            CallEntry::Incoming(_) => EntryKind::Incoming,
            CallEntry::Session(_) => EntryKind::Session,
        }
    }

    pub fn sid(&self) -> &SessionId {
        match self {
            CallEntry::Request(r) => &r.sid,
            CallEntry::Incoming(i) => &i.sid,
            CallEntry::Session(s) => &s.sid,
        }
    }

    pub fn peer(&self) -> &Jid {
        match self {
            CallEntry::Request(r) => &r.target,
            CallEntry::Incoming(i) => &i.caller,
            CallEntry::Session(s) => &s.peer,
        }
    }

    pub fn is_caller(&self) -> bool {
        match self {
            CallEntry::Request(_) => true,
            CallEntry::Incoming(_) => false,
            CallEntry::Session(s) => s.is_caller,
        }
    }

    pub fn holds_media(&self) -> Option<AvFlags> {
        match self {
            CallEntry::Request(r) => r.holds_media,
            CallEntry::Incoming(i) => i.holds_media,
            CallEntry::Session(s) => s.holds_media,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    requests: HashMap<SessionId, CallRequest>,
    incoming: HashMap<SessionId, IncomingCallEntry>,
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, sid: &SessionId) -> bool {
        self.requests.contains_key(sid)
            || self.incoming.contains_key(sid)
            || self.sessions.contains_key(sid)
    }

    pub fn len(&self) -> usize {
        self.requests.len() + self.incoming.len() + self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_request(&mut self, request: CallRequest) -> Result<(), CallError> {
        self.ensure_free(&request.sid)?;
        self.requests.insert(request.sid.clone(), request);
        Ok(())
    }

    pub fn insert_incoming(&mut self, entry: IncomingCallEntry) -> Result<(), CallError> {
        self.ensure_free(&entry.sid)?;
        self.incoming.insert(entry.sid.clone(), entry);
        Ok(())
    }

    pub fn insert_session(&mut self, session: Session) -> Result<(), CallError> {
        self.ensure_free(&session.sid)?;
        self.sessions.insert(session.sid.clone(), session);
        Ok(())
    }

    fn ensure_free(&self, sid: &SessionId) -> Result<(), CallError> {
        if self.contains(sid) {
            return Err(CallError::AlreadyExists(sid.to_string()));
        }
        Ok(())
    }

    pub fn request(&self, sid: &SessionId) -> Option<&CallRequest> {
        self.requests.get(sid)
    }

    pub fn request_mut(&mut self, sid: &SessionId) -> Option<&mut CallRequest> {
        self.requests.get_mut(sid)
    }

    pub fn incoming(&self, sid: &SessionId) -> Option<&IncomingCallEntry> {
        self.incoming.get(sid)
    }

    pub fn incoming_mut(&mut self, sid: &SessionId) -> Option<&mut IncomingCallEntry> {
        self.incoming.get_mut(sid)
    }

    pub fn session(&self, sid: &SessionId) -> Option<&Session> {
        self.sessions.get(sid)
    }

    pub fn session_mut(&mut self, sid: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(sid)
    }

    pub fn claim_request(&mut self, sid: &SessionId) -> Option<CallRequest> {
        self.requests.remove(sid)
    }

    pub fn claim_incoming(&mut self, sid: &SessionId) -> Option<IncomingCallEntry> {
        self.incoming.remove(sid)
    }

    pub fn claim_session(&mut self, sid: &SessionId) -> Option<Session> {
        self.sessions.remove(sid)
    }

    pub fn claim(&mut self, kind: EntryKind, sid: &SessionId) -> Option<CallEntry> {
        match kind {
            EntryKind::Request => self.claim_request(sid).map(CallEntry::Request),
            EntryKind::Incoming => self.claim_incoming(sid).map(CallEntry::Incoming),
            EntryKind::Session => self.claim_session(sid).map(CallEntry::Session),
        }
    }

    /// First session whose peer matches `address` (bare: any device of the
    /// user; full: that device only).
    pub fn session_by_peer(&self, address: &Jid) -> Option<&Session> {
        self.sessions.values().find(|s| s.peer.matches(address))
    }

    /// Sessions whose peer is exactly `address`.
    pub fn sessions_with_peer(&self, address: &Jid) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| &s.peer == address)
            .map(|s| s.sid.clone())
            .collect()
    }

    /// Snapshot of every entry across the three collections accepted by
    /// `predicate`. Entries added after the call are not part of it.
    pub fn enumerate_for_hangup<F>(&self, mut predicate: F) -> Vec<(EntryKind, SessionId)>
    where
        F: FnMut(&HangupCandidate<'_>) -> bool,
    {
        let requests = self.requests.values().map(|r| HangupCandidate {
            sid: &r.sid,
            peer: &r.target,
            kind: EntryKind::Request,
            is_data_call: r.is_data_call(),
        });
        let incoming = self.incoming.values().map(|i| HangupCandidate {
            sid: &i.sid,
            peer: &i.caller,
            kind: EntryKind::Incoming,
            is_data_call: i.is_data_call(),
        });
        let sessions = self.sessions.values().map(|s| HangupCandidate {
            sid: &s.sid,
            peer: &s.peer,
            kind: EntryKind::Session,
            is_data_call: s.is_data_call,
        });

        requests
            .chain(incoming)
            .chain(sessions)
            .filter(|c| predicate(c))
            .map(|c| (c.kind, c.sid.clone()))
            .collect()
    }
}
