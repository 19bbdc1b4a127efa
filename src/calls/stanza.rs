//! Call stanza parsing and building.
//!
//! Signaling rides on `<message>` stanzas whose `type` attribute names the
//! [`SignalingType`]. Presence stanzas are inspected only for peers going
//! offline.

use jingle_core::stanza::{Jid, Node, NodeBuilder};
use jingle_core::types::{AvFlags, SessionId};

use super::error::CallError;
use super::signaling::SignalingType;

pub const MESSAGE_TAG: &str = "message";
pub const PRESENCE_TAG: &str = "presence";

/// Parsed call signaling stanza.
#[derive(Debug, Clone)]
pub struct ParsedCallStanza {
    pub signaling_type: SignalingType,
    pub sid: SessionId,
    /// Sender, normally a full JID.
    pub from: Jid,
    pub to: Option<Jid>,
    /// Hex-encoded fingerprint-MAC key, encrypted for the recipient.
    pub fpr_mac_key: Option<String>,
    /// Scrambled sender id, used in statistics.
    pub anon_id: Option<String>,
    pub media: AvFlags,
    pub reason: Option<String>,
    pub text: Option<String>,
    /// Device that handled the call, for call-handled notices.
    pub handled_by: Option<Jid>,
    pub accepted: Option<bool>,
    /// Non-empty for file-transfer invitations.
    pub files: Vec<String>,
}

impl ParsedCallStanza {
    pub fn parse(node: &Node) -> Result<Self, CallError> {
        if node.tag != MESSAGE_TAG {
            return Err(CallError::Parse(format!(
                "expected '{MESSAGE_TAG}' tag, got '{}'",
                node.tag
            )));
        }

        let mut attrs = node.attrs();
        let type_attr = attrs.optional_string("type").unwrap_or_default();
        let signaling_type = SignalingType::from_tag(type_attr)
            .ok_or_else(|| CallError::InvalidSignalingType(type_attr.to_string()))?;

        let sid = attrs
            .optional_string("sid")
            .filter(|s| !s.is_empty())
            .map(SessionId::from)
            .ok_or(CallError::MissingAttribute("sid"))?;
        let from = attrs
            .optional_jid("from")
            .ok_or(CallError::MissingAttribute("from"))?;
        let to = attrs.optional_jid("to");
        let fpr_mac_key = attrs.optional_string("fprmackey").map(str::to_string);
        let anon_id = attrs.optional_string("anonid").map(str::to_string);
        let media = attrs
            .optional_string("media")
            .map(AvFlags::from_wire)
            .unwrap_or_default();
        let reason = attrs.optional_string("reason").map(str::to_string);
        let handled_by = attrs.optional_jid("by");
        let accepted = attrs.optional_bool("accepted");
        attrs.finish()?;

        let text = node
            .get_optional_child("body")
            .and_then(|b| b.text())
            .map(str::to_string);
        let files = node
            .get_children_by_tag("file")
            .filter_map(|f| f.attrs.get("name").map(|v| v.to_string_value()))
            .collect();

        match signaling_type {
            SignalingType::Invite => {
                if fpr_mac_key.is_none() {
                    return Err(CallError::MissingAttribute("fprmackey"));
                }
                if anon_id.is_none() {
                    return Err(CallError::MissingAttribute("anonid"));
                }
            }
            SignalingType::Answer => {
                if fpr_mac_key.is_none() {
                    return Err(CallError::MissingAttribute("fprmackey"));
                }
                if from.is_bare() {
                    return Err(CallError::Parse(
                        "answer must come from a full address".to_string(),
                    ));
                }
            }
            SignalingType::CallHandled => {
                if handled_by.is_none() {
                    return Err(CallError::MissingAttribute("by"));
                }
                if accepted.is_none() {
                    return Err(CallError::MissingAttribute("accepted"));
                }
            }
            SignalingType::Decline | SignalingType::Cancel => {}
        }

        Ok(Self {
            signaling_type,
            sid,
            from,
            to,
            fpr_mac_key,
            anon_id,
            media,
            reason,
            text,
            handled_by,
            accepted,
            files,
        })
    }

    pub fn is_data_call(&self) -> bool {
        !self.files.is_empty()
    }
}

/// Returns the sender of a `<presence type="unavailable">` stanza.
pub fn parse_presence_unavailable(node: &Node) -> Option<Jid> {
    if node.tag != PRESENCE_TAG {
        return None;
    }
    let mut attrs = node.attrs();
    if attrs.optional_string("type") != Some("unavailable") {
        return None;
    }
    attrs.optional_jid("from")
}

/// Builder for call stanzas.
pub struct CallStanzaBuilder {
    signaling_type: SignalingType,
    sid: SessionId,
    to: Jid,
    from: Option<Jid>,
    fpr_mac_key: Option<String>,
    anon_id: Option<String>,
    media: Option<AvFlags>,
    reason: Option<String>,
    text: Option<String>,
    handled: Option<(Jid, bool)>,
    files: Vec<String>,
}

impl CallStanzaBuilder {
    pub fn new(signaling_type: SignalingType, sid: &SessionId, to: Jid) -> Self {
        Self {
            signaling_type,
            sid: sid.clone(),
            to,
            from: None,
            fpr_mac_key: None,
            anon_id: None,
            media: None,
            reason: None,
            text: None,
            handled: None,
            files: Vec::new(),
        }
    }

    pub fn from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn fpr_mac_key(mut self, key: impl Into<String>) -> Self {
        self.fpr_mac_key = Some(key.into());
        self
    }

    pub fn anon_id(mut self, anon_id: impl Into<String>) -> Self {
        self.anon_id = Some(anon_id.into());
        self
    }

    pub fn media(mut self, media: AvFlags) -> Self {
        self.media = Some(media);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn text(mut self, text: Option<String>) -> Self {
        self.text = text.filter(|t| !t.is_empty());
        self
    }

    pub fn handled_by(mut self, by: Jid, accepted: bool) -> Self {
        self.handled = Some((by, accepted));
        self
    }

    pub fn files(mut self, files: &[String]) -> Self {
        self.files = files.to_vec();
        self
    }

    pub fn build(self) -> Node {
        let mut builder = NodeBuilder::new(MESSAGE_TAG)
            .attr("type", self.signaling_type.tag_name())
            .jid_attr("to", self.to)
            .attr("sid", self.sid.as_str());

        if let Some(from) = self.from {
            builder = builder.jid_attr("from", from);
        }
        if let Some(key) = self.fpr_mac_key {
            builder = builder.attr("fprmackey", key);
        }
        if let Some(anon_id) = self.anon_id {
            builder = builder.attr("anonid", anon_id);
        }
        if let Some(media) = self.media {
            builder = builder.attr("media", media.to_wire());
        }
        if let Some(reason) = self.reason {
            builder = builder.attr("reason", reason);
        }
        if let Some((by, accepted)) = self.handled {
            builder = builder
                .jid_attr("by", by)
                .attr("accepted", if accepted { "1" } else { "0" });
        }

        let mut children: Vec<Node> = self
            .files
            .iter()
            .map(|name| NodeBuilder::new("file").attr("name", name.as_str()).build())
            .collect();
        if let Some(text) = self.text {
            children.push(NodeBuilder::new("body").string_content(text).build());
        }
        if !children.is_empty() {
            builder = builder.children(children);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    /// Builder output carries no `from`; the server stamps it. Tests add it
    /// the way an inbound stanza would arrive.
    fn inbound(node: Node, from: &str) -> Node {
        let mut node = node;
        node.attrs.insert("from".to_string(), from);
        node
    }

    #[test]
    fn test_parse_invite() {
        let sid = SessionId::from("0123456789abcdef");
        let node = CallStanzaBuilder::new(SignalingType::Invite, &sid, jid("bob@example.com"))
            .fpr_mac_key("c0ffee")
            .anon_id("anon-alice")
            .media(AvFlags::AUDIO_VIDEO)
            .build();
        let parsed = ParsedCallStanza::parse(&inbound(node, "alice@example.com/laptop")).unwrap();

        assert_eq!(parsed.signaling_type, SignalingType::Invite);
        assert_eq!(parsed.sid, sid);
        assert_eq!(parsed.from, jid("alice@example.com/laptop"));
        assert_eq!(parsed.to, Some(jid("bob@example.com")));
        assert_eq!(parsed.fpr_mac_key.as_deref(), Some("c0ffee"));
        assert_eq!(parsed.media, AvFlags::AUDIO_VIDEO);
        assert!(!parsed.is_data_call());
    }

    #[test]
    fn test_parse_data_invite_lists_files() {
        let sid = SessionId::from("s1");
        let files = vec!["a.txt".to_string(), "b.png".to_string()];
        let node = CallStanzaBuilder::new(SignalingType::Invite, &sid, jid("bob@example.com/x"))
            .fpr_mac_key("00")
            .anon_id("z")
            .media(AvFlags::NONE)
            .files(&files)
            .build();
        let parsed = ParsedCallStanza::parse(&inbound(node, "alice@example.com/l")).unwrap();
        assert!(parsed.is_data_call());
        assert_eq!(parsed.files, files);
    }

    #[test]
    fn test_parse_decline_with_body() {
        let sid = SessionId::from("s2");
        let node = CallStanzaBuilder::new(SignalingType::Decline, &sid, jid("alice@example.com/l"))
            .reason("busy")
            .text(Some("in a meeting".to_string()))
            .build();
        let parsed = ParsedCallStanza::parse(&inbound(node, "bob@example.com/a")).unwrap();
        assert_eq!(parsed.reason.as_deref(), Some("busy"));
        assert_eq!(parsed.text.as_deref(), Some("in a meeting"));
    }

    #[test]
    fn test_call_handled_requires_by_and_accepted() {
        let sid = SessionId::from("s3");
        let node = CallStanzaBuilder::new(SignalingType::CallHandled, &sid, jid("bob@example.com"))
            .handled_by(jid("bob@example.com/a"), true)
            .build();
        assert!(node.attrs.get("accepted").is_some_and(|v| v == "1"));
        let parsed = ParsedCallStanza::parse(&inbound(node, "alice@example.com/l")).unwrap();
        assert_eq!(parsed.handled_by, Some(jid("bob@example.com/a")));
        assert_eq!(parsed.accepted, Some(true));

        let bare = CallStanzaBuilder::new(SignalingType::CallHandled, &sid, jid("bob@example.com"))
            .build();
        assert!(matches!(
            ParsedCallStanza::parse(&inbound(bare, "alice@example.com/l")),
            Err(CallError::MissingAttribute("by"))
        ));
    }

    #[test]
    fn test_rejects_missing_sid_and_unknown_type() {
        let no_sid = NodeBuilder::new("message")
            .attr("type", "call-cancel")
            .attr("from", "alice@example.com/l")
            .build();
        assert!(matches!(
            ParsedCallStanza::parse(&no_sid),
            Err(CallError::MissingAttribute("sid"))
        ));

        let chat = NodeBuilder::new("message")
            .attr("type", "chat")
            .attr("sid", "x")
            .build();
        assert!(matches!(
            ParsedCallStanza::parse(&chat),
            Err(CallError::InvalidSignalingType(t)) if t == "chat"
        ));
    }

    #[test]
    fn test_answer_from_bare_address_is_rejected() {
        let node = CallStanzaBuilder::new(SignalingType::Answer, &SessionId::from("s"), jid("alice@example.com/l"))
            .fpr_mac_key("00")
            .anon_id("a")
            .build();
        assert!(matches!(
            ParsedCallStanza::parse(&inbound(node, "bob@example.com")),
            Err(CallError::Parse(_))
        ));
    }

    #[test]
    fn test_presence_unavailable() {
        let node = NodeBuilder::new("presence")
            .attr("type", "unavailable")
            .attr("from", "bob@example.com/a")
            .build();
        assert_eq!(parse_presence_unavailable(&node), Some(jid("bob@example.com/a")));

        let available = NodeBuilder::new("presence")
            .attr("from", "bob@example.com/a")
            .build();
        assert_eq!(parse_presence_unavailable(&available), None);
    }
}
