use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attrs::AttrParser;
use crate::jid::Jid;

/// An attribute value that is either a plain string or a structured JID.
/// JID-typed attributes skip a format/parse round trip when routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeValue {
    String(String),
    Jid(Jid),
}

impl Default for NodeValue {
    fn default() -> Self {
        NodeValue::String(String::new())
    }
}

impl NodeValue {
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NodeValue::String(s) => Some(s.as_ref()),
            NodeValue::Jid(_) => None,
        }
    }

    /// Convert to an owned Jid, parsing from string if necessary.
    #[inline]
    pub fn to_jid(&self) -> Option<Jid> {
        match self {
            NodeValue::Jid(j) => Some(j.clone()),
            NodeValue::String(s) => s.parse().ok(),
        }
    }

    #[inline]
    pub fn to_string_value(&self) -> String {
        match self {
            NodeValue::String(s) => s.clone(),
            NodeValue::Jid(j) => j.to_string(),
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::String(s) => write!(f, "{s}"),
            NodeValue::Jid(j) => write!(f, "{j}"),
        }
    }
}

impl PartialEq<str> for NodeValue {
    fn eq(&self, other: &str) -> bool {
        match self {
            NodeValue::String(s) => s == other,
            NodeValue::Jid(j) => j.to_string() == other,
        }
    }
}

impl PartialEq<&str> for NodeValue {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl From<String> for NodeValue {
    #[inline]
    fn from(s: String) -> Self {
        NodeValue::String(s)
    }
}

impl From<&str> for NodeValue {
    #[inline]
    fn from(s: &str) -> Self {
        NodeValue::String(s.to_string())
    }
}

impl From<Jid> for NodeValue {
    #[inline]
    fn from(jid: Jid) -> Self {
        NodeValue::Jid(jid)
    }
}

/// Node attributes as ordered key-value pairs.
/// Stanzas carry a handful of attributes, so a Vec with linear lookup is enough.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attrs(pub Vec<(String, NodeValue)>);

impl Attrs {
    #[inline]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&NodeValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Insert a key-value pair, replacing the existing value if the key exists.
    pub fn insert(&mut self, key: String, value: impl Into<NodeValue>) {
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeValue)> {
        self.0.iter().map(|(k, v)| (k, v))
    }
}

impl FromIterator<(String, NodeValue)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (String, NodeValue)>>(iter: I) -> Self {
        let mut attrs = Attrs::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeContent {
    String(String),
    Nodes(Vec<Node>),
}

/// One XMPP stanza or stanza child element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: Option<NodeContent>,
}

impl Node {
    pub fn new(tag: &str, attrs: Attrs, content: Option<NodeContent>) -> Self {
        Self {
            tag: tag.to_string(),
            attrs,
            content,
        }
    }

    pub fn children(&self) -> Option<&[Node]> {
        match &self.content {
            Some(NodeContent::Nodes(nodes)) => Some(nodes),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Some(NodeContent::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn attrs(&self) -> AttrParser<'_> {
        AttrParser::new(self)
    }

    pub fn get_optional_child(&self, tag: &str) -> Option<&Node> {
        self.children()
            .and_then(|nodes| nodes.iter().find(|node| node.tag == tag))
    }

    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> {
        self.children()
            .into_iter()
            .flatten()
            .filter(move |node| node.tag == tag)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in self.attrs.iter() {
            write!(f, " {k}=\"{v}\"")?;
        }
        match &self.content {
            None => write!(f, "/>"),
            Some(NodeContent::String(s)) => write!(f, ">{s}</{}>", self.tag),
            Some(NodeContent::Nodes(nodes)) => {
                write!(f, ">")?;
                for node in nodes {
                    write!(f, "{node}")?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}
