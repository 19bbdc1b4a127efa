use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JidError {
    Empty,
    InvalidFormat(String),
}

impl fmt::Display for JidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JidError::Empty => write!(f, "JID is empty"),
            JidError::InvalidFormat(s) => write!(f, "Invalid JID format: {s}"),
        }
    }
}

impl std::error::Error for JidError {}

/// An XMPP address: `user@domain/resource`.
///
/// A JID without a resource is "bare" and addresses every device of a user.
/// A JID with a resource is "full" and addresses one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    pub fn new(user: &str, domain: &str) -> Self {
        Self {
            user: user.to_string(),
            domain: domain.to_string(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn to_bare(&self) -> Self {
        Self {
            user: self.user.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_same_user_as(&self, other: &Jid) -> bool {
        self.user == other.user && self.domain == other.domain
    }

    /// Address matching used for routing and bulk hangup.
    ///
    /// A bare `pattern` matches any device of the same user, a full one
    /// requires an exact match.
    pub fn matches(&self, pattern: &Jid) -> bool {
        if pattern.is_bare() {
            self.is_same_user_as(pattern)
        } else {
            self == pattern
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        let (addr, resource) = match s.split_once('/') {
            Some((addr, res)) if !res.is_empty() => (addr, Some(res.to_string())),
            Some(_) => return Err(JidError::InvalidFormat(s.to_string())),
            None => (s, None),
        };

        let (user, domain) = match addr.split_once('@') {
            Some((user, domain)) => (user, domain),
            None => ("", addr),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(JidError::InvalidFormat(s.to_string()));
        }

        Ok(Self {
            user: user.to_string(),
            domain: domain.to_string(),
            resource,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::from_str(&value)
    }
}
