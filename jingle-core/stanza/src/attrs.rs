use crate::error::{BinaryError, Result};
use crate::jid::Jid;
use crate::node::{Attrs, Node, NodeValue};

pub struct AttrParser<'a> {
    pub attrs: &'a Attrs,
    pub errors: Vec<BinaryError>,
}

impl<'a> AttrParser<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self {
            attrs: &node.attrs,
            errors: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(&self) -> Result<()> {
        if self.ok() {
            Ok(())
        } else {
            Err(BinaryError::AttrList(self.errors.clone()))
        }
    }

    fn get_raw(&mut self, key: &str, require: bool) -> Option<&'a NodeValue> {
        let val = self.attrs.get(key);
        if require && val.is_none() {
            self.errors.push(BinaryError::MissingAttr(key.to_string()));
        }
        val
    }

    /// Get string from the value. JID values yield None; use `optional_jid`.
    pub fn optional_string(&mut self, key: &str) -> Option<&'a str> {
        self.get_raw(key, false).and_then(|v| v.as_str())
    }

    pub fn required_string(&mut self, key: &str) -> Result<&'a str> {
        self.optional_string(key)
            .ok_or_else(|| BinaryError::MissingAttr(key.to_string()))
    }

    /// Get a JID, parsing string values. A malformed JID is recorded as an error.
    pub fn optional_jid(&mut self, key: &str) -> Option<Jid> {
        let value = self.get_raw(key, false)?;
        match value {
            NodeValue::Jid(j) => Some(j.clone()),
            NodeValue::String(s) => match s.parse::<Jid>() {
                Ok(jid) => Some(jid),
                Err(e) => {
                    self.errors.push(BinaryError::Jid(e));
                    None
                }
            },
        }
    }

    pub fn required_jid(&mut self, key: &str) -> Result<Jid> {
        match self.get_raw(key, false) {
            None => Err(BinaryError::MissingAttr(key.to_string())),
            Some(NodeValue::Jid(j)) => Ok(j.clone()),
            Some(NodeValue::String(s)) => Ok(s.parse::<Jid>()?),
        }
    }

    /// Accepts `1`/`0` as well as `true`/`false`.
    pub fn optional_bool(&mut self, key: &str) -> Option<bool> {
        let raw = self.get_raw(key, false)?.to_string_value();
        match raw.as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            other => {
                self.errors.push(BinaryError::AttrParse(format!(
                    "Failed to parse bool from '{other}' for key '{key}'"
                )));
                None
            }
        }
    }
}
