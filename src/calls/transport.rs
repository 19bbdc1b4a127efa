//! Outbound side of the XMPP connection, as seen by the call engine.

use async_trait::async_trait;
use jingle_core::stanza::Node;

/// Delivers stanzas to the XMPP server. Inbound stanzas are fed to the
/// engine through [`super::RtcEngine::handle_stanza`].
#[async_trait]
pub trait StanzaSender: Send + Sync {
    async fn send_node(&self, node: Node) -> Result<(), anyhow::Error>;
}
