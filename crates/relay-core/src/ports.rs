use async_trait::async_trait;

use crate::{
    domain::{Diagnostic, InboundMessage, OutboundMessage},
    errors::Error,
    Result,
};

/// Hexagonal port for a chat provider.
///
/// Methods take `&mut self`: one cycle owns the adapter at a time and the
/// adapter's id bookkeeping is not synchronized across concurrent callers.
#[async_trait]
pub trait ChannelAdapter: Send {
    /// Fetch the next batch of normalized inbound messages.
    async fn fetch(&mut self) -> Result<Vec<InboundMessage>>;

    /// Deliver one outbound message.
    async fn send(&mut self, outbound: &OutboundMessage) -> Result<()>;

    /// Mark an update as fully handled so the cursor may move past it.
    fn ack(&mut self, update_id: &str) -> Result<()>;

    /// Take all diagnostics recorded since the last drain.
    fn drain_diagnostics(&mut self) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// Port for the business logic that decides what to reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Return zero or one outbound message for one inbound message.
    async fn handle(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
    ) -> Result<Option<OutboundMessage>>;

    fn drain_diagnostics(&self) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// Maps an inbound message to the conversation session it belongs to.
pub type SessionResolver = fn(&InboundMessage) -> Result<String>;

/// Default session mapping: one session per chat.
pub fn session_id_for_inbound(inbound: &InboundMessage) -> Result<String> {
    chat_session_id(inbound.chat_id())
}

pub fn chat_session_id(chat_id: &str) -> Result<String> {
    let value = chat_id.trim();
    if value.is_empty() {
        return Err(Error::Contract("chat_id must be a non-empty string".to_string()));
    }
    Ok(format!("telegram:{value}"))
}
