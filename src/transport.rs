//! Messaging transport capability
//!
//! Payments travel to contacts as gift-wrapped direct messages. The core
//! never talks to relays itself: it asks the transport to wrap a payload
//! for a recipient (and a second copy for the sender, so the payment shows
//! up in the local timeline) and to publish both wraps to the relay set.

use async_trait::async_trait;
use nostr::{Keys, PublicKey};

use crate::errors::WalletResult;

/// An opaque wrapped message produced by the transport
#[derive(Debug, Clone)]
pub struct WrappedMessage {
    /// Wrap identifier assigned by the transport; used for message dedup
    pub wrap_id: String,
    /// Recipient the wrap is addressed to (hex)
    pub recipient: String,
    /// Serialized wrapped event, opaque to the core
    pub payload: String,
}

/// Result of publishing to the relay set
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// True when at least one relay accepted the message
    pub any_success: bool,
    /// Last relay error, when none accepted
    pub error: Option<String>,
}

impl PublishOutcome {
    pub fn ok(&self) -> bool {
        self.any_success
    }
}

/// Gift-wrap messaging transport, consumed but never implemented here
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Wrap a payload for a recipient
    async fn wrap(
        &self,
        sender: &Keys,
        recipient: &PublicKey,
        payload: &str,
    ) -> WalletResult<WrappedMessage>;

    /// Publish both wraps (sender copy and recipient copy) to the relay
    /// set, with the transport's own retry policy
    async fn publish(
        &self,
        wrap_for_self: &WrappedMessage,
        wrap_for_recipient: &WrappedMessage,
    ) -> WalletResult<PublishOutcome>;
}

/// Wrap a payload for the recipient and for the sender's own timeline, then
/// publish both
pub async fn wrap_and_publish(
    transport: &dyn MessageTransport,
    sender: &Keys,
    recipient: &PublicKey,
    payload: &str,
) -> WalletResult<PublishOutcome> {
    let for_recipient = transport.wrap(sender, recipient, payload).await?;
    let for_self = transport.wrap(sender, &sender.public_key(), payload).await?;

    let outcome = transport.publish(&for_self, &for_recipient).await?;
    if !outcome.ok() {
        log::warn!(
            "Publish failed for wrap {}: {}",
            for_recipient.wrap_id,
            outcome.error.as_deref().unwrap_or("unknown")
        );
    }
    Ok(outcome)
}
