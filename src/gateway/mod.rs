//! External gateway client.
//!
//! A [`Gateway`] authenticates a credential and yields a [`GatewayConnection`]:
//! a live session that can be torn down plus a stream of dispatch events.

mod discord;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GatewayError;

pub use discord::DiscordGateway;

/// Gateway intents bitfield requested when identifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intents(pub u64);

impl Intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;

    /// Intents given to the runtime's own default client.
    pub fn default_client() -> Self {
        Self(Self::GUILDS | Self::GUILD_MESSAGES | Self::MESSAGE_CONTENT)
    }

    pub fn contains(self, bits: u64) -> bool {
        self.0 & bits == bits
    }
}

/// Identity reported by the gateway once the session is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyInfo {
    pub user_id: String,
    pub username: String,
    pub session_id: String,
}

/// A dispatch event received from the gateway, e.g. `MESSAGE_CREATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

/// An action requested by bot code that the host performs on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundAction {
    SendMessage {
        channel_id: String,
        body: serde_json::Value,
    },
}

/// An authenticated gateway session.
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Perform an outbound action with this session's credential.
    async fn perform(&self, action: OutboundAction) -> Result<(), GatewayError>;

    /// Close the connection. Resolves once teardown completes. Idempotent.
    async fn destroy(&self) -> Result<(), GatewayError>;
}

/// Result of a successful login.
pub struct GatewayConnection {
    pub session: Arc<dyn GatewaySession>,
    pub events: mpsc::Receiver<GatewayEvent>,
    pub ready: ReadyInfo,
}

/// Factory for authenticated sessions.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Authenticate `credential`; rejects on an invalid credential or network failure.
    async fn login(
        &self,
        credential: &SecretString,
        intents: Intents,
    ) -> Result<GatewayConnection, GatewayError>;
}

/// Convert a gateway dispatch name to its client event name
/// (`MESSAGE_CREATE` becomes `messageCreate`).
pub fn client_event_name(dispatch: &str) -> String {
    let mut out = String::with_capacity(dispatch.len());
    for (i, part) in dispatch.split('_').filter(|p| !p.is_empty()).enumerate() {
        let lower = part.to_ascii_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_names() {
        assert_eq!(client_event_name("MESSAGE_CREATE"), "messageCreate");
        assert_eq!(client_event_name("GUILD_MEMBER_ADD"), "guildMemberAdd");
        assert_eq!(client_event_name("READY"), "ready");
        assert_eq!(client_event_name("INTERACTION_CREATE"), "interactionCreate");
    }

    #[test]
    fn test_default_client_intents() {
        let intents = Intents::default_client();
        assert_eq!(intents.0, 33281);
        assert!(intents.contains(Intents::MESSAGE_CONTENT));
        assert!(!intents.contains(Intents::GUILD_MEMBERS));
    }

    #[test]
    fn test_outbound_action_shape() {
        let action = OutboundAction::SendMessage {
            channel_id: "42".to_string(),
            body: serde_json::json!({ "content": "hi" }),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "send_message");
        assert_eq!(json["channel_id"], "42");
    }
}
