use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// One unit of the client↔gateway sub-protocol, JSON-encoded over a
/// WebSocket text message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Frame {
    pub fn command(&self) -> FrameCommand {
        FrameCommand::parse(&self.command)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCommand {
    Connect,
    Subscribe,
    Send,
    Disconnect,
    /// Unknown commands pass through the gateway unchanged
    Other(String),
}

impl FrameCommand {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "CONNECT" => FrameCommand::Connect,
            "SUBSCRIBE" => FrameCommand::Subscribe,
            "SEND" => FrameCommand::Send,
            "DISCONNECT" => FrameCommand::Disconnect,
            _ => FrameCommand::Other(raw.to_string()),
        }
    }
}

/// Server-to-client events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        session_id: String,
        principal: String,
    },
    Subscribed {
        destination: String,
    },
    Receipt {
        message_id: String,
        status: String,
    },
    Message {
        message_id: String,
        destination: String,
        sender: String,
        payload: String,
        sent_at: i64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Instructs the connection loop to close the transport
    Close {
        code: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Survives a broker restart
    Persistent,
    Transient,
}

/// Broker-facing message envelope.
///
/// The payload is the base64 ciphertext produced by the send pipeline;
/// `message_id` doubles as the publish correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub destination: String,
    pub routing_key: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_principal: Option<String>,
    pub payload: String,
    pub delivery_mode: DeliveryMode,
    /// Unix milliseconds
    pub sent_at: i64,
}

impl Envelope {
    pub fn validate(&self) -> Result<(), String> {
        if self.message_id.is_empty() {
            return Err("message_id is empty".to_string());
        }
        if self.destination.is_empty() {
            return Err("destination is empty".to_string());
        }
        if self.routing_key.is_empty() {
            return Err("routing_key is empty".to_string());
        }
        Ok(())
    }
}
