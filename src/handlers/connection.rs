use tokio::sync::mpsc;
use uuid::Uuid;

use crate::authorizer::FrameSession;
use crate::message::ServerEvent;

/// Per-connection state handed to the gateway for every frame.
///
/// All server-to-client traffic goes through the event channel; the
/// connection loop owns the WebSocket sink and drains the channel, so frame
/// handling never blocks on the transport.
pub struct ClientConnection {
    session_id: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
    session: FrameSession,
}

impl ClientConnection {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            tx,
            session: FrameSession::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session(&self) -> &FrameSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut FrameSession {
        &mut self.session
    }

    /// Clone of the transport handle, stored in the registry at CONNECT
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ServerEvent> {
        self.tx.clone()
    }

    pub fn send_event(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(session_id = %self.session_id, "Event dropped: connection closing");
        }
    }

    pub fn send_error(&self, code: &str, message: &str) {
        self.send_event(ServerEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}
