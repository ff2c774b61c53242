// ============================================================================
// Frame authorizer: per-connection state machine + destination rules
// ============================================================================
//
// Dispatch table:
//
//   CONNECT     UNAUTHENTICATED -> verify bearer -> AUTHENTICATED
//   SUBSCRIBE   AUTHENTICATED   -> zone check on destination
//   SEND        AUTHENTICATED   -> validate/sanitize/encrypt, then zone check
//   DISCONNECT  any             -> CLOSED (idempotent)
//   other       any             -> pass through unchanged
//
// Destination zones, longest-prefix matched, deny-by-default:
//   /topic/public/...   anyone
//   /user/{name}/...    the authenticated principal's own namespace only
//   /topic/admin/...    admin role required
//
// ============================================================================

use std::sync::Arc;

use crate::auth::{AuthManager, Principal};
use crate::error::{GatewayError, GatewayResult};
use crate::message::{Frame, FrameCommand, AUTHORIZATION_HEADER};
use crate::payload::PayloadPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Per-connection authorizer state, owned by the connection task
#[derive(Debug)]
pub struct FrameSession {
    pub state: ConnState,
    pub principal: Option<Principal>,
}

impl FrameSession {
    pub fn new() -> Self {
        Self {
            state: ConnState::Unauthenticated,
            principal: None,
        }
    }
}

impl Default for FrameSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A SEND frame that passed the full pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedSend {
    pub destination: String,
    pub routing_key: String,
    pub target_principal: Option<String>,
    /// base64 ciphertext
    pub payload: String,
}

/// What an accepted frame asks the gateway to do
#[derive(Debug)]
pub enum Disposition {
    Connected(Principal),
    Subscribed { destination: String },
    Publish(ProcessedSend),
    Disconnected,
    PassThrough,
}

/// Three-zone destination authorization, shared by SUBSCRIBE and SEND
#[derive(Debug, Clone)]
pub struct DestinationRules {
    public_prefix: String,
    user_prefix: String,
    admin_prefix: String,
}

impl DestinationRules {
    pub fn new() -> Self {
        Self {
            public_prefix: "/topic/public/".to_string(),
            user_prefix: "/user/".to_string(),
            admin_prefix: "/topic/admin/".to_string(),
        }
    }

    pub fn check(&self, principal: &Principal, destination: &str) -> GatewayResult<()> {
        if destination.starts_with(&self.public_prefix) {
            return Ok(());
        }

        if let Some(rest) = destination.strip_prefix(&self.user_prefix) {
            let owner = rest.split('/').next().unwrap_or("");
            if owner == principal.name {
                return Ok(());
            }
            return Err(GatewayError::authorization(format!(
                "destination {} belongs to another principal",
                destination
            )));
        }

        if destination.starts_with(&self.admin_prefix) {
            if principal.is_admin() {
                return Ok(());
            }
            return Err(GatewayError::authorization(format!(
                "destination {} requires the admin role",
                destination
            )));
        }

        // deny-by-default
        Err(GatewayError::authorization(format!(
            "destination {} is not allowed",
            destination
        )))
    }

    /// Map an allowed destination to its routing key (and, for the per-user
    /// zone, the target principal of the private message).
    pub fn route(&self, destination: &str) -> Option<(String, Option<String>)> {
        if let Some(rest) = destination.strip_prefix(&self.public_prefix) {
            return Some((format!("room.{}", rest.replace('/', ".")), None));
        }
        if let Some(rest) = destination.strip_prefix(&self.user_prefix) {
            let owner = rest.split('/').next().unwrap_or("");
            return Some((format!("user.{}", owner), Some(owner.to_string())));
        }
        if let Some(rest) = destination.strip_prefix(&self.admin_prefix) {
            return Some((format!("room.{}", rest.replace('/', ".")), None));
        }
        None
    }
}

impl Default for DestinationRules {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless frame evaluation services, shared across connections
pub struct FrameAuthorizer {
    auth: Arc<AuthManager>,
    rules: DestinationRules,
    payload: PayloadPipeline,
}

impl FrameAuthorizer {
    pub fn new(auth: Arc<AuthManager>, rules: DestinationRules, payload: PayloadPipeline) -> Self {
        Self {
            auth,
            rules,
            payload,
        }
    }

    pub fn rules(&self) -> &DestinationRules {
        &self.rules
    }

    pub fn payload(&self) -> &PayloadPipeline {
        &self.payload
    }

    /// Evaluate one frame against the session state machine
    pub fn evaluate(&self, session: &mut FrameSession, frame: &Frame) -> GatewayResult<Disposition> {
        match frame.command() {
            FrameCommand::Connect => self.on_connect(session, frame),
            FrameCommand::Subscribe => self.on_subscribe(session, frame),
            FrameCommand::Send => self.on_send(session, frame),
            FrameCommand::Disconnect => {
                session.state = ConnState::Closed;
                Ok(Disposition::Disconnected)
            }
            FrameCommand::Other(command) => {
                tracing::debug!(command = %command, "Passing through unknown frame command");
                Ok(Disposition::PassThrough)
            }
        }
    }

    fn on_connect(&self, session: &mut FrameSession, frame: &Frame) -> GatewayResult<Disposition> {
        if session.state != ConnState::Unauthenticated {
            return Err(GatewayError::validation("session already authenticated"));
        }

        let header = frame
            .header(AUTHORIZATION_HEADER)
            .ok_or_else(|| GatewayError::authentication("missing Authorization header"))?;

        let principal = self.auth.verify_bearer(header)?;

        session.state = ConnState::Authenticated;
        session.principal = Some(principal.clone());
        tracing::info!(principal = %principal.name, "Connection authenticated");
        Ok(Disposition::Connected(principal))
    }

    fn on_subscribe(&self, session: &mut FrameSession, frame: &Frame) -> GatewayResult<Disposition> {
        let principal = self.require_authenticated(session)?;
        let destination = frame
            .destination()
            .ok_or_else(|| GatewayError::validation("SUBSCRIBE requires a destination"))?;

        self.rules.check(principal, destination)?;

        tracing::info!(
            principal = %principal.name,
            destination = %destination,
            "Subscription authorized"
        );
        Ok(Disposition::Subscribed {
            destination: destination.to_string(),
        })
    }

    fn on_send(&self, session: &mut FrameSession, frame: &Frame) -> GatewayResult<Disposition> {
        let principal = self.require_authenticated(session)?;
        let destination = frame
            .destination()
            .ok_or_else(|| GatewayError::validation("SEND requires a destination"))?;
        let payload = frame
            .payload
            .as_deref()
            .ok_or_else(|| GatewayError::validation("SEND requires a payload"))?;

        // validate -> sanitize -> encrypt, then the same rule set as SUBSCRIBE
        let ciphertext = self.payload.process(payload)?;
        self.rules.check(principal, destination)?;

        let (routing_key, target_principal) = self
            .rules
            .route(destination)
            .ok_or_else(|| GatewayError::authorization("destination has no route"))?;

        Ok(Disposition::Publish(ProcessedSend {
            destination: destination.to_string(),
            routing_key,
            target_principal,
            payload: ciphertext,
        }))
    }

    fn require_authenticated<'a>(&self, session: &'a FrameSession) -> GatewayResult<&'a Principal> {
        if session.state != ConnState::Authenticated {
            return Err(GatewayError::authorization("session is not authenticated"));
        }
        session
            .principal
            .as_ref()
            .ok_or_else(|| GatewayError::authorization("session has no principal"))
    }
}
