// ============================================================================
// Gateway orchestration
// ============================================================================
//
// Inbound:  frame -> FrameAuthorizer -> SessionRegistry -> Publisher.
// Outbound: broker delivery -> (RetryPipeline drives this handler) -> fan-out
//           to subscribed sessions via the SessionRegistry.
//
// Frame-level errors are answered with an explicit error event and never
// reach the broker; processing errors never reach the client.
//
// ============================================================================

use chrono::Utc;
use uuid::Uuid;

use crate::authorizer::Disposition;
use crate::broker::Delivery;
use crate::context::AppContext;
use crate::handlers::connection::ClientConnection;
use crate::message::{DeliveryMode, Envelope, Frame, ServerEvent};
use crate::metrics;
use crate::retry::ProcessingError;

/// Handle one inbound frame. Returns false when the connection should close.
pub async fn handle_frame(conn: &mut ClientConnection, ctx: &AppContext, frame: Frame) -> bool {
    ctx.registry.touch(conn.session_id()).await;

    let disposition = match ctx.authorizer.evaluate(conn.session_mut(), &frame) {
        Ok(disposition) => disposition,
        Err(error) => {
            error.log();
            metrics::FRAMES_REJECTED_TOTAL.inc();
            conn.send_error(error.error_code(), &error.to_string());
            return !error.closes_connection();
        }
    };

    match disposition {
        Disposition::Connected(principal) => {
            ctx.registry
                .register(conn.session_id(), &principal, conn.event_sender())
                .await;
            conn.send_event(ServerEvent::Connected {
                session_id: conn.session_id().to_string(),
                principal: principal.name,
            });
            true
        }

        Disposition::Subscribed { destination } => {
            if ctx.registry.subscribe(conn.session_id(), &destination).await {
                conn.send_event(ServerEvent::Subscribed { destination });
            } else {
                // registered state and connection state drifted apart
                tracing::warn!(session_id = %conn.session_id(), "Subscribe for unregistered session");
                conn.send_error("SESSION_NOT_FOUND", "session is not registered");
            }
            true
        }

        Disposition::Publish(send) => {
            let sender = conn
                .session()
                .principal
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_default();

            let envelope = Envelope {
                message_id: Uuid::new_v4().to_string(),
                destination: send.destination,
                routing_key: send.routing_key,
                sender,
                target_principal: send.target_principal,
                payload: send.payload,
                delivery_mode: DeliveryMode::Persistent,
                sent_at: Utc::now().timestamp_millis(),
            };

            match ctx.publisher.publish(&envelope).await {
                Ok(()) => {
                    conn.send_event(ServerEvent::Receipt {
                        message_id: envelope.message_id,
                        status: "accepted".to_string(),
                    });
                }
                Err(error) => {
                    error.log();
                    conn.send_error("PUBLISH_FAILED", "failed to enqueue message");
                }
            }
            true
        }

        Disposition::Disconnected => {
            ctx.registry.remove(conn.session_id()).await;
            tracing::info!(session_id = %conn.session_id(), "Session disconnected");
            false
        }

        Disposition::PassThrough => true,
    }
}

/// Consumer-side delivery handler, driven by the retry pipeline.
///
/// Deserializes the broker envelope (fatal on failure), resolves the target
/// sessions and writes to each transport. A failed write is isolated: it
/// removes that session and never aborts the rest of the fan-out.
pub async fn dispatch_delivery(ctx: &AppContext, delivery: Delivery) -> Result<(), ProcessingError> {
    let envelope: Envelope = serde_json::from_slice(&delivery.payload)?;

    if envelope.destination.is_empty() {
        return Err(ProcessingError::InvalidArgument(
            "envelope has no destination".to_string(),
        ));
    }

    let targets = match &envelope.target_principal {
        Some(principal) => ctx.registry.sessions_of_principal(principal).await,
        None => ctx.registry.subscribers_of(&envelope.destination).await,
    };

    if targets.is_empty() {
        tracing::debug!(
            message_id = %envelope.message_id,
            destination = %envelope.destination,
            "No live subscribers for delivery"
        );
        return Ok(());
    }

    let event = ServerEvent::Message {
        message_id: envelope.message_id.clone(),
        destination: envelope.destination.clone(),
        sender: envelope.sender.clone(),
        payload: envelope.payload.clone(),
        sent_at: envelope.sent_at,
    };

    let total = targets.len();
    let mut delivered = 0usize;
    for (session_id, handle) in targets {
        match handle.send(event.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    message_id = %envelope.message_id,
                    error = %e,
                    "Transport gone, removing session"
                );
                ctx.registry.remove(&session_id).await;
            }
        }
    }

    tracing::debug!(
        message_id = %envelope.message_id,
        destination = %envelope.destination,
        total = total,
        delivered = delivered,
        "Delivery fanned out"
    );
    Ok(())
}
